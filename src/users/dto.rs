use serde::{Deserialize, Serialize};

use crate::users::repo_types::{NewUser, UserPatch};

/// Upper bound on `limit` accepted from clients.
pub const MAX_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<CreateUserRequest> for NewUser {
    fn from(r: CreateUserRequest) -> Self {
        Self {
            email: r.email,
            name: r.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<UpdateUserRequest> for UserPatch {
    fn from(r: UpdateUserRequest) -> Self {
        Self {
            email: r.email,
            name: r.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub users: Vec<CreateUserRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FirstUserQuery {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}
