use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::users::repo::{RepoError, UserRepository};
use crate::users::repo_types::{
    FindManyArgs, NewUser, PageRequest, PaginatedResult, User, UserBasicInfo, UserFilter,
    UserKey, UserPatch, DEFAULT_LIMIT, DEFAULT_PAGE,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("User with ID {id} not found")]
    UserNotFound { id: i64 },
    #[error(transparent)]
    Repository(#[from] RepoError),
}

/// Result of [`UserService::get_users`].
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum UserListing {
    All(Vec<User>),
    Page(PaginatedResult<User>),
}

/// Result of [`UserService::create_user_if_not_exists`].
#[derive(Debug, Serialize)]
pub struct CreateOutcome {
    pub user: User,
    pub created: bool,
}

/// User business rules on top of a [`UserRepository`].
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    #[instrument(skip(self, data), fields(email = %data.email))]
    pub async fn create_user(&self, data: NewUser) -> Result<User, ServiceError> {
        let user = self.repo.create(data).await?;
        info!(user_id = user.id, "user created");
        Ok(user)
    }

    /// Unbounded list when neither `page` nor `limit` is given, otherwise a page
    /// with the missing value defaulted.
    #[instrument(skip(self))]
    pub async fn get_users(
        &self,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<UserListing, ServiceError> {
        if page.is_none() && limit.is_none() {
            let users = self.repo.find_many(FindManyArgs::default()).await?;
            return Ok(UserListing::All(users));
        }
        let req = PageRequest::new(page.unwrap_or(DEFAULT_PAGE), limit.unwrap_or(DEFAULT_LIMIT));
        let page = self
            .repo
            .find_many_paginated(req, UserFilter::default(), None)
            .await?;
        Ok(UserListing::Page(page))
    }

    #[instrument(skip(self))]
    pub async fn get_user_by_id(&self, id: i64) -> Result<User, ServiceError> {
        self.repo
            .find_unique(UserKey::Id(id))
            .await?
            .ok_or(ServiceError::UserNotFound { id })
    }

    /// Absence is a normal outcome here, unlike [`Self::get_user_by_id`].
    #[instrument(skip(self))]
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(self.repo.find_unique(UserKey::Email(email.to_string())).await?)
    }

    /// Check then write, in two round-trips. If the user disappears in between,
    /// the repository's `NotFound` is returned instead of `UserNotFound`.
    #[instrument(skip(self, patch))]
    pub async fn update_user(&self, id: i64, patch: UserPatch) -> Result<User, ServiceError> {
        self.get_user_by_id(id).await?;
        let user = self.repo.update(UserKey::Id(id), patch).await?;
        info!(user_id = id, "user updated");
        Ok(user)
    }

    /// Same check-then-act shape as [`Self::update_user`].
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: i64) -> Result<User, ServiceError> {
        self.get_user_by_id(id).await?;
        let user = self.repo.delete(UserKey::Id(id)).await?;
        info!(user_id = id, "user deleted");
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn search_users(&self, email_pattern: Option<&str>) -> Result<Vec<User>, ServiceError> {
        let users = match email_pattern.filter(|p| !p.is_empty()) {
            Some(pattern) => self.repo.find_by_email_pattern(pattern).await?,
            None => self.repo.find_many(FindManyArgs::default()).await?,
        };
        debug!(hits = users.len(), "search finished");
        Ok(users)
    }

    /// Lowest-id user whose email and name contain the given fragments.
    #[instrument(skip(self))]
    pub async fn find_first_user(
        &self,
        email_contains: Option<&str>,
        name_contains: Option<&str>,
    ) -> Result<Option<User>, ServiceError> {
        let filter = UserFilter {
            email_contains: email_contains.map(str::to_string),
            name_contains: name_contains.map(str::to_string),
            ..Default::default()
        };
        Ok(self.repo.find_first(filter).await?)
    }

    pub async fn get_users_count(&self) -> Result<u64, ServiceError> {
        Ok(self.repo.count(UserFilter::default()).await?)
    }

    pub async fn get_users_basic_info(&self) -> Result<Vec<UserBasicInfo>, ServiceError> {
        Ok(self.repo.find_basic_info(UserFilter::default()).await?)
    }

    #[instrument(skip(self, users), fields(count = users.len()))]
    pub async fn create_users(&self, users: Vec<NewUser>) -> Result<Vec<User>, ServiceError> {
        let created = self.repo.create_many_with_transaction(users).await?;
        info!(count = created.len(), "users created in batch");
        Ok(created)
    }

    /// Returns the existing user for `data.email`, or creates one.
    ///
    /// Lookup and insert are separate calls. Two concurrent callers with the same
    /// email can both miss the lookup; the loser gets `RepoError::Conflict` from
    /// the unique index.
    #[instrument(skip(self, data), fields(email = %data.email))]
    pub async fn create_user_if_not_exists(&self, data: NewUser) -> Result<CreateOutcome, ServiceError> {
        if let Some(user) = self
            .repo
            .find_unique(UserKey::Email(data.email.clone()))
            .await?
        {
            debug!(user_id = user.id, "user already exists");
            return Ok(CreateOutcome {
                user,
                created: false,
            });
        }
        let user = self.repo.create(data).await?;
        info!(user_id = user.id, "user created");
        Ok(CreateOutcome {
            user,
            created: true,
        })
    }
}
