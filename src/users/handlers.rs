use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, instrument, warn};

use crate::{
    state::AppState,
    users::{
        dto::{
            BatchCreateRequest, CountResponse, CreateUserRequest, FirstUserQuery, ListUsersQuery,
            SearchQuery, UpdateUserRequest, MAX_LIMIT,
        },
        repo::RepoError,
        repo_types::{NewUser, User, UserBasicInfo, UserPatch},
        services::{CreateOutcome, ServiceError, UserListing},
    },
};

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/batch", post(create_users_batch))
        .route("/users/ensure", post(ensure_user))
        .route("/users/count", get(count_users))
        .route("/users/basic", get(list_basic_info))
        .route("/users/search", get(search_users))
        .route("/users/first", get(first_user))
        .route("/users/by-email/:email", get(get_user_by_email))
        .route(
            "/users/:id",
            get(get_user).patch(update_user).delete(delete_user),
        )
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn checked_new_user(req: CreateUserRequest) -> ApiResult<NewUser> {
    let mut data = NewUser::from(req);
    data.email = data.email.trim().to_string();
    if !is_valid_email(&data.email) {
        warn!(email = %data.email, "invalid email");
        return Err((StatusCode::BAD_REQUEST, "Invalid email".into()));
    }
    Ok(data)
}

fn checked_paging(q: &ListUsersQuery) -> ApiResult<(Option<u32>, Option<u32>)> {
    if q.page == Some(0) {
        return Err((StatusCode::BAD_REQUEST, "page must be >= 1".into()));
    }
    if q.limit == Some(0) {
        return Err((StatusCode::BAD_REQUEST, "limit must be >= 1".into()));
    }
    Ok((q.page, q.limit.map(|l| l.min(MAX_LIMIT))))
}

fn location(user: &User) -> ApiResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let value = HeaderValue::try_from(format!("/users/{}", user.id)).map_err(internal)?;
    headers.insert(header::LOCATION, value);
    Ok(headers)
}

fn into_http(e: ServiceError) -> (StatusCode, String) {
    match &e {
        ServiceError::UserNotFound { id } => {
            warn!(user_id = *id, "user not found");
            (StatusCode::NOT_FOUND, e.to_string())
        }
        ServiceError::Repository(RepoError::NotFound) => {
            warn!(error = %e, "user vanished before write");
            (StatusCode::NOT_FOUND, e.to_string())
        }
        ServiceError::Repository(RepoError::Conflict { .. }) => {
            warn!(error = %e, "conflict");
            (StatusCode::CONFLICT, e.to_string())
        }
        ServiceError::Repository(RepoError::Database(_)) => {
            error!(error = %e, "database failure");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn internal<E: std::error::Error>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    Query(q): Query<ListUsersQuery>,
) -> ApiResult<Json<UserListing>> {
    let (page, limit) = checked_paging(&q)?;
    let listing = state.users.get_users(page, limit).await.map_err(into_http)?;
    Ok(Json(listing))
}

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, HeaderMap, Json<User>)> {
    let data = checked_new_user(payload)?;
    let user = state.users.create_user(data).await.map_err(into_http)?;
    let headers = location(&user)?;
    Ok((StatusCode::CREATED, headers, Json(user)))
}

#[instrument(skip(state, payload))]
pub async fn create_users_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchCreateRequest>,
) -> ApiResult<(StatusCode, Json<Vec<User>>)> {
    let users = payload
        .users
        .into_iter()
        .map(checked_new_user)
        .collect::<ApiResult<Vec<_>>>()?;
    let created = state.users.create_users(users).await.map_err(into_http)?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[instrument(skip(state, payload))]
pub async fn ensure_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<CreateOutcome>)> {
    let data = checked_new_user(payload)?;
    let outcome = state
        .users
        .create_user_if_not_exists(data)
        .await
        .map_err(into_http)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[instrument(skip(state))]
pub async fn count_users(State(state): State<AppState>) -> ApiResult<Json<CountResponse>> {
    let count = state.users.get_users_count().await.map_err(into_http)?;
    Ok(Json(CountResponse { count }))
}

#[instrument(skip(state))]
pub async fn list_basic_info(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<UserBasicInfo>>> {
    let info = state.users.get_users_basic_info().await.map_err(into_http)?;
    Ok(Json(info))
}

#[instrument(skip(state))]
pub async fn search_users(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Json<Vec<User>>> {
    let users = state
        .users
        .search_users(q.email.as_deref())
        .await
        .map_err(into_http)?;
    Ok(Json(users))
}

#[instrument(skip(state))]
pub async fn first_user(
    State(state): State<AppState>,
    Query(q): Query<FirstUserQuery>,
) -> ApiResult<Json<Option<User>>> {
    let user = state
        .users
        .find_first_user(q.email.as_deref(), q.name.as_deref())
        .await
        .map_err(into_http)?;
    Ok(Json(user))
}

#[instrument(skip(state))]
pub async fn get_user_by_email(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<Json<Option<User>>> {
    let user = state
        .users
        .get_user_by_email(&email)
        .await
        .map_err(into_http)?;
    Ok(Json(user))
}

#[instrument(skip(state))]
pub async fn get_user(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<User>> {
    let user = state.users.get_user_by_id(id).await.map_err(into_http)?;
    Ok(Json(user))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateUserRequest>,
) -> ApiResult<Json<User>> {
    let mut patch = UserPatch::from(payload);
    if let Some(email) = patch.email.as_mut() {
        *email = email.trim().to_string();
        if !is_valid_email(email) {
            warn!(%email, "invalid email");
            return Err((StatusCode::BAD_REQUEST, "Invalid email".into()));
        }
    }
    let user = state
        .users
        .update_user(id, patch)
        .await
        .map_err(into_http)?;
    Ok(Json(user))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<User>> {
    let user = state.users.delete_user(id).await.map_err(into_http)?;
    info!(user_id = id, "user removed via api");
    Ok(Json(user))
}
