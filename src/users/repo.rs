use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::users::repo_types::{
    FindManyArgs, NewUser, PageRequest, PaginatedResult, User, UserBasicInfo, UserFilter,
    UserKey, UserOrder, UserPatch,
};

const USER_COLUMNS: &str = "id, email, name, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The row targeted by an update or delete does not exist.
    #[error("record to update or delete does not exist")]
    NotFound,
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {message}")]
    Conflict { message: String },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return RepoError::Conflict {
                    message: db.message().to_string(),
                };
            }
        }
        RepoError::Database(e)
    }
}

/// Persistence operations on users.
///
/// Implementations carry no business rules: absence is reported as `None`
/// by lookups and as [`RepoError::NotFound`] by update/delete.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, data: NewUser) -> Result<User, RepoError>;

    async fn find_many(&self, args: FindManyArgs) -> Result<Vec<User>, RepoError>;

    async fn find_unique(&self, key: UserKey) -> Result<Option<User>, RepoError>;

    /// First match in ascending id order.
    async fn find_first(&self, filter: UserFilter) -> Result<Option<User>, RepoError>;

    async fn update(&self, key: UserKey, patch: UserPatch) -> Result<User, RepoError>;

    /// Removes the user and returns its last state.
    async fn delete(&self, key: UserKey) -> Result<User, RepoError>;

    async fn count(&self, filter: UserFilter) -> Result<u64, RepoError>;

    async fn find_basic_info(&self, filter: UserFilter) -> Result<Vec<UserBasicInfo>, RepoError>;

    /// Inserts every user or none of them.
    async fn create_many_with_transaction(
        &self,
        users: Vec<NewUser>,
    ) -> Result<Vec<User>, RepoError>;

    /// Users whose email contains `pattern` as a literal, case-sensitive
    /// substring. `%` and `_` match only themselves.
    async fn find_by_email_pattern(&self, pattern: &str) -> Result<Vec<User>, RepoError>;

    /// Fetches one page and the matching total.
    ///
    /// The page and the count are two independent reads; under concurrent
    /// writes `total` may not agree with `data`.
    async fn find_many_paginated(
        &self,
        req: PageRequest,
        filter: UserFilter,
        order: Option<UserOrder>,
    ) -> Result<PaginatedResult<User>, RepoError> {
        let args = FindManyArgs {
            filter: filter.clone(),
            order,
            skip: Some(req.offset()),
            take: Some(i64::from(req.limit)),
        };
        let (data, total) = tokio::try_join!(self.find_many(args), self.count(filter))?;
        debug!(page = req.page, limit = req.limit, total, "page fetched");
        Ok(PaginatedResult::new(data, total, req.page, req.limit))
    }
}

/// `UserRepository` over the `users` table.
#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Escapes LIKE metacharacters so `part` matches literally under `ESCAPE '\'`.
fn escape_like(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &UserFilter) {
    qb.push(" WHERE TRUE");
    if let Some(email) = &filter.email {
        qb.push(" AND email = ").push_bind(email.clone());
    }
    if let Some(part) = &filter.email_contains {
        qb.push(" AND email LIKE '%' || ")
            .push_bind(escape_like(part))
            .push(r" || '%' ESCAPE '\'");
    }
    if let Some(part) = &filter.name_contains {
        qb.push(" AND name LIKE '%' || ")
            .push_bind(escape_like(part))
            .push(r" || '%' ESCAPE '\'");
    }
}

fn push_key(qb: &mut QueryBuilder<'_, Postgres>, key: &UserKey) {
    match key {
        UserKey::Id(id) => qb.push(" WHERE id = ").push_bind(*id),
        UserKey::Email(email) => qb.push(" WHERE email = ").push_bind(email.clone()),
    };
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, order: Option<UserOrder>) {
    match order {
        Some(o) => {
            qb.push(format!(
                " ORDER BY {} {}, id ASC",
                o.field.column(),
                o.direction.keyword()
            ));
        }
        None => {
            qb.push(" ORDER BY id ASC");
        }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, data: NewUser) -> Result<User, RepoError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, name)
            VALUES ($1, $2)
            RETURNING id, email, name, created_at, updated_at
            "#,
        )
        .bind(data.email)
        .bind(data.name)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_many(&self, args: FindManyArgs) -> Result<Vec<User>, RepoError> {
        let mut qb = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users"));
        push_filter(&mut qb, &args.filter);
        push_order(&mut qb, args.order);
        if let Some(take) = args.take {
            qb.push(" LIMIT ").push_bind(take);
        }
        if let Some(skip) = args.skip {
            qb.push(" OFFSET ").push_bind(skip);
        }
        let rows = qb.build_query_as::<User>().fetch_all(&self.db).await?;
        Ok(rows)
    }

    async fn find_unique(&self, key: UserKey) -> Result<Option<User>, RepoError> {
        let mut qb = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users"));
        push_key(&mut qb, &key);
        let user = qb.build_query_as::<User>().fetch_optional(&self.db).await?;
        Ok(user)
    }

    async fn find_first(&self, filter: UserFilter) -> Result<Option<User>, RepoError> {
        let mut qb = QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users"));
        push_filter(&mut qb, &filter);
        qb.push(" ORDER BY id ASC LIMIT 1");
        let user = qb.build_query_as::<User>().fetch_optional(&self.db).await?;
        Ok(user)
    }

    async fn update(&self, key: UserKey, patch: UserPatch) -> Result<User, RepoError> {
        if patch.is_empty() {
            debug!(?key, "empty patch, touching updated_at only");
        }
        let mut qb = QueryBuilder::new("UPDATE users SET updated_at = now()");
        if let Some(email) = patch.email {
            qb.push(", email = ").push_bind(email);
        }
        if let Some(name) = patch.name {
            qb.push(", name = ").push_bind(name);
        }
        push_key(&mut qb, &key);
        qb.push(format!(" RETURNING {USER_COLUMNS}"));
        qb.build_query_as::<User>()
            .fetch_optional(&self.db)
            .await?
            .ok_or(RepoError::NotFound)
    }

    async fn delete(&self, key: UserKey) -> Result<User, RepoError> {
        let mut qb = QueryBuilder::new("DELETE FROM users");
        push_key(&mut qb, &key);
        qb.push(format!(" RETURNING {USER_COLUMNS}"));
        qb.build_query_as::<User>()
            .fetch_optional(&self.db)
            .await?
            .ok_or(RepoError::NotFound)
    }

    async fn count(&self, filter: UserFilter) -> Result<u64, RepoError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM users");
        push_filter(&mut qb, &filter);
        let n: i64 = qb.build_query_scalar().fetch_one(&self.db).await?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    async fn find_basic_info(&self, filter: UserFilter) -> Result<Vec<UserBasicInfo>, RepoError> {
        let mut qb = QueryBuilder::new("SELECT id, email, name FROM users");
        push_filter(&mut qb, &filter);
        qb.push(" ORDER BY id ASC");
        let rows = qb
            .build_query_as::<UserBasicInfo>()
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    async fn create_many_with_transaction(
        &self,
        users: Vec<NewUser>,
    ) -> Result<Vec<User>, RepoError> {
        // Dropping `tx` on an early return rolls everything back.
        let mut tx = self.db.begin().await?;
        let mut created = Vec::with_capacity(users.len());
        for data in users {
            let user = sqlx::query_as::<_, User>(
                r#"
                INSERT INTO users (email, name)
                VALUES ($1, $2)
                RETURNING id, email, name, created_at, updated_at
                "#,
            )
            .bind(data.email)
            .bind(data.name)
            .fetch_one(&mut *tx)
            .await?;
            created.push(user);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn find_by_email_pattern(&self, pattern: &str) -> Result<Vec<User>, RepoError> {
        let rows = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, created_at, updated_at
            FROM users
            WHERE email LIKE '%' || $1 || '%' ESCAPE '\'
            ORDER BY id ASC
            "#,
        )
        .bind(escape_like(pattern))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}
