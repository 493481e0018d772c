use std::cmp::Ordering;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::users::repo::{RepoError, UserRepository};
use crate::users::repo_types::{
    FindManyArgs, NewUser, SortDirection, User, UserBasicInfo, UserFilter, UserKey, UserOrder,
    UserOrderField, UserPatch,
};

/// Process-local `UserRepository`, used when no database is configured and in tests.
///
/// Mirrors the Postgres table: ids come from a sequence, email is unique,
/// and substring matching is case-sensitive.
#[derive(Default)]
pub struct InMemoryUserRepository {
    inner: RwLock<Table>,
}

#[derive(Default, Clone)]
struct Table {
    rows: Vec<User>,
    last_id: i64,
}

impl Table {
    fn email_taken(&self, email: &str, except: Option<i64>) -> bool {
        self.rows
            .iter()
            .any(|u| u.email == email && Some(u.id) != except)
    }

    fn insert(&mut self, data: NewUser) -> Result<User, RepoError> {
        if self.email_taken(&data.email, None) {
            return Err(duplicate_email(&data.email));
        }
        self.last_id += 1;
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: self.last_id,
            email: data.email,
            name: data.name,
            created_at: now,
            updated_at: now,
        };
        self.rows.push(user.clone());
        Ok(user)
    }

    fn position(&self, key: &UserKey) -> Option<usize> {
        self.rows.iter().position(|u| key.matches(u))
    }
}

fn duplicate_email(email: &str) -> RepoError {
    RepoError::Conflict {
        message: format!("duplicate key value violates unique constraint on email ({email})"),
    }
}

fn compare(a: &User, b: &User, order: UserOrder) -> Ordering {
    let ord = match order.field {
        UserOrderField::Id => a.id.cmp(&b.id),
        UserOrderField::Email => a.email.cmp(&b.email),
        // NULLS LAST ascending, like Postgres.
        UserOrderField::Name => (a.name.is_none(), &a.name).cmp(&(b.name.is_none(), &b.name)),
        UserOrderField::CreatedAt => a.created_at.cmp(&b.created_at),
    };
    let ord = match order.direction {
        SortDirection::Asc => ord,
        SortDirection::Desc => ord.reverse(),
    };
    ord.then_with(|| a.id.cmp(&b.id))
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, data: NewUser) -> Result<User, RepoError> {
        self.inner.write().await.insert(data)
    }

    async fn find_many(&self, args: FindManyArgs) -> Result<Vec<User>, RepoError> {
        let table = self.inner.read().await;
        let mut rows: Vec<User> = table
            .rows
            .iter()
            .filter(|u| args.filter.matches(u))
            .cloned()
            .collect();
        match args.order {
            Some(order) => rows.sort_by(|a, b| compare(a, b, order)),
            None => rows.sort_by_key(|u| u.id),
        }
        let skip = usize::try_from(args.skip.unwrap_or(0).max(0)).unwrap_or(usize::MAX);
        let take = args
            .take
            .map_or(usize::MAX, |t| usize::try_from(t.max(0)).unwrap_or(usize::MAX));
        Ok(rows.into_iter().skip(skip).take(take).collect())
    }

    async fn find_unique(&self, key: UserKey) -> Result<Option<User>, RepoError> {
        let table = self.inner.read().await;
        Ok(table.rows.iter().find(|u| key.matches(u)).cloned())
    }

    async fn find_first(&self, filter: UserFilter) -> Result<Option<User>, RepoError> {
        let table = self.inner.read().await;
        Ok(table
            .rows
            .iter()
            .filter(|u| filter.matches(u))
            .min_by_key(|u| u.id)
            .cloned())
    }

    async fn update(&self, key: UserKey, patch: UserPatch) -> Result<User, RepoError> {
        let mut table = self.inner.write().await;
        let idx = table.position(&key).ok_or(RepoError::NotFound)?;
        let id = table.rows[idx].id;
        if let Some(email) = &patch.email {
            if table.email_taken(email, Some(id)) {
                return Err(duplicate_email(email));
            }
        }
        let user = &mut table.rows[idx];
        if let Some(email) = patch.email {
            user.email = email;
        }
        if let Some(name) = patch.name {
            user.name = Some(name);
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn delete(&self, key: UserKey) -> Result<User, RepoError> {
        let mut table = self.inner.write().await;
        let idx = table.position(&key).ok_or(RepoError::NotFound)?;
        Ok(table.rows.remove(idx))
    }

    async fn count(&self, filter: UserFilter) -> Result<u64, RepoError> {
        let table = self.inner.read().await;
        Ok(table.rows.iter().filter(|u| filter.matches(u)).count() as u64)
    }

    async fn find_basic_info(&self, filter: UserFilter) -> Result<Vec<UserBasicInfo>, RepoError> {
        let rows = self
            .find_many(FindManyArgs {
                filter,
                ..Default::default()
            })
            .await?;
        Ok(rows.into_iter().map(UserBasicInfo::from).collect())
    }

    async fn create_many_with_transaction(
        &self,
        users: Vec<NewUser>,
    ) -> Result<Vec<User>, RepoError> {
        let mut table = self.inner.write().await;
        // Stage on a copy; the table is only replaced once every insert succeeded.
        let mut staged = table.clone();
        let mut created = Vec::with_capacity(users.len());
        for data in users {
            created.push(staged.insert(data)?);
        }
        *table = staged;
        Ok(created)
    }

    async fn find_by_email_pattern(&self, pattern: &str) -> Result<Vec<User>, RepoError> {
        self.find_many(FindManyArgs {
            filter: UserFilter {
                email_contains: Some(pattern.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::repo_types::PageRequest;

    fn new_user(email: &str, name: &str) -> NewUser {
        NewUser {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    async fn seeded(n: usize) -> InMemoryUserRepository {
        let repo = InMemoryUserRepository::new();
        for i in 0..n {
            repo.create(new_user(&format!("user{i}@example.com"), &format!("User {i}")))
                .await
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids() {
        let repo = InMemoryUserRepository::new();
        let a = repo.create(new_user("a@x.com", "A")).await.unwrap();
        let b = repo.create(new_user("b@x.com", "B")).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.created_at, a.updated_at);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("a@x.com", "A")).await.unwrap();
        let err = repo.create(new_user("a@x.com", "A2")).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict { .. }));
        assert_eq!(repo.count(UserFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_unique_by_id_and_email() {
        let repo = InMemoryUserRepository::new();
        let a = repo.create(new_user("a@x.com", "A")).await.unwrap();
        assert_eq!(repo.find_unique(UserKey::Id(a.id)).await.unwrap(), Some(a.clone()));
        assert_eq!(
            repo.find_unique(UserKey::Email("a@x.com".into())).await.unwrap(),
            Some(a)
        );
        assert_eq!(repo.find_unique(UserKey::Id(999)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_many_without_bounds_returns_everything() {
        let repo = seeded(12).await;
        let all = repo.find_many(FindManyArgs::default()).await.unwrap();
        assert_eq!(all.len(), 12);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn find_first_picks_lowest_id() {
        let repo = seeded(3).await;
        let first = repo
            .find_first(UserFilter {
                email_contains: Some("example.com".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.email, "user0@example.com");
        let none = repo
            .find_first(UserFilter {
                email: Some("missing@example.com".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn update_missing_key_is_store_not_found() {
        let repo = InMemoryUserRepository::new();
        let err = repo
            .update(UserKey::Id(1), UserPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound));
    }

    #[tokio::test]
    async fn update_applies_only_given_fields() {
        let repo = InMemoryUserRepository::new();
        let a = repo.create(new_user("a@x.com", "A")).await.unwrap();
        let updated = repo
            .update(
                UserKey::Id(a.id),
                UserPatch {
                    name: Some("Alice".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email, "a@x.com");
        assert_eq!(updated.name.as_deref(), Some("Alice"));
        assert!(updated.updated_at >= a.updated_at);
    }

    #[tokio::test]
    async fn update_to_taken_email_conflicts() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("a@x.com", "A")).await.unwrap();
        let b = repo.create(new_user("b@x.com", "B")).await.unwrap();
        let err = repo
            .update(
                UserKey::Id(b.id),
                UserPatch {
                    email: Some("a@x.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_returns_last_state() {
        let repo = InMemoryUserRepository::new();
        let a = repo.create(new_user("a@x.com", "A")).await.unwrap();
        let gone = repo.delete(UserKey::Email("a@x.com".into())).await.unwrap();
        assert_eq!(gone, a);
        let err = repo.delete(UserKey::Id(a.id)).await.unwrap_err();
        assert!(matches!(err, RepoError::NotFound));
    }

    #[tokio::test]
    async fn transaction_commits_all_or_nothing() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("taken@x.com", "T")).await.unwrap();

        let err = repo
            .create_many_with_transaction(vec![
                new_user("one@x.com", "1"),
                new_user("two@x.com", "2"),
                new_user("taken@x.com", "dup"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict { .. }));
        assert_eq!(repo.count(UserFilter::default()).await.unwrap(), 1);

        let created = repo
            .create_many_with_transaction(vec![new_user("one@x.com", "1"), new_user("two@x.com", "2")])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(repo.count(UserFilter::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn transaction_rejects_duplicates_within_batch() {
        let repo = InMemoryUserRepository::new();
        let err = repo
            .create_many_with_transaction(vec![new_user("d@x.com", "1"), new_user("d@x.com", "2")])
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict { .. }));
        assert_eq!(repo.count(UserFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn email_pattern_is_case_sensitive_substring() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("alice@corp.io", "A")).await.unwrap();
        repo.create(new_user("bob@home.net", "B")).await.unwrap();
        let hits = repo.find_by_email_pattern("corp").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].email, "alice@corp.io");
        assert!(repo.find_by_email_pattern("CORP").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn email_pattern_wildcards_match_literally() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("a_b@x.com", "A")).await.unwrap();
        repo.create(new_user("acb@x.com", "C")).await.unwrap();
        let hits = repo.find_by_email_pattern("a_b").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].email, "a_b@x.com");
        assert!(repo.find_by_email_pattern("%").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn basic_info_projects_identity_fields() {
        let repo = seeded(2).await;
        let info = repo.find_basic_info(UserFilter::default()).await.unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].email, "user0@example.com");
        assert_eq!(info[0].name.as_deref(), Some("User 0"));
    }

    #[tokio::test]
    async fn second_page_of_fifteen() {
        let repo = seeded(15).await;
        let page = repo
            .find_many_paginated(PageRequest::new(2, 10), UserFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(page.data.len(), 5);
        assert_eq!(page.total, 15);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.page, 2);
        assert_eq!(page.limit, 10);
        assert_eq!(page.data[0].email, "user10@example.com");
    }

    #[tokio::test]
    async fn pages_never_exceed_limit() {
        let repo = seeded(23).await;
        for limit in 1..=25u32 {
            let pages = crate::users::repo_types::total_pages(23, limit);
            for page in 1..=(pages as u32 + 1) {
                let result = repo
                    .find_many_paginated(PageRequest::new(page, limit), UserFilter::default(), None)
                    .await
                    .unwrap();
                assert!(result.data.len() <= limit as usize);
                assert_eq!(result.total_pages, 23u64.div_ceil(u64::from(limit)));
            }
        }
    }

    #[tokio::test]
    async fn ordering_by_name_descending() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("a@x.com", "Ann")).await.unwrap();
        repo.create(new_user("c@x.com", "Cid")).await.unwrap();
        repo.create(new_user("b@x.com", "Bob")).await.unwrap();
        let page = repo
            .find_many_paginated(
                PageRequest::default(),
                UserFilter::default(),
                Some(UserOrder {
                    field: UserOrderField::Name,
                    direction: SortDirection::Desc,
                }),
            )
            .await
            .unwrap();
        let names: Vec<_> = page.data.iter().filter_map(|u| u.name.as_deref()).collect();
        assert_eq!(names, ["Cid", "Bob", "Ann"]);
    }
}
