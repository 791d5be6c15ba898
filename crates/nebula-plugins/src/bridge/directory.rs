//! Host data facade guarded by the bridge.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::Serialize;

/// Errors from a [`HostDirectory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// The user does not exist.
    #[error("user '{username}' not found in {db_name}")]
    UserNotFound {
        /// Database searched.
        db_name: String,
        /// Missing user.
        username: String,
    },
    /// The backing store failed.
    #[error("directory backend failed: {0}")]
    Backend(String),
}

/// A user as stored by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    /// Host-assigned id.
    pub id: u64,
    /// Unique within its database.
    pub username: String,
    /// Email, empty if unknown.
    pub email: String,
    /// Staff flag.
    pub is_staff: bool,
    /// Whether the account is active.
    pub is_active: bool,
    /// Identity tag, if assigned.
    pub role_tag: Option<String>,
    /// Last writer, e.g. `plugin:sample_sync`.
    pub updated_by: Option<String>,
}

/// An identity role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleRecord {
    /// Normalised role token.
    pub name: String,
    /// Description.
    pub description: String,
    /// Whether members are staff.
    pub is_staff: bool,
    /// Last writer.
    pub updated_by: Option<String>,
}

/// Fields for [`HostDirectory::upsert_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpsert {
    /// Username.
    pub username: String,
    /// Email; empty keeps the stored one.
    pub email: String,
    /// Active flag.
    pub is_active: bool,
    /// Writer.
    pub updated_by: String,
}

/// Whether an upsert inserted or modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    /// New row.
    Created,
    /// Existing row.
    Updated,
}

impl Upserted {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

/// Users, identity roles and identity tags, per database.
#[async_trait]
pub trait HostDirectory: Send + Sync {
    /// Insert or update a user by username.
    async fn upsert_user(
        &self,
        db_name: &str,
        user: UserUpsert,
    ) -> Result<(UserRecord, Upserted), DirectoryError>;

    /// Page through users ordered by id.
    async fn list_users(
        &self,
        db_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserRecord>, DirectoryError>;

    /// All identity roles ordered by name.
    async fn list_roles(&self) -> Result<Vec<RoleRecord>, DirectoryError>;

    /// Insert or replace a role.
    async fn upsert_role(&self, role: RoleRecord) -> Result<RoleRecord, DirectoryError>;

    /// Assign an identity tag to an existing user.
    async fn set_identity_tag(
        &self,
        db_name: &str,
        username: &str,
        role_tag: &str,
        updated_by: &str,
    ) -> Result<UserRecord, DirectoryError>;
}

type Users = HashMap<String, BTreeMap<String, UserRecord>>;

/// In-memory directory, used by the CLI and tests.
#[derive(Debug)]
pub struct InMemoryDirectory {
    users: RwLock<Users>,
    roles: RwLock<BTreeMap<String, RoleRecord>>,
    next_id: AtomicU64,
}

impl InMemoryDirectory {
    /// An empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            roles: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed a role.
    #[must_use]
    pub fn with_role(self, name: &str, description: &str, is_staff: bool) -> Self {
        self.roles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                RoleRecord {
                    name: name.to_string(),
                    description: description.to_string(),
                    is_staff,
                    updated_by: None,
                },
            );
        self
    }

    /// Seed a user.
    #[must_use]
    pub fn with_user(self, db_name: &str, username: &str, is_staff: bool, role_tag: Option<&str>) -> Self {
        let id = self.allocate_id();
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(db_name.to_string())
            .or_default()
            .insert(
                username.to_string(),
                UserRecord {
                    id,
                    username: username.to_string(),
                    email: String::new(),
                    is_staff,
                    is_active: true,
                    role_tag: role_tag.map(str::to_string),
                    updated_by: None,
                },
            );
        self
    }

    /// Copy of every user in `db_name`, ordered by username.
    #[must_use]
    pub fn users(&self, db_name: &str) -> Vec<UserRecord> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(db_name)
            .map(|db| db.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of every role.
    #[must_use]
    pub fn roles(&self) -> Vec<RoleRecord> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostDirectory for InMemoryDirectory {
    async fn upsert_user(
        &self,
        db_name: &str,
        user: UserUpsert,
    ) -> Result<(UserRecord, Upserted), DirectoryError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let db = users.entry(db_name.to_string()).or_default();
        if let Some(existing) = db.get_mut(&user.username) {
            if !user.email.is_empty() {
                existing.email = user.email;
            }
            existing.is_active = user.is_active;
            existing.updated_by = Some(user.updated_by);
            return Ok((existing.clone(), Upserted::Updated));
        }
        let record = UserRecord {
            id: self.allocate_id(),
            username: user.username.clone(),
            email: user.email,
            is_staff: false,
            is_active: user.is_active,
            role_tag: None,
            updated_by: Some(user.updated_by),
        };
        db.insert(user.username, record.clone());
        Ok((record, Upserted::Created))
    }

    async fn list_users(
        &self,
        db_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserRecord>, DirectoryError> {
        let mut all = self.users(db_name);
        all.sort_by_key(|u| u.id);
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, DirectoryError> {
        Ok(self.roles())
    }

    async fn upsert_role(&self, role: RoleRecord) -> Result<RoleRecord, DirectoryError> {
        self.roles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role.name.clone(), role.clone());
        Ok(role)
    }

    async fn set_identity_tag(
        &self,
        db_name: &str,
        username: &str,
        role_tag: &str,
        updated_by: &str,
    ) -> Result<UserRecord, DirectoryError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let user = users
            .get_mut(db_name)
            .and_then(|db| db.get_mut(username))
            .ok_or_else(|| DirectoryError::UserNotFound {
                db_name: db_name.to_string(),
                username: username.to_string(),
            })?;
        user.role_tag = Some(role_tag.to_string());
        user.updated_by = Some(updated_by.to_string());
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(name: &str) -> UserUpsert {
        UserUpsert {
            username: name.into(),
            email: format!("{name}@example.local"),
            is_active: true,
            updated_by: "plugin:test".into(),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let dir = InMemoryDirectory::new();
        let (first, kind) = dir.upsert_user("system.db", upsert("alice")).await.unwrap();
        assert_eq!(kind, Upserted::Created);
        let (second, kind) = dir.upsert_user("system.db", upsert("alice")).await.unwrap();
        assert_eq!(kind, Upserted::Updated);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_list_pages_by_id() {
        let dir = InMemoryDirectory::new()
            .with_user("system.db", "zed", false, None)
            .with_user("system.db", "amy", true, Some("admin"));
        let page = dir.list_users("system.db", 1, 0).await.unwrap();
        assert_eq!(page[0].username, "zed");
        let page = dir.list_users("system.db", 10, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].username, "amy");
    }

    #[tokio::test]
    async fn test_tag_requires_existing_user() {
        let dir = InMemoryDirectory::new();
        let err = dir
            .set_identity_tag("system.db", "ghost", "user", "plugin:test")
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::UserNotFound { .. }));
    }
}
