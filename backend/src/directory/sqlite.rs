use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use thinkforward_common::{Role, SubscriptionTier};

use super::{
    non_blank, normalize_email, DirectoryError, FindOrCreate, ProfileUpdate, SocialLink,
    SocialLogin, Synced, User, UserDirectory,
};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        external_id TEXT UNIQUE,
        email TEXT NOT NULL UNIQUE,
        first_name TEXT,
        last_name TEXT,
        role TEXT NOT NULL DEFAULT 'Client',
        subscription_tier TEXT NOT NULL DEFAULT 'free',
        last_login_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS social_logins (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES users(id),
        provider TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        profile_data TEXT NOT NULL DEFAULT '{}',
        linked_at TEXT NOT NULL,
        last_used_at TEXT NOT NULL,
        UNIQUE (user_id, provider, provider_id)
    );

    CREATE INDEX IF NOT EXISTS idx_social_logins_user_id ON social_logins(user_id);
";

const USER_COLUMNS: &str = "id, external_id, email, first_name, last_name, role, \
                            subscription_tier, last_login_at, created_at, updated_at";

/// Insert attempts before `find_or_create` gives up on a contended record.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// SQLite-backed user directory.
///
/// Uniqueness of `external_id` and `email` is enforced by the schema, so
/// several processes may share one database file.
pub struct SqliteDirectory {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> DirectoryError {
    DirectoryError::Unavailable(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        external_id: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        role: Role::from(row.get::<_, String>(5)?),
        subscription_tier: SubscriptionTier::from(row.get::<_, String>(6)?),
        social_logins: Vec::new(),
        last_login_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn load_social_logins(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<SocialLogin>> {
    let mut stmt = conn.prepare(
        "SELECT provider, provider_id, profile_data, linked_at, last_used_at
         FROM social_logins WHERE user_id = ?1 ORDER BY seq",
    )?;
    let logins = stmt
        .query_map(params![user_id], |row| {
            Ok(SocialLogin {
                provider: row.get(0)?,
                provider_id: row.get(1)?,
                profile_data: row.get(2)?,
                linked_at: row.get(3)?,
                last_used_at: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(logins)
}

/// Load a user by one of its unique columns.
fn query_user(conn: &Connection, column: &str, value: &str) -> rusqlite::Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let user = conn.query_row(&sql, params![value], user_from_row).optional()?;

    match user {
        Some(mut user) => {
            user.social_logins = load_social_logins(conn, &user.id)?;
            Ok(Some(user))
        }
        None => Ok(None),
    }
}

fn require_user(conn: &Connection, user_id: &str) -> Result<User, DirectoryError> {
    query_user(conn, "id", user_id)
        .map_err(db_err)?
        .ok_or_else(|| DirectoryError::NotFound(user_id.to_string()))
}

fn try_find_or_create(
    conn: &mut Connection,
    external_id: &str,
    email: &str,
    profile: &ProfileUpdate,
) -> rusqlite::Result<FindOrCreate> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(user) = query_user(&tx, "external_id", external_id)? {
        return Ok(FindOrCreate {
            user,
            created: false,
            migrated: false,
        });
    }

    let now = Utc::now();

    if let Some(existing) = query_user(&tx, "email", email)? {
        tx.execute(
            "UPDATE users SET external_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![external_id, now, existing.id],
        )?;
        let user = query_user(&tx, "id", &existing.id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;

        tracing::info!(
            user_id = %user.id,
            previous_external_id = ?existing.external_id,
            external_id = %external_id,
            "Moved user to new external ID (matched by email)"
        );
        return Ok(FindOrCreate {
            user,
            created: false,
            migrated: true,
        });
    }

    let id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO users (id, external_id, email, first_name, last_name, role, subscription_tier, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            external_id,
            email,
            non_blank(profile.first_name.as_deref()),
            non_blank(profile.last_name.as_deref()),
            Role::default().as_str(),
            SubscriptionTier::default().as_str(),
            now,
            now,
        ],
    )?;
    let user = query_user(&tx, "id", &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    tx.commit()?;

    tracing::info!("Created new user: {} ({})", external_id, email);
    Ok(FindOrCreate {
        user,
        created: true,
        migrated: false,
    })
}

impl SqliteDirectory {
    /// Open (or create) the directory database.
    ///
    /// Accepts a plain path, a `sqlite:` URL or `:memory:`.
    pub fn open(database_url: &str) -> Result<Self, DirectoryError> {
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        tracing::info!("User directory initialized with database: {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking SQLite work off the async executor.
    ///
    /// The blocking task runs to completion even if the awaiting future is
    /// dropped, so writes are never cut short by a client disconnect.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DirectoryError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DirectoryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| DirectoryError::Unavailable(format!("directory task failed: {}", e)))?
    }
}

#[async_trait]
impl UserDirectory for SqliteDirectory {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, DirectoryError> {
        let external_id = external_id.to_string();
        self.with_conn(move |conn| query_user(conn, "external_id", &external_id).map_err(db_err))
            .await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DirectoryError> {
        let email = normalize_email(email);
        self.with_conn(move |conn| query_user(conn, "email", &email).map_err(db_err))
            .await
    }

    async fn find_or_create(
        &self,
        external_id: &str,
        email: &str,
        profile: &ProfileUpdate,
    ) -> Result<FindOrCreate, DirectoryError> {
        let external_id = external_id.trim().to_string();
        let email = normalize_email(email);
        if external_id.is_empty() || email.is_empty() {
            return Err(DirectoryError::Invalid(
                "external ID and email are required".to_string(),
            ));
        }
        let profile = profile.clone();

        self.with_conn(move |conn| {
            for attempt in 1..=MAX_CREATE_ATTEMPTS {
                match try_find_or_create(conn, &external_id, &email, &profile) {
                    Ok(result) => return Ok(result),
                    Err(e) if is_unique_violation(&e) => {
                        tracing::debug!(
                            external_id = %external_id,
                            attempt,
                            "User created concurrently, retrying as lookup"
                        );
                    }
                    Err(e) => return Err(db_err(e)),
                }
            }
            Err(DirectoryError::Unavailable(format!(
                "could not settle user record for {}",
                external_id
            )))
        })
        .await
    }

    async fn apply_profile_update(
        &self,
        user: &User,
        profile: &ProfileUpdate,
    ) -> Result<Synced, DirectoryError> {
        let user_id = user.id.clone();
        let profile = profile.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let current = require_user(&tx, &user_id)?;

            let mut email = current.email.clone();
            let mut first_name = current.first_name.clone();
            let mut last_name = current.last_name.clone();
            let mut changed = false;

            if let Some(new_email) = non_blank(profile.email.as_deref()).map(normalize_email) {
                if new_email != current.email {
                    let owner: Option<String> = tx
                        .query_row(
                            "SELECT id FROM users WHERE email = ?1",
                            params![new_email],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(db_err)?;
                    match owner {
                        Some(other) if other != current.id => {
                            tracing::warn!(
                                user_id = %current.id,
                                other_user_id = %other,
                                "Email already belongs to another user, keeping current email"
                            );
                        }
                        _ => {
                            email = new_email;
                            changed = true;
                        }
                    }
                }
            }

            if let Some(name) = non_blank(profile.first_name.as_deref()) {
                if current.first_name.as_deref() != Some(name) {
                    first_name = Some(name.to_string());
                    changed = true;
                }
            }

            if let Some(name) = non_blank(profile.last_name.as_deref()) {
                if current.last_name.as_deref() != Some(name) {
                    last_name = Some(name.to_string());
                    changed = true;
                }
            }

            if !changed {
                return Ok(Synced {
                    user: current,
                    changed: false,
                });
            }

            tx.execute(
                "UPDATE users SET email = ?1, first_name = ?2, last_name = ?3, updated_at = ?4 WHERE id = ?5",
                params![email, first_name, last_name, Utc::now(), user_id],
            )
            .map_err(db_err)?;
            let user = require_user(&tx, &user_id)?;
            tx.commit().map_err(db_err)?;

            tracing::debug!(user_id = %user_id, "Applied profile update");
            Ok(Synced { user, changed: true })
        })
        .await
    }

    async fn link_social_account(
        &self,
        user: &User,
        link: &SocialLink,
    ) -> Result<Synced, DirectoryError> {
        let user_id = user.id.clone();
        let link = link.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            require_user(&tx, &user_id)?;

            let now = Utc::now();
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO social_logins
                        (user_id, provider, provider_id, profile_data, linked_at, last_used_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        user_id,
                        link.provider,
                        link.provider_id,
                        link.profile_data,
                        link.linked_at.unwrap_or(now),
                        now,
                    ],
                )
                .map_err(db_err)?;

            if inserted == 0 {
                tx.execute(
                    "UPDATE social_logins SET last_used_at = ?1
                     WHERE user_id = ?2 AND provider = ?3 AND provider_id = ?4",
                    params![now, user_id, link.provider, link.provider_id],
                )
                .map_err(db_err)?;
            } else {
                tx.execute(
                    "UPDATE users SET updated_at = ?1 WHERE id = ?2",
                    params![now, user_id],
                )
                .map_err(db_err)?;
                tracing::info!(
                    user_id = %user_id,
                    provider = %link.provider,
                    "Linked social account"
                );
            }

            let user = require_user(&tx, &user_id)?;
            tx.commit().map_err(db_err)?;
            Ok(Synced {
                user,
                changed: inserted > 0,
            })
        })
        .await
    }

    async fn touch_last_login(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), DirectoryError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                    params![at, user_id],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Err(DirectoryError::NotFound(user_id));
            }
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<u64, DirectoryError> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                .map_err(db_err)?;
            Ok(count as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claim::{assert_none, assert_some};
    use serde_json::json;

    fn memory_directory() -> SqliteDirectory {
        SqliteDirectory::open(":memory:").unwrap()
    }

    fn names(first: &str, last: &str) -> ProfileUpdate {
        ProfileUpdate::names(Some(first.to_string()), Some(last.to_string()))
    }

    fn google(provider_id: &str) -> SocialLink {
        SocialLink {
            provider: "google".to_string(),
            provider_id: provider_id.to_string(),
            profile_data: json!({"email": "ana@gmail.com"}),
            linked_at: None,
        }
    }

    fn set_raw_column(dir: &SqliteDirectory, user_id: &str, column: &str, value: &str) {
        let conn = dir.conn.lock().unwrap();
        conn.execute(
            &format!("UPDATE users SET {} = ?1 WHERE id = ?2", column),
            params![value, user_id],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_new_user_defaults_to_free_client() {
        let dir = memory_directory();

        let result = dir.find_or_create("user_1", "Ana@Example.com", &names("Ana", "Silva")).await.unwrap();

        assert!(result.created);
        assert!(!result.migrated);
        assert_eq!(result.user.external_id.as_deref(), Some("user_1"));
        assert_eq!(result.user.email, "ana@example.com");
        assert_eq!(result.user.first_name.as_deref(), Some("Ana"));
        assert_eq!(result.user.role, Role::Client);
        assert_eq!(result.user.subscription_tier, SubscriptionTier::Free);
        assert!(result.user.social_logins.is_empty());
        assert_none!(result.user.last_login_at);
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let dir = memory_directory();

        let first = dir.find_or_create("user_1", "ana@example.com", &ProfileUpdate::default()).await.unwrap();
        let second = dir.find_or_create("user_1", "ana@example.com", &ProfileUpdate::default()).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.user.id, second.user.id);
        assert_eq!(dir.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blank_names_stored_as_none() {
        let dir = memory_directory();
        let result = dir.find_or_create("user_1", "a@x.com", &names("  ", "")).await.unwrap();
        assert_none!(result.user.first_name);
        assert_none!(result.user.last_name);
    }

    #[tokio::test]
    async fn test_email_match_moves_external_id() {
        let dir = memory_directory();
        let original = dir.find_or_create("E1", "a@x.com", &ProfileUpdate::default()).await.unwrap();

        let result = dir.find_or_create("E2", "A@X.com", &ProfileUpdate::default()).await.unwrap();

        assert!(!result.created);
        assert!(result.migrated);
        assert_eq!(result.user.id, original.user.id);
        assert_eq!(result.user.external_id.as_deref(), Some("E2"));
        assert_eq!(dir.count().await.unwrap(), 1);
        assert_none!(dir.find_by_external_id("E1").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_or_create_rejects_blank_email() {
        let dir = memory_directory();
        let result = dir.find_or_create("user_1", "   ", &ProfileUpdate::default()).await;
        assert!(matches!(result, Err(DirectoryError::Invalid(_))));
        assert_eq!(dir.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_profile_update_ignores_blank_values() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &names("Ana", "Silva")).await.unwrap().user;

        let update = ProfileUpdate {
            email: Some("".to_string()),
            first_name: Some("Ana".to_string()),
            last_name: Some("   ".to_string()),
        };
        let result = dir.apply_profile_update(&user, &update).await.unwrap();

        assert!(!result.changed);
        assert_eq!(result.user.email, "a@x.com");
        assert_eq!(result.user.last_name.as_deref(), Some("Silva"));
    }

    #[tokio::test]
    async fn test_profile_update_overwrites_present_values() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &names("Ana", "Silva")).await.unwrap().user;

        let update = ProfileUpdate {
            email: Some("Ana.New@X.com".to_string()),
            first_name: Some("Anna".to_string()),
            last_name: None,
        };
        let result = dir.apply_profile_update(&user, &update).await.unwrap();

        assert!(result.changed);
        assert_eq!(result.user.email, "ana.new@x.com");
        assert_eq!(result.user.first_name.as_deref(), Some("Anna"));
        assert_eq!(result.user.last_name.as_deref(), Some("Silva"));
        assert!(result.user.updated_at >= user.updated_at);
    }

    #[tokio::test]
    async fn test_profile_update_keeps_email_owned_by_someone_else() {
        let dir = memory_directory();
        dir.find_or_create("user_1", "taken@x.com", &ProfileUpdate::default()).await.unwrap();
        let user = dir.find_or_create("user_2", "mine@x.com", &ProfileUpdate::default()).await.unwrap().user;

        let update = ProfileUpdate {
            email: Some("taken@x.com".to_string()),
            first_name: Some("Bo".to_string()),
            last_name: None,
        };
        let result = dir.apply_profile_update(&user, &update).await.unwrap();

        assert!(result.changed);
        assert_eq!(result.user.email, "mine@x.com");
        assert_eq!(result.user.first_name.as_deref(), Some("Bo"));
    }

    #[tokio::test]
    async fn test_sync_never_touches_role_or_tier() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap().user;
        set_raw_column(&dir, &user.id, "role", "Admin");
        set_raw_column(&dir, &user.id, "subscription_tier", "growth");

        let result = dir.apply_profile_update(&user, &names("Ana", "Silva")).await.unwrap();
        let again = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap();

        assert_eq!(result.user.role, Role::Admin);
        assert_eq!(result.user.subscription_tier, SubscriptionTier::Growth);
        assert_eq!(again.user.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_unparseable_role_loads_as_unknown() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap().user;
        set_raw_column(&dir, &user.id, "role", "superuser");

        let loaded = assert_some!(dir.find_by_external_id("user_1").await.unwrap());
        assert_eq!(loaded.role, Role::Unknown);
    }

    #[tokio::test]
    async fn test_link_social_account_is_idempotent() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap().user;

        let first = dir.link_social_account(&user, &google("g-1")).await.unwrap();
        let second = dir.link_social_account(&user, &google("g-1")).await.unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.user.social_logins.len(), 1);

        let before = first.user.social_logins[0].last_used_at;
        let after = second.user.social_logins[0].last_used_at;
        assert!(after >= before);
        assert_eq!(
            first.user.social_logins[0].linked_at,
            second.user.social_logins[0].linked_at
        );
    }

    #[tokio::test]
    async fn test_social_logins_keep_link_order() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap().user;

        dir.link_social_account(&user, &google("g-2")).await.unwrap();
        let github = SocialLink {
            provider: "github".to_string(),
            provider_id: "gh-1".to_string(),
            profile_data: json!({}),
            linked_at: None,
        };
        dir.link_social_account(&user, &github).await.unwrap();
        let result = dir.link_social_account(&user, &google("g-1")).await.unwrap();

        let providers: Vec<_> = result
            .user
            .social_logins
            .iter()
            .map(|s| format!("{}:{}", s.provider, s.provider_id))
            .collect();
        assert_eq!(providers, vec!["google:g-2", "github:gh-1", "google:g-1"]);
        assert_some!(result.user.social_login("github", "gh-1"));
    }

    #[tokio::test]
    async fn test_link_for_missing_user_fails() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap().user;
        let mut ghost = user.clone();
        ghost.id = "missing".to_string();

        let result = dir.link_social_account(&ghost, &google("g-1")).await;
        assert!(matches!(result, Err(DirectoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_touch_last_login() {
        let dir = memory_directory();
        let user = dir.find_or_create("user_1", "a@x.com", &ProfileUpdate::default()).await.unwrap().user;
        let at = Utc::now();

        dir.touch_last_login(&user.id, at).await.unwrap();

        let loaded = assert_some!(dir.find_by_email("A@x.com").await.unwrap());
        assert_eq!(loaded.last_login_at, Some(at));
        assert!(matches!(
            dir.touch_last_login("missing", at).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_find_or_create_across_connections() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let first = Arc::new(SqliteDirectory::open(&path).unwrap());
        let second = Arc::new(SqliteDirectory::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let dir = if i % 2 == 0 { Arc::clone(&first) } else { Arc::clone(&second) };
            handles.push(tokio::spawn(async move {
                dir.find_or_create("user_race", "race@x.com", &ProfileUpdate::default())
                    .await
                    .unwrap()
                    .user
                    .id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(first.count().await.unwrap(), 1);
    }
}
