//! SQLite-backed encrypted [`Datastore`].
//!
//! Each login is serialized to JSON and sealed with AES-256-GCM under the
//! datastore key before it is written; nothing about a login is stored in
//! plaintext except its id.  The datastore key is derived from the scoped
//! key with HKDF (salt = account uid) and never written to disk.  A sealed
//! verifier row lets [`unlock`](Datastore::unlock) reject a wrong key
//! without touching any login.
//!
//! # Schema
//!
//! - `meta` -- `salt` (the account uid) and `verifier` (a sealed constant).
//! - `logins` -- `id` plus the sealed JSON blob.
//!
//! The connection lives behind `Arc<Mutex<Connection>>` and every query runs
//! on the blocking pool via `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lockwise_kernel::{Credential, NewCredential, UnlockKey};
use rusqlite::{Connection, OptionalExtension, params};

use crate::crypto;
use crate::datastore::{Datastore, InitOptions, apply_touch, new_login, sort_logins};
use crate::error::{Result, VaultError};

/// Plaintext sealed into the verifier row.
const VERIFIER: &[u8] = b"lockwise-verifier-v1";

#[derive(Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Encrypted login datastore backed by SQLite.
pub struct SqliteDatastore {
    location: Location,
    conn: Mutex<Option<Arc<Mutex<Connection>>>>,
    key: Mutex<Option<crypto::Key>>,
}

impl SqliteDatastore {
    /// A datastore kept in the database file at `path`.  The parent
    /// directory must already exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_location(Location::File(path.into()))
    }

    /// Default database location: `<data_dir>/logins.db`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("logins.db")
    }

    /// A datastore in a private in-memory database (useful for testing).
    pub fn in_memory() -> Self {
        Self::with_location(Location::Memory)
    }

    fn with_location(location: Location) -> Self {
        Self {
            location,
            conn: Mutex::new(None),
            key: Mutex::new(None),
        }
    }

    fn key_slot(&self) -> MutexGuard<'_, Option<crypto::Key>> {
        self.key.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| VaultError::Unreachable {
                reason: "datastore is not open".into(),
            })
    }

    fn unlocked_key(&self) -> Result<crypto::Key> {
        self.key_slot().clone().ok_or(VaultError::Locked)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await?
    }

    fn open_connection(location: &Location) -> Result<Connection> {
        let conn = match location {
            Location::File(path) => {
                tracing::info!(path = %path.display(), "opening login datastore");
                Connection::open(path).map_err(|e| VaultError::Unreachable {
                    reason: format!("{}: {e}", path.display()),
                })?
            }
            Location::Memory => Connection::open_in_memory()?,
        };
        configure_connection(&conn)?;
        run_migrations(&conn)?;
        Ok(conn)
    }

    async fn open_inner(&self) -> Result<()> {
        if self.connection().is_ok() {
            return Ok(());
        }

        let location = self.location.clone();
        let conn = tokio::task::spawn_blocking(move || Self::open_connection(&location)).await??;

        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        // A concurrent open may have won the race; keep the first connection.
        if slot.is_none() {
            *slot = Some(Arc::new(Mutex::new(conn)));
        }
        tracing::debug!("login datastore ready");
        Ok(())
    }

    async fn initialize_inner(&self, options: InitOptions) -> Result<()> {
        let key =
            crypto::derive_datastore_key(options.scoped_key.expose().as_bytes(), &options.salt)?;
        let verifier = crypto::seal(VERIFIER, &key)?;
        let salt = options.salt;

        self.execute(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM meta WHERE key = 'verifier')",
                [],
                |row| row.get(0),
            )?;
            if exists {
                return Err(VaultError::AlreadyInitialized);
            }
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('salt', ?1), ('verifier', ?2)",
                params![salt.as_bytes(), verifier],
            )?;
            Ok(())
        })
        .await?;

        tracing::info!("login datastore initialized");
        Ok(())
    }

    async fn unlock_inner(&self, scoped_key: &UnlockKey) -> Result<()> {
        let (salt, verifier) = self
            .execute(|conn| {
                let salt: Option<Vec<u8>> = conn
                    .query_row("SELECT value FROM meta WHERE key = 'salt'", [], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let verifier: Option<Vec<u8>> = conn
                    .query_row("SELECT value FROM meta WHERE key = 'verifier'", [], |row| {
                        row.get(0)
                    })
                    .optional()?;
                match (salt, verifier) {
                    (Some(salt), Some(verifier)) => Ok((salt, verifier)),
                    _ => Err(VaultError::NotInitialized),
                }
            })
            .await?;

        let salt = String::from_utf8(salt)
            .map_err(|_| VaultError::Internal("datastore salt is not valid UTF-8".into()))?;
        let key = crypto::derive_datastore_key(scoped_key.expose().as_bytes(), &salt)?;

        match crypto::open(&verifier, &key) {
            Ok(plain) if plain == VERIFIER => {}
            _ => return Err(VaultError::WrongKey),
        }

        *self.key_slot() = Some(key);
        tracing::debug!("login datastore unlocked");
        Ok(())
    }

    async fn list_inner(&self) -> Result<Vec<Credential>> {
        let key = self.unlocked_key()?;
        let mut logins = self
            .execute(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM logins")?;
                let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
                let mut logins = Vec::new();
                for blob in rows {
                    logins.push(open_login(&blob?, &key)?);
                }
                Ok(logins)
            })
            .await?;
        sort_logins(&mut logins);
        Ok(logins)
    }

    async fn add_inner(&self, login: NewCredential) -> Result<Credential> {
        let key = self.unlocked_key()?;
        let login = new_login(login);
        let blob = seal_login(&login, &key)?;
        let id = login.id.clone();

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO logins (id, data) VALUES (?1, ?2)",
                params![id, blob],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(id = %login.id, "login added");
        Ok(login)
    }

    async fn remove_inner(&self, id: &str) -> Result<()> {
        self.unlocked_key()?;
        let id = id.to_string();
        self.execute(move |conn| {
            let removed = conn.execute("DELETE FROM logins WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(VaultError::LoginNotFound { id });
            }
            Ok(())
        })
        .await
    }

    async fn touch_inner(&self, id: &str) -> Result<Credential> {
        let key = self.unlocked_key()?;
        let id = id.to_string();
        // Read-modify-write under the connection mutex: touches serialize and
        // the last one wins.
        self.execute(move |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row("SELECT data FROM logins WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(blob) = blob else {
                return Err(VaultError::LoginNotFound { id });
            };

            let mut login = open_login(&blob, &key)?;
            apply_touch(&mut login);
            let sealed = seal_login(&login, &key)?;
            conn.execute(
                "UPDATE logins SET data = ?1 WHERE id = ?2",
                params![sealed, id],
            )?;
            Ok(login)
        })
        .await
    }

    async fn reset_inner(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute_batch("DELETE FROM logins; DELETE FROM meta;")?;
            Ok(())
        })
        .await?;
        *self.key_slot() = None;
        tracing::info!("login datastore reset");
        Ok(())
    }
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn open(&self) -> lockwise_kernel::Result<()> {
        Ok(self.open_inner().await?)
    }

    async fn is_initialized(&self) -> lockwise_kernel::Result<bool> {
        let initialized = self
            .execute(|conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM meta WHERE key = 'verifier')",
                    [],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await?;
        Ok(initialized)
    }

    async fn initialize(&self, options: InitOptions) -> lockwise_kernel::Result<()> {
        Ok(self.initialize_inner(options).await?)
    }

    async fn unlock(&self, key: &UnlockKey) -> lockwise_kernel::Result<()> {
        Ok(self.unlock_inner(key).await?)
    }

    async fn lock(&self) -> lockwise_kernel::Result<()> {
        if self.key_slot().take().is_some() {
            tracing::debug!("login datastore locked");
        }
        Ok(())
    }

    async fn is_locked(&self) -> bool {
        self.key_slot().is_none()
    }

    async fn list(&self) -> lockwise_kernel::Result<Vec<Credential>> {
        Ok(self.list_inner().await?)
    }

    async fn add(&self, login: NewCredential) -> lockwise_kernel::Result<Credential> {
        Ok(self.add_inner(login).await?)
    }

    async fn remove(&self, id: &str) -> lockwise_kernel::Result<()> {
        Ok(self.remove_inner(id).await?)
    }

    async fn touch(&self, id: &str) -> lockwise_kernel::Result<Credential> {
        Ok(self.touch_inner(id).await?)
    }

    async fn reset(&self) -> lockwise_kernel::Result<()> {
        Ok(self.reset_inner().await?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Configure SQLite pragmas for performance and safety.
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<()> {
    tracing::debug!("running datastore schema migrations");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS logins (
            id   TEXT PRIMARY KEY,
            data BLOB NOT NULL
        );",
    )
    .map_err(|e| VaultError::MigrationFailed {
        reason: e.to_string(),
    })
}

fn seal_login(login: &Credential, key: &crypto::Key) -> Result<Vec<u8>> {
    let json = zeroize::Zeroizing::new(serde_json::to_vec(login)?);
    crypto::seal(&json, key)
}

fn open_login(blob: &[u8], key: &crypto::Key) -> Result<Credential> {
    let json = zeroize::Zeroizing::new(crypto::open(blob, key)?);
    Ok(serde_json::from_slice(&json)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use lockwise_kernel::LockwiseError;

    use super::*;

    fn options(key: &str, uid: &str) -> InitOptions {
        InitOptions {
            scoped_key: UnlockKey::new(key),
            salt: uid.into(),
        }
    }

    async fn unlocked_store() -> SqliteDatastore {
        let store = SqliteDatastore::in_memory();
        store.open().await.unwrap();
        store.initialize(options("scoped", "uid-1")).await.unwrap();
        store.unlock(&UnlockKey::new("scoped")).await.unwrap();
        store
    }

    fn login(origin: &str, user: &str) -> NewCredential {
        NewCredential {
            origin: origin.into(),
            username: Some(user.into()),
            password: "hunter2".into(),
        }
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let store = SqliteDatastore::in_memory();
        store.open().await.unwrap();
        store.open().await.unwrap();
        assert!(!store.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_path_is_storage_unavailable() {
        let store = SqliteDatastore::new("/nonexistent-lockwise-dir/sub/logins.db");
        let err = store.open().await.unwrap_err();
        assert!(matches!(err, LockwiseError::StorageUnavailable { .. }));
    }

    #[tokio::test]
    async fn operations_before_open_fail() {
        let store = SqliteDatastore::in_memory();
        assert!(store.is_initialized().await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let store = SqliteDatastore::in_memory();
        store.open().await.unwrap();
        store.initialize(options("scoped", "uid-1")).await.unwrap();

        let err = store.unlock(&UnlockKey::new("wrong")).await.unwrap_err();
        assert!(matches!(err, LockwiseError::AuthenticationFailed { .. }));
        assert!(store.is_locked().await);
    }

    #[tokio::test]
    async fn double_initialize_fails() {
        let store = SqliteDatastore::in_memory();
        store.open().await.unwrap();
        store.initialize(options("scoped", "uid-1")).await.unwrap();
        assert!(store.initialize(options("other", "uid-1")).await.is_err());
    }

    #[tokio::test]
    async fn unlock_before_initialize() {
        let store = SqliteDatastore::in_memory();
        store.open().await.unwrap();
        assert_eq!(
            store.unlock(&UnlockKey::new("k")).await.unwrap_err(),
            LockwiseError::NotInitialized
        );
    }

    #[tokio::test]
    async fn add_list_remove() {
        let store = unlocked_store().await;
        let b = store.add(login("https://b.example", "bob")).await.unwrap();
        let a = store.add(login("https://a.example", "ann")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
        assert_eq!(listed[0].password.expose(), "hunter2");

        store.remove(&a.id).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(matches!(
            store.remove(&a.id).await,
            Err(LockwiseError::CredentialNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn locked_datastore_refuses_logins() {
        let store = unlocked_store().await;
        store.add(login("https://a.example", "ann")).await.unwrap();
        store.lock().await.unwrap();

        assert_eq!(store.list().await.unwrap_err(), LockwiseError::NotUnlocked);
        assert_eq!(
            store
                .add(login("https://b.example", "bob"))
                .await
                .unwrap_err(),
            LockwiseError::NotUnlocked
        );

        store.unlock(&UnlockKey::new("scoped")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn touch_is_last_writer_wins() {
        let store = Arc::new(unlocked_store().await);
        let added = store.add(login("https://a.example", "ann")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = added.id.clone();
            tasks.push(tokio::spawn(async move { store.touch(&id).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].times_used, 8);
    }

    #[tokio::test]
    async fn reset_returns_to_uninitialized() {
        let store = unlocked_store().await;
        store.add(login("https://a.example", "ann")).await.unwrap();

        store.reset().await.unwrap();
        assert!(store.is_locked().await);
        assert!(!store.is_initialized().await.unwrap());

        store.initialize(options("new-key", "uid-2")).await.unwrap();
        store.unlock(&UnlockKey::new("new-key")).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
