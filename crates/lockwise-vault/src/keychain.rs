//! Secure key/value storage for session secrets.
//!
//! The session components persist a handful of small values across process
//! restarts: the account session blob, the scoped key that unlocks the
//! datastore, the auto-lock deadline and setting.  [`SecureStorage`]
//! abstracts over the platform backends that hold them:
//!
//! - **macOS**: Keychain Services generic passwords via `security-framework`
//! - **Fallback**: [`FileKeychain`], a JSON map sealed with a device-derived
//!   key
//! - **Tests**: [`MemoryKeychain`]
//!
//! # Security Notes
//!
//! - The file-based fallback is a compromise.  The device-derived key can be
//!   reconstructed by anyone with access to the same machine and account.
//! - The keychain file is restricted to the current user (mode 0600 on Unix).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use lockwise_kernel::SecretValue;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::Result;
#[cfg(target_os = "macos")]
use crate::error::VaultError;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over platform-specific secure storage.
///
/// Implementations must be `Send + Sync` so they can be shared across async
/// tasks.  Deleting a missing entry is not an error.
pub trait SecureStorage: Send + Sync {
    /// Store (or overwrite) the value under `key`.
    fn store(&self, key: &str, value: &SecretValue) -> lockwise_kernel::Result<()>;

    /// Retrieve the value under `key`, or `None` if nothing is stored.
    fn retrieve(&self, key: &str) -> lockwise_kernel::Result<Option<SecretValue>>;

    /// Remove the value under `key`.
    fn delete(&self, key: &str) -> lockwise_kernel::Result<()>;
}

// ---------------------------------------------------------------------------
// File-based fallback
// ---------------------------------------------------------------------------

/// Application salt mixed into the device-derived key.  Changing this
/// invalidates every existing keychain file.  Must be exactly
/// [`crypto::SALT_LEN`] (32) bytes.
const APP_SALT: &[u8; crypto::SALT_LEN] = b"lockwise-session-keychain-v1\x00\x00\x00\x00";

type Entries = BTreeMap<String, String>;

/// File-based keychain holding every entry in one sealed JSON map.
///
/// The file is a single [`crypto::seal`] blob of the JSON map, keyed by a
/// PBKDF2 key over hostname and username.
pub struct FileKeychain {
    path: PathBuf,
    device_key: OnceLock<crypto::Key>,
    /// Serializes read-modify-write cycles within the process.
    write_lock: Mutex<()>,
}

impl FileKeychain {
    /// Create a keychain stored at `path`.  The file is created on the first
    /// [`store`](SecureStorage::store).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device_key: OnceLock::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default file location: `<data_dir>/keychain.bin`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("keychain.bin")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key derived from machine-specific data: hostname, username and the
    /// application salt.  Derived once per instance.
    fn device_key(&self) -> &crypto::Key {
        self.device_key.get_or_init(|| {
            let hostname = get_hostname();
            let username = std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown-user".into());

            let mut material = Zeroizing::new(Vec::with_capacity(
                hostname.len() + username.len() + APP_SALT.len(),
            ));
            material.extend_from_slice(hostname.as_bytes());
            material.extend_from_slice(username.as_bytes());
            material.extend_from_slice(APP_SALT);

            crypto::derive_key_with_salt(&material, APP_SALT)
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let blob = std::fs::read(&self.path)?;
        let json = Zeroizing::new(crypto::open(&blob, self.device_key())?);
        Ok(serde_json::from_slice(&json)?)
    }

    fn save(&self, entries: &Entries) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_vec(entries)?);
        let blob = crypto::seal(&json, self.device_key())?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &blob)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }

    fn store_entry(&self, key: &str, value: &SecretValue) -> Result<()> {
        let _guard = self.guard();
        let mut entries = self.load()?;
        entries.insert(key.to_owned(), value.expose().to_owned());
        self.save(&entries)?;
        tracing::debug!(key, path = %self.path.display(), "stored keychain entry");
        Ok(())
    }

    fn retrieve_entry(&self, key: &str) -> Result<Option<SecretValue>> {
        let _guard = self.guard();
        let entries = self.load()?;
        Ok(entries.get(key).map(|v| SecretValue::new(v.as_str())))
    }

    fn delete_entry(&self, key: &str) -> Result<()> {
        let _guard = self.guard();
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
            tracing::debug!(key, path = %self.path.display(), "deleted keychain entry");
        }
        Ok(())
    }
}

impl SecureStorage for FileKeychain {
    fn store(&self, key: &str, value: &SecretValue) -> lockwise_kernel::Result<()> {
        Ok(self.store_entry(key, value)?)
    }

    fn retrieve(&self, key: &str) -> lockwise_kernel::Result<Option<SecretValue>> {
        Ok(self.retrieve_entry(key)?)
    }

    fn delete(&self, key: &str) -> lockwise_kernel::Result<()> {
        Ok(self.delete_entry(key)?)
    }
}

/// Best-effort system hostname, falling back to "unknown-host".
fn get_hostname() -> String {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown-host".into())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local storage.  Nothing survives a restart of the process, but
/// clones of one [`Arc`](std::sync::Arc) share state, which is what tests
/// need to simulate a restart.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<String, SecretValue>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, SecretValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl SecureStorage for MemoryKeychain {
    fn store(&self, key: &str, value: &SecretValue) -> lockwise_kernel::Result<()> {
        self.entries().insert(key.to_owned(), value.clone());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> lockwise_kernel::Result<Option<SecretValue>> {
        Ok(self.entries().get(key).cloned())
    }

    fn delete(&self, key: &str) -> lockwise_kernel::Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// macOS Keychain Services
// ---------------------------------------------------------------------------

/// The Security framework error code for "item not found"
/// (`errSecItemNotFound = -25300`).
#[cfg(target_os = "macos")]
const MACOS_ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// macOS Keychain Services integration via the `security-framework` crate.
///
/// Each entry is a generic password whose account name is the entry key.
#[cfg(target_os = "macos")]
pub struct MacOSKeychain {
    service_name: String,
}

#[cfg(target_os = "macos")]
impl MacOSKeychain {
    const DEFAULT_SERVICE: &'static str = "org.lockwise.session";

    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Use a custom service name, e.g. to keep test entries apart.
    pub fn with_service(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
        }
    }
}

#[cfg(target_os = "macos")]
impl Default for MacOSKeychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
impl SecureStorage for MacOSKeychain {
    fn store(&self, key: &str, value: &SecretValue) -> lockwise_kernel::Result<()> {
        use security_framework::passwords::set_generic_password;

        set_generic_password(&self.service_name, key, value.expose().as_bytes()).map_err(|e| {
            VaultError::KeychainWriteFailed {
                key: key.to_string(),
                reason: format!("macOS keychain write failed: {e}"),
            }
        })?;
        tracing::debug!(service = %self.service_name, key, "stored keychain entry");
        Ok(())
    }

    fn retrieve(&self, key: &str) -> lockwise_kernel::Result<Option<SecretValue>> {
        use security_framework::passwords::get_generic_password;

        match get_generic_password(&self.service_name, key) {
            Ok(data) => {
                let data = Zeroizing::new(data);
                let text = String::from_utf8(data.to_vec()).map_err(|_| {
                    VaultError::KeychainUnavailable {
                        reason: format!("keychain entry {key} is not valid UTF-8"),
                    }
                })?;
                Ok(Some(SecretValue::new(text)))
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain read failed: {e}"),
            }
            .into()),
        }
    }

    fn delete(&self, key: &str) -> lockwise_kernel::Result<()> {
        use security_framework::passwords::delete_generic_password;

        match delete_generic_password(&self.service_name, key) {
            Ok(()) => {
                tracing::debug!(service = %self.service_name, key, "deleted keychain entry");
                Ok(())
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain delete failed: {e}"),
            }
            .into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Returns the best available secure storage for the current platform.
///
/// - **macOS**: [`MacOSKeychain`] (Keychain Services)
/// - **Other platforms**: [`FileKeychain`] under `data_dir`
pub fn platform_keychain(data_dir: &Path) -> Box<dyn SecureStorage> {
    let _ = &data_dir;

    #[cfg(target_os = "macos")]
    {
        tracing::info!("using macOS Keychain Services for secure storage");
        Box::new(MacOSKeychain::new())
    }
    #[cfg(not(target_os = "macos"))]
    {
        let path = FileKeychain::default_path(data_dir);
        tracing::info!(path = %path.display(), "using file-based keychain for secure storage");
        Box::new(FileKeychain::new(path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretValue {
        SecretValue::new(s)
    }

    #[test]
    fn file_keychain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(FileKeychain::default_path(dir.path()));

        assert!(keychain.retrieve("logins-key").unwrap().is_none());

        keychain.store("logins-key", &secret("scoped")).unwrap();
        keychain.store("auto-lock-setting", &secret("one_hour")).unwrap();

        assert_eq!(
            keychain.retrieve("logins-key").unwrap().unwrap().expose(),
            "scoped"
        );
        assert_eq!(
            keychain
                .retrieve("auto-lock-setting")
                .unwrap()
                .unwrap()
                .expose(),
            "one_hour"
        );

        keychain.delete("logins-key").unwrap();
        assert!(keychain.retrieve("logins-key").unwrap().is_none());
        assert!(keychain.retrieve("auto-lock-setting").unwrap().is_some());
    }

    #[test]
    fn file_keychain_does_not_store_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("kc.bin"));
        keychain
            .store("logins-key", &secret("very-secret-value"))
            .unwrap();

        let raw = std::fs::read(keychain.path()).unwrap();
        let needle = b"very-secret-value";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn file_keychain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kc.bin");

        FileKeychain::new(&path)
            .store("account-session", &secret("{\"uid\":\"u\"}"))
            .unwrap();

        let reopened = FileKeychain::new(&path);
        assert_eq!(
            reopened
                .retrieve("account-session")
                .unwrap()
                .unwrap()
                .expose(),
            "{\"uid\":\"u\"}"
        );
    }

    #[test]
    fn deleting_missing_entry_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("kc.bin"));
        keychain.delete("nothing").unwrap();
        assert!(!keychain.path().exists());

        let memory = MemoryKeychain::new();
        memory.delete("nothing").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn file_keychain_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("kc.bin"));
        keychain.store("k", &secret("v")).unwrap();

        let mode = std::fs::metadata(keychain.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kc.bin");
        std::fs::write(&path, b"garbage").unwrap();

        let keychain = FileKeychain::new(&path);
        assert!(keychain.retrieve("k").is_err());
    }

    #[test]
    fn memory_keychain_overwrites() {
        let keychain = MemoryKeychain::new();
        keychain.store("k", &secret("one")).unwrap();
        keychain.store("k", &secret("two")).unwrap();

        assert_eq!(keychain.len(), 1);
        assert_eq!(keychain.retrieve("k").unwrap().unwrap().expose(), "two");
    }

    #[cfg(target_os = "macos")]
    #[test]
    #[ignore = "requires unlocked macOS Keychain, run manually with --ignored"]
    fn macos_keychain_roundtrip() {
        let service = format!("org.lockwise.session.test.{}", std::process::id());
        let kc = MacOSKeychain::with_service(&service);
        let _ = kc.delete("k");

        assert!(kc.retrieve("k").unwrap().is_none());
        kc.store("k", &secret("v")).unwrap();
        assert_eq!(kc.retrieve("k").unwrap().unwrap().expose(), "v");
        kc.delete("k").unwrap();
        kc.delete("k").unwrap();
    }

    #[test]
    fn platform_keychain_returns_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = platform_keychain(dir.path());
        let _ = provider.retrieve("anything");
    }
}
