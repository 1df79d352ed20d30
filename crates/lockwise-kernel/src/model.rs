//! Data model shared by every Lockwise component.
//!
//! Credentials are owned by the credential store; everything here is a
//! by-value snapshot that can travel on the bus.  Secret material is wrapped
//! in [`SecretValue`], which is zeroed on drop and never printed by `Debug`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// An opaque secret string.
///
/// The buffer is zeroed when the value is dropped.  `Debug` output is
/// redacted so secrets cannot leak through `tracing` fields.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the plaintext.  Callers must not log the result.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Serialize for SecretValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Key material used to unlock the backing datastore (the account's scoped
/// key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockKey(SecretValue);

impl UnlockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretValue::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}

impl From<SecretValue> for UnlockKey {
    fn from(value: SecretValue) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// One stored login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Unique, store-assigned identifier.
    pub id: String,
    /// Origin (site or service) the login belongs to.
    pub origin: String,
    pub username: Option<String>,
    pub password: SecretValue,
    pub modified_at: DateTime<Utc>,
    /// Last time the login was used to fill a form.
    pub last_used_at: Option<DateTime<Utc>>,
    pub times_used: u32,
}

/// Payload for adding a login to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCredential {
    pub origin: String,
    pub username: Option<String>,
    pub password: SecretValue,
}

/// Service identifier supplied by the autofill host: either a bare domain
/// (`example.com`) or a URL (`https://login.example.com/signin`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentifier(String);

impl ServiceIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased host of this identifier, if one can be extracted.
    pub fn host(&self) -> Option<String> {
        host_of(&self.0)
    }

    /// Whether a credential stored for `origin` should be offered for this
    /// service.  Hosts match when equal or when the origin is a sub-domain
    /// of the service host.
    pub fn matches(&self, origin: &str) -> bool {
        let (Some(wanted), Some(actual)) = (self.host(), host_of(origin)) else {
            return false;
        };
        actual == wanted || actual.ends_with(&format!(".{wanted}"))
    }
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn host_of(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parsed = if value.contains("://") {
        Url::parse(value)
    } else {
        Url::parse(&format!("https://{value}"))
    };
    parsed
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
}

// ---------------------------------------------------------------------------
// Account session
// ---------------------------------------------------------------------------

/// Account/session metadata supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCredential {
    /// Stable account identifier; also the datastore salt.
    pub uid: String,
    pub email: Option<String>,
    pub access_token: Option<SecretValue>,
    /// Key that unlocks the datastore.
    pub scoped_key: Option<SecretValue>,
    pub display_name: Option<String>,
}

impl SyncCredential {
    /// Merge `other` into `self`.  Present fields in `other` win; absent
    /// fields leave the current value alone.
    pub fn merge(&mut self, other: SyncCredential) {
        if !other.uid.is_empty() {
            self.uid = other.uid;
        }
        if other.email.is_some() {
            self.email = other.email;
        }
        if other.access_token.is_some() {
            self.access_token = other.access_token;
        }
        if other.scoped_key.is_some() {
            self.scoped_key = other.scoped_key;
        }
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Whether the credential store's contents are accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    Locked,
    Unlocking,
    Unlocked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Locked => "locked",
            Self::Unlocking => "unlocking",
            Self::Unlocked => "unlocked",
        };
        f.write_str(s)
    }
}

/// Whether the autofill list has been computed and may be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PopulateState {
    NotAllowed,
    Populating,
    Populated,
}

/// Why an autofill request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// The user dismissed the extension.
    UserCanceled,
    /// The request needs the user to unlock first.
    UserInteractionRequired,
    /// The requested credential no longer exists.
    CredentialIdentityNotFound,
    Failed,
}
