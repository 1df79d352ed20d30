//! Sealed blobs and key derivation on top of `ring`.
//!
//! Every encrypted value the vault writes (login rows, the key verifier,
//! the file keychain) is one self-describing blob:
//!
//! ```text
//! [version: 1 byte][nonce: 12 bytes][AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! The version byte is authenticated as associated data, so a blob cannot be
//! replayed under a different format.
//!
//! Keys are [`Zeroizing`] buffers and are wiped on drop.

use std::num::NonZeroU32;

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, pbkdf2};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

pub const KEY_LEN: usize = 32;

/// Salt length expected by [`derive_key_with_salt`] callers.
pub const SALT_LEN: usize = 32;

const BLOB_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + NONCE_LEN;

// 600k rounds of HMAC-SHA256 (OWASP 2023).
const PBKDF2_ROUNDS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// HKDF info for datastore keys.  Changing it orphans every datastore.
const DATASTORE_KEY_INFO: &[u8] = b"lockwise-datastore-key-v1";

/// A 256-bit key that is wiped when dropped.
pub type Key = Zeroizing<[u8; KEY_LEN]>;

fn aead_key(key: &Key) -> Result<LessSafeKey> {
    UnboundKey::new(&AES_256_GCM, &key[..])
        .map(LessSafeKey::new)
        .map_err(|_| VaultError::Internal("AES-256-GCM rejected a 32-byte key".into()))
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &Key) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "system random source failed".into(),
        })?;

    let mut blob = Vec::with_capacity(HEADER_LEN + plaintext.len() + AES_256_GCM.tag_len());
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(plaintext);

    let tag = aead_key(key)?
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from([BLOB_VERSION]),
            &mut blob[HEADER_LEN..],
        )
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "AES-256-GCM seal failed".into(),
        })?;
    blob.extend_from_slice(tag.as_ref());
    Ok(blob)
}

/// Decrypt a blob produced by [`seal`].
///
/// A wrong key, a tampered blob and an unknown version all fail with
/// [`VaultError::DecryptionFailed`].
pub fn open(blob: &[u8], key: &Key) -> Result<Vec<u8>> {
    if blob.len() < HEADER_LEN + AES_256_GCM.tag_len() {
        return Err(VaultError::DecryptionFailed {
            reason: format!("blob of {} bytes is truncated", blob.len()),
        });
    }
    let (header, sealed) = blob.split_at(HEADER_LEN);
    let version = header[0];
    if version != BLOB_VERSION {
        return Err(VaultError::DecryptionFailed {
            reason: format!("unsupported blob version {version}"),
        });
    }
    let nonce = Nonce::try_assume_unique_for_key(&header[1..]).map_err(|_| {
        VaultError::DecryptionFailed {
            reason: "malformed nonce".into(),
        }
    })?;

    let mut in_out = sealed.to_vec();
    let plaintext = aead_key(key)?
        .open_in_place(nonce, Aad::from([version]), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "wrong key or corrupted data".into(),
        })?;
    let len = plaintext.len();
    in_out.truncate(len);
    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

struct KeyLen;

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Datastore key for an account: HKDF-SHA256 over the `scoped_key`, salted
/// with the account `uid`.
pub fn derive_datastore_key(scoped_key: &[u8], uid: &str) -> Result<Key> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, uid.as_bytes()).extract(scoped_key);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    prk.expand(&[DATASTORE_KEY_INFO], KeyLen)
        .and_then(|okm| okm.fill(&mut key[..]))
        .map_err(|_| VaultError::KeyDerivationFailed {
            reason: "hkdf expand failed".into(),
        })?;
    Ok(key)
}

/// Stretch low-entropy `material` into a key with PBKDF2-HMAC-SHA256.
pub fn derive_key_with_salt(material: &[u8], salt: &[u8]) -> Key {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ROUNDS,
        salt,
        material,
        &mut key[..],
    );
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> Key {
        Zeroizing::new([byte; KEY_LEN])
    }

    #[test]
    fn sealed_blob_opens_with_same_key() {
        let key = test_key(7);
        let blob = seal(b"hunter2", &key).unwrap();

        assert_eq!(blob[0], BLOB_VERSION);
        assert_eq!(blob.len(), HEADER_LEN + 7 + AES_256_GCM.tag_len());
        assert_eq!(open(&blob, &key).unwrap(), b"hunter2");
    }

    #[test]
    fn nonces_are_fresh() {
        let key = test_key(7);
        assert_ne!(seal(b"same", &key).unwrap(), seal(b"same", &key).unwrap());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let blob = seal(b"secret data", &test_key(1)).unwrap();
        assert!(matches!(
            open(&blob, &test_key(2)),
            Err(VaultError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn tampering_is_detected() {
        let key = test_key(3);
        let mut blob = seal(b"secret data", &key).unwrap();
        if let Some(byte) = blob.last_mut() {
            *byte ^= 0x01;
        }
        assert!(open(&blob, &key).is_err());

        let mut relabeled = seal(b"secret data", &key).unwrap();
        relabeled[0] = 2;
        assert!(open(&relabeled, &key).is_err());

        assert!(open(&[BLOB_VERSION; 8], &key).is_err());
    }

    #[test]
    fn datastore_key_depends_on_key_and_uid() {
        let a = derive_datastore_key(b"scoped-key", "uid-1").unwrap();
        let again = derive_datastore_key(b"scoped-key", "uid-1").unwrap();
        let other_uid = derive_datastore_key(b"scoped-key", "uid-2").unwrap();
        let other_key = derive_datastore_key(b"other-key", "uid-1").unwrap();

        assert_eq!(*a, *again);
        assert_ne!(*a, *other_uid);
        assert_ne!(*a, *other_key);
    }

    #[test]
    fn device_key_is_deterministic() {
        let salt = [9u8; SALT_LEN];
        let k1 = derive_key_with_salt(b"device", &salt);
        let k2 = derive_key_with_salt(b"device", &salt);
        let k3 = derive_key_with_salt(b"other-device", &salt);

        assert_eq!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }
}
