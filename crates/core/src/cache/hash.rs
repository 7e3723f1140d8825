//! Disk key derivation.
//!
//! Cache keys are arbitrary strings (usually URLs); the on-disk stores index
//! entries by a fixed-length, filename-safe digest of them instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Digest used to derive disk keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDigest {
    /// 16-byte MD5 digest, hex encoded.
    #[default]
    Md5,
    /// 31-polynomial string hash rendered as a signed decimal.
    ///
    /// Collision-prone; only for stores written by clients that could not
    /// compute the MD5 digest.
    Hashcode,
}

/// Hashed, filename-safe identifier derived from a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskKey(String);

impl DiskKey {
    /// Derive the disk key for `key` with the default digest.
    pub fn derive(key: &str) -> Self {
        Self::derive_with(key, KeyDigest::Md5)
    }

    /// Derive the disk key for `key` with an explicit digest.
    pub fn derive_with(key: &str, digest: KeyDigest) -> Self {
        match digest {
            KeyDigest::Md5 => Self(hex::encode(md5::compute(key.as_bytes()).0)),
            KeyDigest::Hashcode => Self(string_hashcode(key).to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `s[0]*31^(n-1) + ... + s[n-1]` over UTF-16 code units, wrapping.
fn string_hashcode(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}
