use std::fmt;
use std::str::FromStr;

use crate::error::BackupError;

pub const SHA1_RAWSIZE: usize = 20;

/// A 20-byte object identifier in raw form.
///
/// The all-zero value is the null id. `Ord` compares raw bytes, so ordered
/// collections of `Sha1` enumerate in the canonical lexicographic order used
/// for `backup.refs` parents and pack head lists.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1([u8; SHA1_RAWSIZE]);

impl Sha1 {
    pub const NULL: Sha1 = Sha1([0u8; SHA1_RAWSIZE]);

    pub fn from_bytes(raw: [u8; SHA1_RAWSIZE]) -> Self {
        Sha1(raw)
    }

    pub fn is_null(&self) -> bool {
        *self == Sha1::NULL
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_RAWSIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Sha1 {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * SHA1_RAWSIZE {
            return Err(BackupError::Sha1Parse(s.to_string()));
        }
        let mut raw = [0u8; SHA1_RAWSIZE];
        hex::decode_to_slice(s, &mut raw).map_err(|_| BackupError::Sha1Parse(s.to_string()))?;
        Ok(Sha1(raw))
    }
}

impl fmt::Display for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Debug defers to Display so ids read the same in logs and asserts.
impl fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<git2::Oid> for Sha1 {
    fn from(oid: git2::Oid) -> Self {
        let mut raw = [0u8; SHA1_RAWSIZE];
        raw.copy_from_slice(oid.as_bytes());
        Sha1(raw)
    }
}

impl From<Sha1> for git2::Oid {
    fn from(sha1: Sha1) -> Self {
        git2::Oid::from_bytes(&sha1.0).expect("20 raw bytes always form a valid oid")
    }
}
