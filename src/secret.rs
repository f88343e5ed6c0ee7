use bitcoin::hashes::{sha256, Hash};
use std::{fmt, str::FromStr};

pub const SECRET_LENGTH: usize = 32;

/// The cooperation secret revealed when a hash-locked output is claimed.
///
/// Only ever constructed from exactly [`SECRET_LENGTH`] bytes; the scripts
/// commit to the SHA-256 of this value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; SECRET_LENGTH]);

impl Secret {
    pub fn from_vec(vec: &[u8]) -> Result<Secret, InvalidLength> {
        if vec.len() != SECRET_LENGTH {
            return Err(InvalidLength(vec.len()));
        }
        let mut data = [0u8; SECRET_LENGTH];
        data.copy_from_slice(vec);
        Ok(Secret(data))
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash::new(*self)
    }

    pub fn as_raw(&self) -> &[u8; SECRET_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; SECRET_LENGTH]> for Secret {
    fn from(secret: [u8; SECRET_LENGTH]) -> Self {
        Secret(secret)
    }
}

// The preimage is worth money until the trade settles, keep it out of logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([*****])")
    }
}

impl FromStr for Secret {
    type Err = ParseHex;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s).map_err(|_| ParseHex)?;
        Secret::from_vec(&vec).map_err(|_| ParseHex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("secret must be {} bytes, got {0}", SECRET_LENGTH)]
pub struct InvalidLength(usize);

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("invalid hex secret")]
pub struct ParseHex;

/// SHA-256 commitment to a [`Secret`], fixed at trade creation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretHash(sha256::Hash);

impl SecretHash {
    pub fn new(secret: Secret) -> Self {
        SecretHash(sha256::Hash::hash(secret.as_raw()))
    }

    pub fn into_inner(self) -> [u8; 32] {
        self.0.into_inner()
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, InvalidLength> {
        sha256::Hash::from_slice(slice)
            .map(SecretHash)
            .map_err(|_| InvalidLength(slice.len()))
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({:x})", self.0)
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::LowerHex for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl FromStr for SecretHash {
    type Err = ParseHex;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        sha256::Hash::from_str(s).map(SecretHash).map_err(|_| ParseHex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn secret_hash_as_hex() {
        let secret = Secret(*b"hello world, you are beautiful!!");
        assert_eq!(
            secret.hash().to_string(),
            "68d627971643a6f97f27c58957826fcba853ec2077fd10ec6b93d8e61deb4cec"
        );
    }

    #[test]
    fn secret_from_vec_rejects_wrong_length() {
        assert_that(&Secret::from_vec(b"short")).is_err();
        assert_that(&Secret::from_vec(&[0u8; 33])).is_err();
        assert_that(&Secret::from_vec(&[0u8; 32])).is_ok();
    }

    #[test]
    fn secret_hash_string_round_trip() {
        let hash = SecretHash::new(Secret(*b"hello world, you are beautiful!!"));
        let parsed = hash.to_string().parse::<SecretHash>().unwrap();

        assert_eq!(parsed, hash);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret(*b"hello world, you are beautiful!!");
        assert_eq!(format!("{:?}", secret), "Secret([*****])");
    }
}
