use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest {0:?} is not of the form <algorithm>:<hex>")]
    Malformed(String),
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("digest hash {0:?} is not 64 lowercase hex characters")]
    InvalidHash(String),
}

/// A content address: `sha256:<64 lowercase hex>`.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    pub algo: String,
    pub hash: String,
}

impl Digest {
    pub fn from_sha256(raw: &[u8; 32]) -> Digest {
        Digest {
            algo: "sha256".to_string(),
            hash: HEXLOWER.encode(raw),
        }
    }

    /// Digest of a buffer that is already fully in memory (manifests).
    pub fn of(data: &[u8]) -> Digest {
        let mut state = crate::hasher::DigestState::new();
        state.update(data);
        state.finalize()
    }

    /// Byte store prefix holding every object written for this digest.
    pub fn blob_prefix(&self) -> String {
        format!("blobs/{}/{}/{}", self.algo, &self.hash[0..2], self.hash)
    }

    /// Key of one stored copy. Every commit writes a fresh one.
    pub fn object_key(&self, nonce: &Uuid) -> String {
        format!("{}/{}", self.blob_prefix(), nonce.simple())
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algo, hash)) = s.split_once(':') else {
            return Err(DigestError::Malformed(s.to_string()));
        };

        if algo != "sha256" {
            return Err(DigestError::UnsupportedAlgorithm(algo.to_string()));
        }

        if hash.len() != 64
            || !hash
                .bytes()
                .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
        {
            return Err(DigestError::InvalidHash(hash.to_string()));
        }

        Ok(Digest {
            algo: algo.to_string(),
            hash: hash.to_string(),
        })
    }
}

// We implement this so that serde_json can parse a Digest from a straight string
impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// We implement this so that serde_json can serialize a Digest struct into a string
impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        format!("{}", digest)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn from_str() {
        let digest: Digest = EMPTY.parse().unwrap();
        assert_eq!(digest.algo, "sha256");
        assert_eq!(
            digest.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn to_str() {
        let digest: Digest = EMPTY.parse().unwrap();
        assert_eq!(digest.to_string(), EMPTY);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            "nocolon".parse::<Digest>(),
            Err(DigestError::Malformed("nocolon".into()))
        );
        assert_eq!(
            "md5:abc".parse::<Digest>(),
            Err(DigestError::UnsupportedAlgorithm("md5".into()))
        );
        assert!(matches!(
            "sha256:abcdef".parse::<Digest>(),
            Err(DigestError::InvalidHash(_))
        ));
        assert!(matches!(
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
                .parse::<Digest>(),
            Err(DigestError::InvalidHash(_))
        ));
    }

    #[test]
    fn from_json() {
        let data = format!("\"{EMPTY}\"");
        let parsed: Digest = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed, EMPTY.parse().unwrap());

        assert!(serde_json::from_str::<Digest>("\"sha256:zz\"").is_err());
    }

    #[test]
    fn to_json() {
        let digest: Digest = EMPTY.parse().unwrap();
        let serialized = serde_json::to_string(&digest).unwrap();

        assert_eq!(serialized, format!("\"{EMPTY}\""));
    }

    #[test]
    fn object_keys_are_unique_per_copy() {
        let digest: Digest = EMPTY.parse().unwrap();
        let prefix = "blobs/sha256/e3/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(digest.blob_prefix(), prefix);

        let first = digest.object_key(&Uuid::new_v4());
        let second = digest.object_key(&Uuid::new_v4());
        assert!(first.starts_with(&format!("{prefix}/")));
        assert_ne!(first, second);
    }

    #[test]
    fn of_empty() {
        assert_eq!(Digest::of(b"").to_string(), EMPTY);
    }
}
