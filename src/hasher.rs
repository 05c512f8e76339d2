//! Resumable SHA-256.
//!
//! The running state of an upload is persisted between requests, so the
//! hasher is plain data: the eight chaining words, the number of bytes seen
//! and the tail that has not yet filled a 64 byte block. It can be serialized
//! after any chunk and picked up again by another request (or process).

use std::slice::from_ref;

use serde::{Deserialize, Serialize};
use sha2::compress256;
use sha2::digest::generic_array::GenericArray;
use thiserror::Error;

use crate::digest::Digest;

const BLOCK_SIZE: usize = 64;

const H256: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

#[derive(Debug, Error)]
pub enum HasherError {
    #[error("persisted digest state has a {0} byte tail, expected fewer than 64")]
    OversizedTail(usize),
    #[error("persisted digest state length {length} does not agree with its {tail} byte tail")]
    LengthMismatch { length: u64, tail: usize },
    #[error("persisted digest state is not valid JSON")]
    Decode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    state: [u32; 8],
    length: u64,
    tail: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PersistedState", into = "PersistedState")]
pub struct DigestState {
    state: [u32; 8],
    length: u64,
    tail: Vec<u8>,
}

impl Default for DigestState {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestState {
    pub fn new() -> Self {
        Self {
            state: H256,
            length: 0,
            tail: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Number of bytes fed so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.length += data.len() as u64;

        if !self.tail.is_empty() {
            let take = (BLOCK_SIZE - self.tail.len()).min(data.len());
            self.tail.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.tail.len() < BLOCK_SIZE {
                return;
            }

            compress256(&mut self.state, from_ref(GenericArray::from_slice(&self.tail)));
            self.tail.clear();
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            compress256(&mut self.state, from_ref(GenericArray::from_slice(block)));
        }
        self.tail.extend_from_slice(blocks.remainder());
    }

    /// Pads a copy of the state and returns the digest. The state itself is
    /// left untouched so more data can still be appended.
    pub fn finalize(&self) -> Digest {
        let mut state = self.state;

        let mut padding = Vec::with_capacity(2 * BLOCK_SIZE);
        padding.extend_from_slice(&self.tail);
        padding.push(0x80);
        while padding.len() % BLOCK_SIZE != BLOCK_SIZE - 8 {
            padding.push(0);
        }
        padding.extend_from_slice(&self.length.wrapping_mul(8).to_be_bytes());

        for block in padding.chunks_exact(BLOCK_SIZE) {
            compress256(&mut state, from_ref(GenericArray::from_slice(block)));
        }

        let mut out = [0u8; 32];
        for (chunk, word) in out.chunks_exact_mut(4).zip(state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        Digest::from_sha256(&out)
    }

    pub fn to_json(&self) -> String {
        // Only numbers and byte arrays, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(data: &str) -> Result<Self, HasherError> {
        Ok(serde_json::from_str::<PersistedState>(data)?.try_into()?)
    }
}

impl TryFrom<PersistedState> for DigestState {
    type Error = HasherError;

    fn try_from(value: PersistedState) -> Result<Self, Self::Error> {
        if value.tail.len() >= BLOCK_SIZE {
            return Err(HasherError::OversizedTail(value.tail.len()));
        }

        if value.length % BLOCK_SIZE as u64 != value.tail.len() as u64 {
            return Err(HasherError::LengthMismatch {
                length: value.length,
                tail: value.tail.len(),
            });
        }

        Ok(Self {
            state: value.state,
            length: value.length,
            tail: value.tail,
        })
    }
}

impl From<DigestState> for PersistedState {
    fn from(value: DigestState) -> Self {
        Self {
            state: value.state,
            length: value.length,
            tail: value.tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use data_encoding::HEXLOWER;
    use sha2::{Digest as _, Sha256};

    use super::*;

    fn reference(data: &[u8]) -> String {
        format!("sha256:{}", HEXLOWER.encode(&Sha256::digest(data)))
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn empty() {
        assert_eq!(DigestState::new().finalize().to_string(), reference(b""));
    }

    #[test]
    fn abcdef_in_two_chunks() {
        let mut state = DigestState::new();
        state.update(b"abc");
        state.update(b"def");

        assert_eq!(state.length(), 6);
        assert_eq!(state.finalize().to_string(), reference(b"abcdef"));
    }

    #[test]
    fn block_boundaries() {
        for len in [55, 56, 63, 64, 65, 119, 120, 127, 128, 1000] {
            let data = sample(len);
            let mut state = DigestState::new();
            state.update(&data);
            assert_eq!(state.finalize().to_string(), reference(&data), "len {len}");
        }
    }

    #[test]
    fn split_anywhere_matches_whole() {
        let data = sample(300);

        for split in [0, 1, 17, 63, 64, 65, 128, 200, 299, 300] {
            let mut state = DigestState::new();
            state.update(&data[..split]);
            state.update(&data[split..]);
            assert_eq!(
                state.finalize().to_string(),
                reference(&data),
                "split {split}"
            );
        }
    }

    #[test]
    fn resumes_from_persisted_state() {
        let data = sample(777);
        let mut state = DigestState::new();

        for chunk in data.chunks(50) {
            let restored = DigestState::from_json(&state.to_json()).unwrap();
            assert_eq!(restored, state);
            state = restored;
            state.update(chunk);
        }

        assert_eq!(state.finalize().to_string(), reference(&data));
    }

    #[test]
    fn finalize_does_not_consume() {
        let mut state = DigestState::new();
        state.update(b"abc");
        let _ = state.finalize();
        state.update(b"def");

        assert_eq!(state.finalize().to_string(), reference(b"abcdef"));
    }

    #[test]
    fn rejects_inconsistent_state() {
        let bad = serde_json::json!({
            "state": H256,
            "length": 3,
            "tail": [1, 2],
        });

        assert!(matches!(
            DigestState::from_json(&bad.to_string()),
            Err(HasherError::LengthMismatch { .. })
        ));
    }
}
