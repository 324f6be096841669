//! Checksum generation and comparison
//!
//! [`HashVerifier`] recomputes an object's digests for an ordered
//! [`AlgorithmSet`] and classifies the result as a [`FixityState`]. The first
//! failing algorithm decides the outcome, so the algorithm order is taken
//! from configuration and never from map iteration.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::{Error, Result};
use crate::record::FixityState;

/// Recorded digests keyed by algorithm name, hex encoded
pub type Checksums = BTreeMap<String, String>;

/// Read buffer size for streaming objects through the hashers
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// BLAKE3
    Blake3,
}

impl HashAlgorithm {
    /// Canonical lowercase name, also the key used in [`Checksums`]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    /// Hash a byte slice and return the lowercase hex digest
    pub fn digest_hex(self, data: &[u8]) -> String {
        let mut hasher = StreamHasher::new(self);
        hasher.update(data);
        hasher.finalize_hex()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha384" | "sha-384" => Ok(Self::Sha384),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            _ => Err(Error::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Incremental hasher over any supported algorithm
enum StreamHasher {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl StreamHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha384 => Self::Sha384(sha2::Sha384::new()),
            HashAlgorithm::Sha512 => Self::Sha512(sha2::Sha512::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha384(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Ordered, duplicate-free, non-empty list of algorithms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<HashAlgorithm>", into = "Vec<HashAlgorithm>")]
pub struct AlgorithmSet(Vec<HashAlgorithm>);

impl AlgorithmSet {
    /// Build a set, keeping the first occurrence of each algorithm
    pub fn new(algorithms: impl IntoIterator<Item = HashAlgorithm>) -> Result<Self> {
        let mut ordered = Vec::new();
        for algorithm in algorithms {
            if !ordered.contains(&algorithm) {
                ordered.push(algorithm);
            }
        }
        if ordered.is_empty() {
            return Err(Error::Config("at least one hash algorithm is required".into()));
        }
        Ok(Self(ordered))
    }

    /// Parse algorithm names in order
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let parsed = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<HashAlgorithm>>>()?;
        Self::new(parsed)
    }

    /// Algorithms in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = HashAlgorithm> + '_ {
        self.0.iter().copied()
    }

    /// Number of algorithms
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no algorithms; false for any constructed set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for AlgorithmSet {
    fn default() -> Self {
        Self(vec![HashAlgorithm::Sha256])
    }
}

impl TryFrom<Vec<HashAlgorithm>> for AlgorithmSet {
    type Error = Error;

    fn try_from(value: Vec<HashAlgorithm>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AlgorithmSet> for Vec<HashAlgorithm> {
    fn from(value: AlgorithmSet) -> Self {
        value.0
    }
}

/// Classified result of one verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    /// Resulting state
    pub state: FixityState,
    /// Algorithm that decided a non-matching outcome
    pub algorithm: Option<HashAlgorithm>,
}

impl VerificationOutcome {
    fn matched() -> Self {
        Self {
            state: FixityState::Match,
            algorithm: None,
        }
    }

    fn failed(state: FixityState, algorithm: HashAlgorithm) -> Self {
        Self {
            state,
            algorithm: Some(algorithm),
        }
    }
}

/// Recomputes and compares digests
#[derive(Debug, Clone, Default)]
pub struct HashVerifier {
    algorithms: AlgorithmSet,
}

impl HashVerifier {
    /// Create a verifier over `algorithms`
    pub fn new(algorithms: AlgorithmSet) -> Self {
        Self { algorithms }
    }

    /// Configured algorithms
    pub fn algorithms(&self) -> &AlgorithmSet {
        &self.algorithms
    }

    /// Classify `object` against its recorded digests.
    ///
    /// `object` is `None` when the object cannot be located or opened. The
    /// stream is read once; every algorithm ahead of the first one without a
    /// recorded digest is computed in the same pass.
    pub fn verify<R: Read>(&self, object: Option<R>, recorded: &Checksums) -> VerificationOutcome {
        let algorithms: Vec<HashAlgorithm> = self.algorithms.iter().collect();
        let expected: Vec<Option<String>> = algorithms
            .iter()
            .map(|algorithm| recorded_digest(recorded, *algorithm))
            .collect();

        let usable = expected.iter().take_while(|digest| digest.is_some()).count();
        if usable == 0 {
            return VerificationOutcome::failed(FixityState::ChecksumMissing, algorithms[0]);
        }

        let Some(mut reader) = object else {
            return VerificationOutcome::failed(FixityState::ObjectMissing, algorithms[0]);
        };

        let mut hashers: Vec<StreamHasher> = algorithms[..usable]
            .iter()
            .map(|algorithm| StreamHasher::new(*algorithm))
            .collect();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => hashers.iter_mut().for_each(|h| h.update(&buffer[..n])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    return VerificationOutcome::failed(
                        FixityState::GenerationFailed,
                        algorithms[0],
                    )
                }
            }
        }

        for ((algorithm, hasher), digest) in algorithms.iter().zip(hashers).zip(&expected) {
            let expected = digest.as_deref().unwrap_or_default();
            if hasher.finalize_hex() != expected {
                return VerificationOutcome::failed(FixityState::Mismatch, *algorithm);
            }
        }

        if usable < algorithms.len() {
            return VerificationOutcome::failed(FixityState::ChecksumMissing, algorithms[usable]);
        }
        VerificationOutcome::matched()
    }
}

/// Normalized recorded digest for `algorithm`, `None` when absent or blank
fn recorded_digest(recorded: &Checksums, algorithm: HashAlgorithm) -> Option<String> {
    recorded
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(algorithm.name()))
        .map(|(_, digest)| digest.trim().to_ascii_lowercase())
        .filter(|digest| !digest.is_empty())
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn algorithm_strategy() -> impl Strategy<Value = Vec<HashAlgorithm>> {
        prop::sample::subsequence(
            vec![
                HashAlgorithm::Sha256,
                HashAlgorithm::Sha384,
                HashAlgorithm::Sha512,
                HashAlgorithm::Blake3,
            ],
            1..=4,
        )
        .prop_shuffle()
    }

    proptest! {
        /// Property: unchanged content matches under every algorithm set
        #[test]
        fn unchanged_content_matches(
            data in prop::collection::vec(any::<u8>(), 0..4096),
            algorithms in algorithm_strategy(),
        ) {
            let verifier = HashVerifier::new(AlgorithmSet::new(algorithms.clone()).unwrap());
            let recorded: Checksums = algorithms
                .iter()
                .map(|a| (a.name().to_string(), a.digest_hex(&data)))
                .collect();
            let outcome = verifier.verify(Some(data.as_slice()), &recorded);
            prop_assert_eq!(outcome.state, FixityState::Match);
        }

        /// Property: without a digest for the leading algorithm the outcome
        /// is CHECKSUM_MISSING whether or not the object is readable
        #[test]
        fn missing_leading_digest_is_checksum_missing(
            data in prop::collection::vec(any::<u8>(), 0..1024),
            algorithms in algorithm_strategy(),
            readable in any::<bool>(),
        ) {
            let verifier = HashVerifier::new(AlgorithmSet::new(algorithms.clone()).unwrap());
            let recorded: Checksums = algorithms
                .iter()
                .skip(1)
                .map(|a| (a.name().to_string(), a.digest_hex(&data)))
                .collect();
            let object = readable.then_some(data.as_slice());
            let outcome = verifier.verify(object, &recorded);
            prop_assert_eq!(outcome.state, FixityState::ChecksumMissing);
        }

        /// Property: an absent object with recorded digests is OBJECT_MISSING
        #[test]
        fn absent_object_is_object_missing(
            data in prop::collection::vec(any::<u8>(), 0..1024),
            algorithms in algorithm_strategy(),
        ) {
            let verifier = HashVerifier::new(AlgorithmSet::new(algorithms.clone()).unwrap());
            let recorded: Checksums = algorithms
                .iter()
                .map(|a| (a.name().to_string(), a.digest_hex(&data)))
                .collect();
            let outcome = verifier.verify(None::<&[u8]>, &recorded);
            prop_assert_eq!(outcome.state, FixityState::ObjectMissing);
        }
    }
}
