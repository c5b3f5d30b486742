//! On-disk, content-addressed cache of step-hash arrays.
//!
//! Computing a machine's state roots across millions of opcodes is expensive;
//! challenges over the same assertion ask for the same arrays repeatedly.
//! The cache stores each array under a deterministic, human-readable path
//! derived from its key, doubling as an operator-debug surface:
//!
//! ```text
//! wavm-module-root-0x.../
//!   assertion-0x.../
//!     message-num-100-101/
//!       big-step-50-51/
//!         small-step-0-100/
//!           roots.txt
//! ```
//!
//! Files are headerless concatenations of 32-byte hashes.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use alloy_primitives::B256;
use thiserror::Error;
use tracing::debug;

const ROOTS_FILE: &str = "roots.txt";

/// An error from the history cache.
#[derive(Debug, Error)]
pub enum HistoryCacheError {
    /// `put` refuses to overwrite an existing entry.
    #[error("file already exists")]
    FileAlreadyExists,
    /// A bounded `get` found fewer roots than requested.
    #[error("only read {0} state roots")]
    ShortRead(usize),
    /// The stored file is not a whole number of 32-byte hashes.
    #[error("malformed state roots file")]
    Malformed,
    /// The key's message range is unusable.
    #[error("message number range invalid: {0}")]
    InvalidMessageRange(String),
    /// The key's big-step range is unusable.
    #[error("big step range invalid: {0}")]
    InvalidBigStepRange(String),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A half-open-ish height interval `[from, to]` as used in challenge edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeightRange {
    /// Range start.
    pub from: u64,
    /// Range end.
    pub to: u64,
}

impl HeightRange {
    /// Creates a range.
    pub const fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    const fn is_one_step_fork(&self) -> bool {
        self.to == self.from + 1
    }
}

/// Cache key addressing one step-hash array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    /// Module root of the machine the hashes were computed under.
    pub wavm_module_root: B256,
    /// On-chain assertion hash the challenge descends from; zero when the
    /// caller does not track it.
    pub assertion_hash: B256,
    /// Message range of the (sub)challenge.
    pub message_range: HeightRange,
    /// Big-step range, present below the block level.
    pub big_step_range: Option<HeightRange>,
    /// Upper small-step bound, present at the small-step level.
    pub to_small_step: Option<u64>,
}

/// Derives the on-disk path for `key`, enforcing that deeper levels only
/// appear at one-step forks of the level above.
pub(crate) fn determine_file_path(base: &Path, key: &Key) -> Result<PathBuf, HistoryCacheError> {
    if key.message_range.from >= key.message_range.to {
        return Err(HistoryCacheError::InvalidMessageRange(format!(
            "{}-{}",
            key.message_range.from, key.message_range.to
        )));
    }
    if key.big_step_range.is_some() && !key.message_range.is_one_step_fork() {
        return Err(HistoryCacheError::InvalidMessageRange(format!(
            "{}-{} is not a one step fork",
            key.message_range.from, key.message_range.to
        )));
    }
    let mut path = base
        .join(format!("wavm-module-root-{}", key.wavm_module_root))
        .join(format!("assertion-{}", key.assertion_hash))
        .join(format!("message-num-{}-{}", key.message_range.from, key.message_range.to));
    if let Some(big_step) = key.big_step_range {
        if big_step.from >= big_step.to {
            return Err(HistoryCacheError::InvalidBigStepRange(format!(
                "{}-{}",
                big_step.from, big_step.to
            )));
        }
        if key.to_small_step.is_some() && !big_step.is_one_step_fork() {
            return Err(HistoryCacheError::InvalidBigStepRange(format!(
                "{}-{} is not a one step fork",
                big_step.from, big_step.to
            )));
        }
        path = path.join(format!("big-step-{}-{}", big_step.from, big_step.to));
    } else if key.to_small_step.is_some() {
        return Err(HistoryCacheError::InvalidBigStepRange(
            "missing below a small step bound".into(),
        ));
    }
    if let Some(to_small_step) = key.to_small_step {
        path = path.join(format!("small-step-0-{to_small_step}"));
    }
    Ok(path.join(ROOTS_FILE))
}

/// Reads concatenated 32-byte roots; with a bound, reads exactly `bound + 1`
/// of them and errors on shortfall.
pub(crate) fn read_state_roots(
    mut reader: impl Read,
    up_to: Option<u64>,
) -> Result<Vec<B256>, HistoryCacheError> {
    let mut roots = Vec::new();
    let mut buf = [0u8; 32];
    loop {
        if let Some(bound) = up_to {
            if roots.len() as u64 == bound + 1 {
                break;
            }
        }
        let mut filled = 0;
        while filled < 32 {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if filled < 32 {
            return Err(HistoryCacheError::Malformed);
        }
        roots.push(B256::from(buf));
    }
    if let Some(bound) = up_to {
        if (roots.len() as u64) < bound + 1 {
            return Err(HistoryCacheError::ShortRead(roots.len()));
        }
    }
    Ok(roots)
}

/// The on-disk cache.
#[derive(Clone, Debug)]
pub struct HistoryCache {
    base_dir: PathBuf,
}

impl HistoryCache {
    /// Creates a cache rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Reads the roots stored under `key`, optionally bounded to the first
    /// `up_to + 1` entries.
    pub fn get(&self, key: &Key, up_to: Option<u64>) -> Result<Vec<B256>, HistoryCacheError> {
        let path = determine_file_path(&self.base_dir, key)?;
        let file = fs::File::open(path)?;
        read_state_roots(std::io::BufReader::new(file), up_to)
    }

    /// Stores `roots` under `key`. Existing entries are never overwritten;
    /// callers treat [`HistoryCacheError::FileAlreadyExists`] as benign.
    pub fn put(&self, key: &Key, roots: &[B256]) -> Result<(), HistoryCacheError> {
        let path = determine_file_path(&self.base_dir, key)?;
        if path.exists() {
            return Err(HistoryCacheError::FileAlreadyExists);
        }
        let parent = path.parent().ok_or(HistoryCacheError::FileAlreadyExists)?;
        fs::create_dir_all(parent)?;
        let mut encoded = Vec::with_capacity(roots.len() * 32);
        for root in roots {
            encoded.extend_from_slice(root.as_slice());
        }
        // Write-then-rename keeps concurrent readers from observing a
        // truncated file.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &encoded)?;
        fs::rename(&tmp, &path)?;
        debug!(target: "history_cache", ?path, roots = roots.len(), "cached state roots");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_key() -> Key {
        Key {
            wavm_module_root: B256::left_padding_from(b"foo"),
            assertion_hash: B256::left_padding_from(b"bar"),
            message_range: HeightRange::new(0, 1),
            big_step_range: Some(HeightRange::new(0, 1)),
            to_small_step: Some(100),
        }
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HistoryCache::new(dir.path());
        let key = full_key();
        let want = vec![
            B256::left_padding_from(b"foo"),
            B256::left_padding_from(b"bar"),
            B256::left_padding_from(b"baz"),
        ];
        cache.put(&key, &want).unwrap();
        assert_eq!(cache.get(&key, None).unwrap(), want);
        // A second put of the same key is refused.
        assert!(matches!(cache.put(&key, &want), Err(HistoryCacheError::FileAlreadyExists)));
    }

    #[test]
    fn bounded_get_truncates_or_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HistoryCache::new(dir.path());
        let key = full_key();
        let want: Vec<_> = (0u8..3).map(B256::repeat_byte).collect();
        cache.put(&key, &want).unwrap();
        assert_eq!(cache.get(&key, Some(1)).unwrap(), want[..2].to_vec());
        assert!(matches!(
            cache.get(&key, Some(10)),
            Err(HistoryCacheError::ShortRead(3))
        ));
    }

    #[test]
    fn read_state_roots_handles_bounds() {
        // Empty reader, no bound: no roots.
        assert!(read_state_roots(&[][..], None).unwrap().is_empty());
        // Empty reader with a bound: shortfall error naming the count read.
        let err = read_state_roots(&[][..], Some(100)).unwrap_err();
        assert_eq!(err.to_string(), "only read 0 state roots");
        // A single root read back exactly.
        let root = B256::left_padding_from(b"foo");
        let roots = read_state_roots(root.as_slice(), Some(0)).unwrap();
        assert_eq!(roots, vec![root]);
        // Three roots present, bound asks for two.
        let (foo, bar, baz) = (
            B256::left_padding_from(b"foo"),
            B256::left_padding_from(b"bar"),
            B256::left_padding_from(b"baz"),
        );
        let mut buf = Vec::new();
        buf.extend_from_slice(foo.as_slice());
        buf.extend_from_slice(bar.as_slice());
        buf.extend_from_slice(baz.as_slice());
        assert_eq!(read_state_roots(&buf[..], Some(1)).unwrap(), vec![foo, bar]);
        // A trailing partial hash is malformed.
        assert!(matches!(
            read_state_roots(&buf[..40], None),
            Err(HistoryCacheError::Malformed)
        ));
    }

    #[test]
    fn file_path_validation() {
        let cases: Vec<(&str, Key, Result<&str, &str>)> = vec![
            (
                "bad message range",
                Key {
                    wavm_module_root: B256::ZERO,
                    assertion_hash: B256::ZERO,
                    message_range: HeightRange::new(1, 0),
                    big_step_range: None,
                    to_small_step: None,
                },
                Err("message number range invalid"),
            ),
            (
                "bad message range equal",
                Key {
                    wavm_module_root: B256::ZERO,
                    assertion_hash: B256::ZERO,
                    message_range: HeightRange::new(100, 100),
                    big_step_range: None,
                    to_small_step: None,
                },
                Err("message number range invalid"),
            ),
            (
                "message range not at one step fork",
                Key {
                    wavm_module_root: B256::ZERO,
                    assertion_hash: B256::ZERO,
                    message_range: HeightRange::new(100, 102),
                    big_step_range: Some(HeightRange::new(0, 1)),
                    to_small_step: None,
                },
                Err("message number range invalid"),
            ),
            (
                "big step range invalid",
                Key {
                    wavm_module_root: B256::ZERO,
                    assertion_hash: B256::ZERO,
                    message_range: HeightRange::new(100, 101),
                    big_step_range: Some(HeightRange::new(1, 0)),
                    to_small_step: None,
                },
                Err("big step range invalid"),
            ),
            (
                "big step range not at one step fork",
                Key {
                    wavm_module_root: B256::ZERO,
                    assertion_hash: B256::ZERO,
                    message_range: HeightRange::new(100, 101),
                    big_step_range: Some(HeightRange::new(100, 102)),
                    to_small_step: Some(100),
                },
                Err("big step range invalid"),
            ),
            (
                "ok",
                Key {
                    wavm_module_root: B256::ZERO,
                    assertion_hash: B256::ZERO,
                    message_range: HeightRange::new(100, 101),
                    big_step_range: Some(HeightRange::new(50, 51)),
                    to_small_step: Some(100),
                },
                Ok("wavm-module-root-0x0000000000000000000000000000000000000000000000000000000000000000/assertion-0x0000000000000000000000000000000000000000000000000000000000000000/message-num-100-101/big-step-50-51/small-step-0-100/roots.txt"),
            ),
        ];
        for (name, key, expected) in cases {
            let got = determine_file_path(Path::new(""), &key);
            match expected {
                Ok(path) => {
                    assert_eq!(got.unwrap(), PathBuf::from(path), "{name}");
                }
                Err(fragment) => {
                    let err = got.unwrap_err().to_string();
                    assert!(err.contains(fragment), "{name}: {err}");
                }
            }
        }
    }
}
