use log::debug;
use rayon::prelude::*;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::crypto::{Digest, HashProvider, DIGEST_HEX_LEN};

/// Highest difficulty a hex-encoded digest can satisfy
pub const MAX_DIFFICULTY: u32 = DIGEST_HEX_LEN as u32;

/// How many attempts pass between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// How many attempts pass between progress log lines
const PROGRESS_LOG_INTERVAL: u64 = 100_000;

/// Errors that can occur during proof-of-work
#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Mining cancelled")]
    Cancelled,

    #[error("Difficulty {0} exceeds the maximum of {max}", max = MAX_DIFFICULTY)]
    UnreachableDifficulty(u32),

    #[error("Nonce space exhausted without a valid hash")]
    NonceSpaceExhausted,

    #[error("Failed to build mining worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Cooperative cancellation flag shared between a miner and its controller
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Parameters of a single proof-of-work run
#[derive(Debug, Clone)]
pub struct MiningOptions {
    /// Number of leading zero hex digits required
    pub difficulty: u32,

    /// Number of parallel nonce partitions; 1 searches on the calling thread
    pub workers: usize,

    pub cancel: CancellationToken,
}

impl MiningOptions {
    pub fn new(difficulty: u32) -> Self {
        MiningOptions {
            difficulty,
            workers: 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of a successful proof-of-work run
#[derive(Debug, Clone, PartialEq)]
pub struct MiningResult {
    pub hash: String,
    pub nonce: u64,
    pub attempts: u64,
    pub duration: Duration,

    /// Attempts per second
    pub hash_rate: f64,
}

impl MiningResult {
    pub fn new(hash: String, nonce: u64, attempts: u64, duration: Duration) -> Self {
        MiningResult {
            hash,
            nonce,
            attempts,
            duration,
            hash_rate: rate(attempts, duration),
        }
    }
}

pub(crate) fn rate(attempts: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        attempts as f64 / secs
    } else {
        0.0
    }
}

/// A nonce and the hash it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Solution {
    pub nonce: u64,
    pub hash: String,
    pub attempts: u64,
}

/// Number of leading zero hex digits in a digest
pub fn leading_zero_nibbles(digest: &Digest) -> u32 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

/// Checks whether a hex hash starts with `difficulty` zero digits
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Searches for the first nonce whose `prefix ++ nonce` digest meets the difficulty
pub(crate) fn search(
    prefix: &str,
    provider: &dyn HashProvider,
    options: &MiningOptions,
) -> Result<Solution, MiningError> {
    if options.difficulty > MAX_DIFFICULTY {
        return Err(MiningError::UnreachableDifficulty(options.difficulty));
    }
    if options.cancel.is_cancelled() {
        return Err(MiningError::Cancelled);
    }

    if options.workers <= 1 {
        search_sequential(prefix, provider, options.difficulty, &options.cancel)
    } else {
        search_parallel(
            prefix,
            provider,
            options.difficulty,
            options.workers,
            &options.cancel,
        )
    }
}

fn digest_candidate(
    buffer: &mut String,
    prefix_len: usize,
    nonce: u64,
    provider: &dyn HashProvider,
) -> Digest {
    buffer.truncate(prefix_len);
    buffer.push_str(&nonce.to_string());
    provider.digest(buffer.as_bytes())
}

fn search_sequential(
    prefix: &str,
    provider: &dyn HashProvider,
    difficulty: u32,
    cancel: &CancellationToken,
) -> Result<Solution, MiningError> {
    let mut buffer = String::from(prefix);
    let mut nonce = 0u64;
    let mut attempts = 0u64;

    loop {
        let digest = digest_candidate(&mut buffer, prefix.len(), nonce, provider);
        if leading_zero_nibbles(&digest) >= difficulty {
            return Ok(Solution {
                nonce,
                hash: hex::encode(digest),
                attempts,
            });
        }

        nonce = nonce.checked_add(1).ok_or(MiningError::NonceSpaceExhausted)?;
        attempts += 1;

        if attempts % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(MiningError::Cancelled);
        }
        if attempts % PROGRESS_LOG_INTERVAL == 0 {
            debug!("Mining in progress: {} attempts, nonce {}", attempts, nonce);
        }
    }
}

/// Worker `w` of `n` scans nonces `1 + w, 1 + w + n, ...` after nonce 0 has
/// been checked; the first worker to find a valid nonce stops the others.
fn search_parallel(
    prefix: &str,
    provider: &dyn HashProvider,
    difficulty: u32,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<Solution, MiningError> {
    let mut buffer = String::from(prefix);
    let first = digest_candidate(&mut buffer, prefix.len(), 0, provider);
    if leading_zero_nibbles(&first) >= difficulty {
        return Ok(Solution {
            nonce: 0,
            hash: hex::encode(first),
            attempts: 0,
        });
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("pow-worker-{}", i))
        .build()?;

    let stride = workers as u64;
    let found = AtomicBool::new(false);
    let attempts = AtomicU64::new(0);

    let winner = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .with_max_len(1)
            .find_map_any(|worker| {
                let mut buffer = String::from(prefix);
                let mut nonce = 1 + worker as u64;
                let mut local_attempts = 0u64;

                let outcome = loop {
                    local_attempts += 1;
                    let digest = digest_candidate(&mut buffer, prefix.len(), nonce, provider);
                    if leading_zero_nibbles(&digest) >= difficulty {
                        found.store(true, Ordering::SeqCst);
                        break Some((nonce, digest));
                    }

                    if local_attempts % CANCEL_CHECK_INTERVAL == 0
                        && (found.load(Ordering::SeqCst) || cancel.is_cancelled())
                    {
                        break None;
                    }

                    nonce = match nonce.checked_add(stride) {
                        Some(next) => next,
                        None => break None,
                    };
                };

                attempts.fetch_add(local_attempts, Ordering::SeqCst);
                outcome
            })
    });

    match winner {
        Some((nonce, digest)) => Ok(Solution {
            nonce,
            hash: hex::encode(digest),
            attempts: attempts.load(Ordering::SeqCst),
        }),
        None if cancel.is_cancelled() => Err(MiningError::Cancelled),
        None => Err(MiningError::NonceSpaceExhausted),
    }
}
