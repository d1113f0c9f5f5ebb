use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

/// A qualifying proof produced by the search: the nonce/entropy pair whose
/// digest carried at least the requested number of leading zero hex digits.
#[derive(Clone, Debug)]
pub struct FoundProof {
    pub index: u32,
    pub nonce: u64,
    pub entropy: [u8; 32],
    pub digest: [u8; 32],
    pub zeros: u32,
    pub attempts: u64,
}

impl FoundProof {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// The attempt cap ran out before a qualifying digest showed up. Recoverable:
/// callers retry at a lower difficulty.
#[derive(Clone, Debug, Error)]
#[error("no qualifying hash after {attempts} attempts (best: {best_zeros} zeros)")]
pub struct Exhausted {
    pub attempts: u64,
    pub best_zeros: u32,
}

/// Outcome of one confirmed contract call: the transaction hash plus the
/// decoded return value of the invocation.
#[derive(Clone, Debug)]
pub struct Receipt<T> {
    pub hash: String,
    pub value: T,
}

/// The step at which a farming cycle gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Plant,
    Hash,
    Work,
    Harvest,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Plant => "plant",
            Step::Hash => "hash",
            Step::Work => "work",
            Step::Harvest => "harvest",
        };
        f.write_str(s)
    }
}

/// Result of a full plant/work/harvest cycle. A failed harvest does not void
/// the cycle: the plant and work receipts are still reported, with the
/// harvest error alongside.
#[derive(Debug)]
pub struct CycleReport {
    pub plant: Receipt<()>,
    pub proof: FoundProof,
    pub work: Receipt<u32>,
    pub harvest: Option<Receipt<i128>>,
    pub harvest_error: Option<String>,
}

impl CycleReport {
    /// Harvest is the only step that can fail without voiding the report.
    pub fn failed_step(&self) -> Option<Step> {
        self.harvest_error.as_ref().map(|_| Step::Harvest)
    }
}

#[derive(Clone, Debug)]
pub struct CycleConfig {
    pub index: u32,
    pub amount: i128,
    pub difficulty: u32,
    pub fallback_difficulty: u32,
    pub max_attempts: u64,
    pub threads: usize,
    pub settle: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            index: 1,
            amount: 0,
            difficulty: 2,
            fallback_difficulty: 1,
            max_attempts: 100_000,
            threads: 1,
            settle: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MinerConfig {
    pub index: u32,
    pub difficulty: u32,
    pub max_attempts: u64,
    pub threads: usize,
    pub interval: Duration,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            index: 1,
            difficulty: 2,
            max_attempts: 100_000,
            threads: 1,
            interval: Duration::from_secs(10),
        }
    }
}

/// Counters for a continuous mining run. Never reset mid-run; a stopped run
/// keeps its numbers.
#[derive(Debug, Default)]
pub struct MiningStats {
    pub attempts: u64,
    pub successful_hashes: u64,
    pub total_rewards: u64,
    pub start: Option<Instant>,
}

impl MiningStats {
    pub fn success_rate(&self) -> u64 {
        if self.attempts > 0 {
            self.successful_hashes * 100 / self.attempts
        } else {
            0
        }
    }

    pub fn duration_secs(&self) -> u64 {
        self.start.map(|s| s.elapsed().as_secs()).unwrap_or(0)
    }
}
