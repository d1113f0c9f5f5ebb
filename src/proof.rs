use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use keccak_asm::{Digest, Keccak256};
use rand::Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use sha2::Sha256;

use crate::types::{Exhausted, FoundProof};
use crate::ui;

/// Fixed layout the farming contract hashes over:
/// `[0,4)` index (u32 BE), `[4,12)` nonce (u64 BE), `[12,44)` entropy,
/// `[44,76)` farmer key bytes.
pub const PROOF_LEN: usize = 76;

const PROGRESS_EVERY: u64 = 10_000;

pub fn encode_proof(index: u32, nonce: u64, entropy: &[u8; 32], farmer: &[u8; 32]) -> [u8; PROOF_LEN] {
    let mut buf = [0u8; PROOF_LEN];
    buf[..4].copy_from_slice(&index.to_be_bytes());
    buf[4..12].copy_from_slice(&nonce.to_be_bytes());
    buf[12..44].copy_from_slice(entropy);
    buf[44..].copy_from_slice(farmer);
    buf
}

pub fn proof_digest(index: u32, nonce: u64, entropy: &[u8; 32], farmer: &[u8; 32]) -> [u8; 32] {
    Keccak256::digest(encode_proof(index, nonce, entropy, farmer)).into()
}

/// Leading ASCII '0' count of a hex digest, the contract's difficulty measure.
pub fn leading_zeros(hex: &str) -> u32 {
    hex.bytes().take_while(|b| *b == b'0').count() as u32
}

/// Raw key bytes for a farmer address. Addresses that do not parse as an
/// ed25519 strkey fall back to the SHA-256 of their textual form; the
/// fallback is deterministic but embeds a different identity in the proof
/// than the chain key would.
pub fn decode_farmer(address: &str) -> [u8; 32] {
    match stellar_strkey::ed25519::PublicKey::from_string(address) {
        Ok(pk) => pk.0,
        Err(_) => Sha256::digest(address.as_bytes()).into(),
    }
}

/// Search nonces until a digest with at least `difficulty` leading zero hex
/// digits turns up, re-randomizing the entropy every attempt. Stops at
/// `max_attempts` and reports the best count seen.
pub fn search(
    farmer: &[u8; 32],
    index: u32,
    difficulty: u32,
    max_attempts: u64,
) -> Result<FoundProof, Exhausted> {
    let mut rng = rand::thread_rng();
    let mut best = 0u32;

    for attempt in 1..=max_attempts {
        let nonce: u64 = rng.gen();
        let mut entropy = [0u8; 32];
        rng.fill(&mut entropy[..]);

        let digest = proof_digest(index, nonce, &entropy, farmer);
        let zeros = leading_zeros(&hex::encode(digest));
        best = best.max(zeros);

        if zeros >= difficulty {
            return Ok(FoundProof {
                index,
                nonce,
                entropy,
                digest,
                zeros,
                attempts: attempt,
            });
        }

        if attempt % PROGRESS_EVERY == 0 {
            ui::print_line(vec![
                format!("Mining({index})"),
                format!("att: {attempt}"),
                format!("best: {best}"),
            ]);
        }
    }

    Err(Exhausted {
        attempts: max_attempts,
        best_zeros: best,
    })
}

/// Fan the attempt loop across the rayon pool. Attempts are stateless, so the
/// first qualifying proof wins and stops the rest; the cap bounds the total
/// attempt count across all workers.
pub fn search_parallel(
    farmer: &[u8; 32],
    index: u32,
    difficulty: u32,
    max_attempts: u64,
) -> Result<FoundProof, Exhausted> {
    let stop = AtomicBool::new(false);
    let attempts = AtomicU64::new(0);
    let best = AtomicU32::new(0);
    let (tx, rx) = crossbeam_channel::unbounded();

    (0..max_attempts).into_par_iter().try_for_each_with(tx, |s, _| {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;

        let nonce: u64 = rand::random();
        let mut entropy = [0u8; 32];
        rand::thread_rng().fill(&mut entropy[..]);

        let digest = proof_digest(index, nonce, &entropy, farmer);
        let zeros = leading_zeros(&hex::encode(digest));
        best.fetch_max(zeros, Ordering::Relaxed);

        if zeros >= difficulty {
            stop.store(true, Ordering::Relaxed);
            let _ = s.send(FoundProof {
                index,
                nonce,
                entropy,
                digest,
                zeros,
                attempts: attempt,
            });
            return None;
        }

        if attempt % PROGRESS_EVERY == 0 {
            ui::print_line(vec![
                format!("Mining({index})"),
                format!("att: {attempt}"),
                format!("best: {}", best.load(Ordering::Relaxed)),
            ]);
        }
        Some(())
    });

    match rx.into_iter().next() {
        Some(proof) => Ok(proof),
        None => Err(Exhausted {
            attempts: attempts.load(Ordering::Relaxed),
            best_zeros: best.load(Ordering::Relaxed),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // strkey for the payload 0x00 0x01 .. 0x1f
    const FARMER_STRKEY: &str = "GAAACAQDAQCQMBYIBEFAWDANBYHRAEISCMKBKFQXDAMRUGY4DUPB7JZX";

    fn farmer() -> [u8; 32] {
        let mut f = [0u8; 32];
        for (i, b) in f.iter_mut().enumerate() {
            *b = i as u8;
        }
        f
    }

    #[test]
    fn proof_buffer_layout() {
        let entropy = [7u8; 32];
        let farmer = [9u8; 32];
        let buf = encode_proof(1, 0xDEAD_BEEF, &entropy, &farmer);

        assert_eq!(buf.len(), PROOF_LEN);
        assert_eq!(&buf[..4], &1u32.to_be_bytes());
        assert_eq!(&buf[4..12], &0xDEAD_BEEFu64.to_be_bytes());
        assert_eq!(&buf[12..44], &entropy);
        assert_eq!(&buf[44..], &farmer);
    }

    #[test]
    fn digest_is_deterministic_hex() {
        let entropy = [3u8; 32];
        let a = proof_digest(42, 7, &entropy, &farmer());
        let b = proof_digest(42, 7, &entropy, &farmer());
        assert_eq!(a, b);

        let hex = hex::encode(a);
        assert_eq!(hex.len(), 64);
        assert!(hex.bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn counts_leading_zero_digits() {
        assert_eq!(leading_zeros("00ab"), 2);
        assert_eq!(leading_zeros("abc0"), 0);
        assert_eq!(leading_zeros(&"0".repeat(64)), 64);
        assert_eq!(leading_zeros(""), 0);
    }

    #[test]
    fn decodes_strkey_addresses() {
        assert_eq!(decode_farmer(FARMER_STRKEY), farmer());
    }

    #[test]
    fn falls_back_to_hash_for_bad_addresses() {
        let raw = decode_farmer("not an address");
        let expected: [u8; 32] = Sha256::digest("not an address".as_bytes()).into();
        assert_eq!(raw, expected);
        // stable across calls
        assert_eq!(raw, decode_farmer("not an address"));
    }

    #[test]
    fn difficulty_zero_succeeds_first_attempt() {
        let proof = search(&farmer(), 1, 0, 100).unwrap();
        assert_eq!(proof.attempts, 1);
        assert_eq!(proof.zeros, leading_zeros(&proof.hash_hex()));
    }

    #[test]
    fn exhausts_the_attempt_cap() {
        let err = search(&farmer(), 1, 8, 5).unwrap_err();
        assert_eq!(err.attempts, 5);
        assert!(err.best_zeros < 8);
    }

    #[test]
    fn found_proof_meets_difficulty() {
        let proof = search(&farmer(), 1, 1, 100_000).unwrap();
        assert!(proof.zeros >= 1);
        assert!(proof.hash_hex().starts_with('0'));
        assert_eq!(
            proof.digest,
            proof_digest(proof.index, proof.nonce, &proof.entropy, &farmer())
        );
    }

    #[test]
    fn parallel_search_finds_and_exhausts() {
        let proof = search_parallel(&farmer(), 1, 0, 100).unwrap();
        assert_eq!(proof.zeros, leading_zeros(&proof.hash_hex()));

        let err = search_parallel(&farmer(), 1, 8, 5).unwrap_err();
        assert_eq!(err.attempts, 5);
    }
}
