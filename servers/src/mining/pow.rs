// Copyright 2019 The qpool Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ethash-side arithmetic: epoch seeds, difficulty/target conversions
//! and the proof-of-work verification seam.

use primitive_types::{U256, U512};
use sha3::{Digest, Keccak256, Keccak512};

/// Blocks per Ethash epoch.
pub const EPOCH_LENGTH: u64 = 30000;

fn pow256() -> U512 {
	U512::one() << 256
}

fn u512_to_u256_saturating(v: U512) -> U256 {
	if v > U512::from(U256::MAX) {
		return U256::MAX;
	}
	let mut bytes = [0u8; 64];
	v.to_big_endian(&mut bytes);
	U256::from_big_endian(&bytes[32..])
}

/// The seed to use for verifying work at the given height. A 32-byte
/// buffer of zeroes for the first epoch, hashed once more with
/// Keccak-256 for every later epoch. Pure function of the height.
pub fn seed_hash(height: u64) -> [u8; 32] {
	let mut seed = [0u8; 32];
	if height < EPOCH_LENGTH {
		return seed;
	}
	// One hasher reused across rounds, never across threads.
	let mut keccak256 = Keccak256::new();
	for _ in 0..height / EPOCH_LENGTH {
		keccak256.update(&seed);
		seed.copy_from_slice(&keccak256.finalize_reset());
	}
	seed
}

/// `floor(2^256 / diff)`, saturated to U256. The saturation only kicks
/// in at difficulty 1, where the true quotient needs 257 bits.
pub fn target_from_diff(diff: U256) -> U256 {
	u512_to_u256_saturating(pow256() / U512::from(diff))
}

/// `floor(2^256 / target)`; the same quotient read in the opposite
/// direction, also used to turn a solution digest into its achieved
/// difficulty.
pub fn diff_from_target(target: U256) -> U256 {
	u512_to_u256_saturating(pow256() / U512::from(target))
}

/// Canonical `0x` hex of the exact `2^256 / diff` quotient, including
/// the 257-bit difficulty-1 case the saturating form cannot represent.
pub fn target_hex(diff: U256) -> String {
	format!("{:#x}", pow256() / U512::from(diff))
}

/// Proof-of-work verification seam. Implementations must be
/// deterministic and referentially transparent: the same inputs always
/// produce the same verdict.
pub trait PowVerifier: Send + Sync {
	/// Check a solution against the given target. Returns the achieved
	/// difficulty when the solution meets the target, `None` otherwise.
	fn verify(
		&self,
		header: &[u8; 32],
		nonce: u64,
		mix_digest: &[u8; 32],
		seed: &[u8; 32],
		target: U256,
	) -> Option<U256>;
}

/// Verifier of the Ethash finalization: recomputes
/// `keccak256(keccak512(header ‖ nonce_le) ‖ mix)` and compares it to
/// the target. The mix digest itself is taken at face value; a
/// dataset-backed implementation slots in through `PowVerifier` where
/// full mix recomputation is required.
#[derive(Default)]
pub struct EthashMixVerifier;

impl EthashMixVerifier {
	/// New verifier. Stateless, can be shared freely.
	pub fn new() -> EthashMixVerifier {
		EthashMixVerifier
	}

	/// The finalization digest for the given solution.
	pub fn final_digest(header: &[u8; 32], nonce: u64, mix_digest: &[u8; 32]) -> [u8; 32] {
		let mut keccak512 = Keccak512::new();
		keccak512.update(&header[..]);
		keccak512.update(&nonce.to_le_bytes());
		let inner = keccak512.finalize();

		let mut keccak256 = Keccak256::new();
		keccak256.update(&inner);
		keccak256.update(&mix_digest[..]);
		let mut out = [0u8; 32];
		out.copy_from_slice(&keccak256.finalize());
		out
	}
}

impl PowVerifier for EthashMixVerifier {
	fn verify(
		&self,
		header: &[u8; 32],
		nonce: u64,
		mix_digest: &[u8; 32],
		_seed: &[u8; 32],
		target: U256,
	) -> Option<U256> {
		let digest = Self::final_digest(header, nonce, mix_digest);
		let value = U256::from_big_endian(&digest);
		if value.is_zero() {
			return Some(U256::MAX);
		}
		if value <= target {
			Some(diff_from_target(value))
		} else {
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::to_hex;

	// keccak256 of 32 zero bytes
	const EPOCH_1_SEED: &str = "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563";

	#[test]
	fn seed_is_zero_for_first_epoch() {
		assert_eq!(seed_hash(0), [0u8; 32]);
		assert_eq!(seed_hash(29999), [0u8; 32]);
	}

	#[test]
	fn seed_advances_per_epoch() {
		assert_eq!(to_hex(&seed_hash(30000)), EPOCH_1_SEED);
		assert_eq!(seed_hash(30000), seed_hash(59999));

		let mut keccak256 = Keccak256::new();
		keccak256.update(&seed_hash(30000));
		let mut second = [0u8; 32];
		second.copy_from_slice(&keccak256.finalize());
		assert_eq!(seed_hash(60000), second);
	}

	#[test]
	fn seed_is_deterministic() {
		assert_eq!(seed_hash(123_456), seed_hash(123_456));
	}

	#[test]
	fn target_division_identity() {
		// floor semantics: target * diff <= 2^256 < target * (diff + 1)
		for diff in &[2u64, 3, 1000, 10_000, 2_000_000_000, u64::max_value()] {
			let d = U512::from(*diff);
			let q = pow256() / d;
			assert!(q * d <= pow256());
			assert!(q * (d + U512::one()) > pow256());
		}
	}

	#[test]
	fn target_and_difficulty_are_inverse() {
		let diff = U256::from(2_000_000_000u64);
		let target = target_from_diff(diff);
		assert_eq!(diff_from_target(target), diff);
	}

	#[test]
	fn target_hex_is_canonical() {
		assert_eq!(
			target_hex(U256::from(2)),
			format!("0x8{}", "0".repeat(63))
		);
		// Difficulty 1 needs the full 257-bit quotient.
		assert_eq!(target_hex(U256::one()), format!("0x1{}", "0".repeat(64)));
		let parsed = U256::from_str_radix(
			target_hex(U256::from(2_000_000_000u64)).trim_start_matches("0x"),
			16,
		)
		.unwrap();
		assert_eq!(parsed, target_from_diff(U256::from(2_000_000_000u64)));
	}

	#[test]
	fn mix_verifier_judges_against_target() {
		let verifier = EthashMixVerifier::new();
		let header = [0x11u8; 32];
		let mix = [0x22u8; 32];
		let nonce = 0x4242_4242_4242_4242u64;
		let seed = seed_hash(0);

		let digest = EthashMixVerifier::final_digest(&header, nonce, &mix);
		let value = U256::from_big_endian(&digest);

		// A target at the digest value accepts, one just below rejects.
		let actual = verifier.verify(&header, nonce, &mix, &seed, value).unwrap();
		assert_eq!(actual, diff_from_target(value));
		assert!(verifier
			.verify(&header, nonce, &mix, &seed, value - U256::one())
			.is_none());
	}

	#[test]
	fn mix_verifier_is_nonce_sensitive() {
		let header = [0xabu8; 32];
		let mix = [0xcdu8; 32];
		let a = EthashMixVerifier::final_digest(&header, 1, &mix);
		let b = EthashMixVerifier::final_digest(&header, 2, &mix);
		assert_ne!(a, b);
	}
}
