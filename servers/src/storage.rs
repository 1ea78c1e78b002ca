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

//! Accounting backend seam. The production store lives outside this
//! crate; the proxy only needs the handful of operations below, and the
//! in-memory implementation backs tests and single-process deployments.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;

use crate::common::types::Error;
use crate::util::Mutex;

/// An accepted share, as handed to the accounting backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRecord {
	/// Miner address.
	pub login: String,
	/// Worker tag, already normalized.
	pub worker: String,
	/// Submitting IP.
	pub ip: String,
	/// Share difficulty the submission was judged under.
	pub difficulty: U256,
	/// Height of the job the share solves.
	pub height: u64,
	/// Header hash of the job the share solves.
	pub header: String,
	/// Submission time, unix milliseconds.
	pub timestamp_ms: i64,
}

/// A share that also meets the network difficulty and was pushed
/// upstream. Nonce and mix digest are kept for later inclusion checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
	/// The underlying share.
	pub share: ShareRecord,
	/// Solution nonce, `0x` hex.
	pub nonce: String,
	/// Solution mix digest, `0x` hex.
	pub mix_digest: String,
}

/// Operations the share pipeline needs from the accounting store.
///
/// `insert_share_unique` must be linearizable: out of any number of
/// concurrent inserts of the same `(header, nonce)` pair exactly one
/// caller observes `false`.
pub trait ShareLog: Send + Sync {
	/// Whether the login has been seen before.
	fn is_miner_registered(&self, login: &str) -> Result<bool, Error>;
	/// Record a first-time login.
	fn register_miner(&self, login: &str) -> Result<(), Error>;
	/// Atomically record a `(header, nonce)` pair, reporting whether it
	/// already existed.
	fn insert_share_unique(&self, header: &str, nonce: &str) -> Result<bool, Error>;
	/// Persist an accepted share.
	fn write_share(&self, share: &ShareRecord) -> Result<(), Error>;
	/// Persist a candidate block.
	fn write_candidate(&self, candidate: &CandidateRecord) -> Result<(), Error>;
	/// Best-effort record of a miner-reported hashrate sample.
	fn record_hashrate(
		&self,
		login: &str,
		worker: &str,
		rate: u64,
		timestamp_ms: i64,
	) -> Result<(), Error>;
}

#[derive(Default)]
struct MemShareLogInner {
	miners: HashSet<String>,
	seen_shares: HashSet<String>,
	shares: Vec<ShareRecord>,
	candidates: Vec<CandidateRecord>,
	hashrates: HashMap<String, (u64, i64)>,
}

/// In-memory `ShareLog`. State is process-lifetime only.
#[derive(Default)]
pub struct MemShareLog {
	inner: Mutex<MemShareLogInner>,
}

impl MemShareLog {
	/// New empty log.
	pub fn new() -> MemShareLog {
		MemShareLog::default()
	}

	/// Snapshot of accepted shares, oldest first.
	pub fn shares(&self) -> Vec<ShareRecord> {
		self.inner.lock().shares.clone()
	}

	/// Snapshot of candidate blocks, oldest first.
	pub fn candidates(&self) -> Vec<CandidateRecord> {
		self.inner.lock().candidates.clone()
	}

	/// Registered logins.
	pub fn miners(&self) -> Vec<String> {
		self.inner.lock().miners.iter().cloned().collect()
	}

	/// Last hashrate sample reported for `login.worker`, if any.
	pub fn hashrate(&self, login: &str, worker: &str) -> Option<(u64, i64)> {
		self.inner
			.lock()
			.hashrates
			.get(&format!("{}.{}", login, worker))
			.copied()
	}
}

impl ShareLog for MemShareLog {
	fn is_miner_registered(&self, login: &str) -> Result<bool, Error> {
		Ok(self.inner.lock().miners.contains(login))
	}

	fn register_miner(&self, login: &str) -> Result<(), Error> {
		self.inner.lock().miners.insert(login.to_string());
		Ok(())
	}

	fn insert_share_unique(&self, header: &str, nonce: &str) -> Result<bool, Error> {
		let key = format!("share:{}:{}", header, nonce);
		Ok(!self.inner.lock().seen_shares.insert(key))
	}

	fn write_share(&self, share: &ShareRecord) -> Result<(), Error> {
		self.inner.lock().shares.push(share.clone());
		Ok(())
	}

	fn write_candidate(&self, candidate: &CandidateRecord) -> Result<(), Error> {
		self.inner.lock().candidates.push(candidate.clone());
		Ok(())
	}

	fn record_hashrate(
		&self,
		login: &str,
		worker: &str,
		rate: u64,
		timestamp_ms: i64,
	) -> Result<(), Error> {
		self.inner
			.lock()
			.hashrates
			.insert(format!("{}.{}", login, worker), (rate, timestamp_ms));
		Ok(())
	}
}
