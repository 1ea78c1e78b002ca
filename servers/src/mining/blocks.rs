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

//! Per-miner block templates and the registry that distributes them.
//! Templates are immutable once built; an update replaces the whole
//! cell, so readers either see the old template or the new one, never a
//! mix.

use std::collections::HashMap;
use std::sync::Arc;

use primitive_types::U256;
use serde_json::Value;

use crate::common::types::Error;
use crate::mining::pow;
use crate::rpc::GetWorkReply;
use crate::util::{to_hex_prefixed, RwLock};

/// How many recent headers stay valid for late submissions, in blocks,
/// beyond the current one.
pub const MAX_BACKLOG: u64 = 3;

/// Guardian shards hand out a share difficulty scaled down from the
/// network difficulty by this factor.
pub const GUARDIAN_FACTOR: u64 = 10000;

/// Difficulty and height a backlog header was issued under; shares
/// referencing that header are judged against exactly these values.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightDiffPair {
	/// Share difficulty at issue time.
	pub diff: U256,
	/// Height at issue time.
	pub height: u64,
}

/// One unit of work handed to a miner, plus the backlog of recent
/// headers still accepted from it.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
	/// Header hash identifying the current job, `0x` hex.
	pub header: String,
	/// Epoch seed for the job height, `0x` hex.
	pub seed: String,
	/// Share target, canonical `0x` hex of `2^256 / difficulty`.
	pub target: String,
	/// Effective share difficulty (guardian-scaled where applicable).
	pub difficulty: U256,
	/// Network difficulty, known on guardian shards.
	pub network_difficulty: Option<U256>,
	/// Block height of the current job.
	pub height: u64,
	/// Recent headers still accepted, keyed by header hash.
	pub headers: HashMap<String, HeightDiffPair>,
	/// Upstream pending-block snapshot, forwarded opaquely.
	pub pending_cache: Option<Value>,
}

impl BlockTemplate {
	/// Build a template from an upstream work reply, carrying over the
	/// still-fresh backlog entries of the template it replaces.
	pub fn build(
		reply: &GetWorkReply,
		prev: Option<&BlockTemplate>,
		pending: Option<Value>,
	) -> Result<BlockTemplate, Error> {
		let height = crate::util::hex_to_u64(&reply.height_hex)?;
		let share_diff = parse_diff(&reply.diff_hex)?;
		let network_difficulty = match reply.network_diff_hex {
			Some(ref hex) => Some(parse_diff(hex)?),
			None => None,
		};
		let difficulty = if network_difficulty.is_some() {
			share_diff / U256::from(GUARDIAN_FACTOR)
		} else {
			share_diff
		};
		if difficulty.is_zero() {
			return Err(Error::Format(format!(
				"effective difficulty is zero (share difficulty {})",
				share_diff
			)));
		}

		let mut headers = HashMap::new();
		if let Some(prev) = prev {
			// Keep the freshest backlog entries that are still within
			// range of the new height, bounded so the map never grows
			// past MAX_BACKLOG plus the current header.
			let cutoff = height.saturating_sub(MAX_BACKLOG);
			let mut carried: Vec<(&String, &HeightDiffPair)> = prev
				.headers
				.iter()
				.filter(|(h, pair)| pair.height > cutoff && **h != reply.header)
				.collect();
			carried.sort_by(|a, b| b.1.height.cmp(&a.1.height));
			carried.truncate(MAX_BACKLOG as usize);
			for (h, pair) in carried {
				headers.insert(h.clone(), pair.clone());
			}
		}
		headers.insert(
			reply.header.clone(),
			HeightDiffPair {
				diff: difficulty,
				height,
			},
		);

		Ok(BlockTemplate {
			header: reply.header.clone(),
			seed: to_hex_prefixed(&pow::seed_hash(height)),
			target: pow::target_hex(difficulty),
			difficulty,
			network_difficulty,
			height,
			headers,
			pending_cache: pending,
		})
	}

	/// Backlog entry for the given header hash, if still accepted.
	pub fn backlog_entry(&self, header: &str) -> Option<&HeightDiffPair> {
		self.headers.get(header)
	}
}

fn parse_diff(hex: &str) -> Result<U256, Error> {
	U256::from_str_radix(hex.trim_start_matches("0x"), 16)
		.map_err(|e| Error::Format(format!("bad difficulty {}: {}", hex, e)))
}

/// Per-login template cells plus the flags driving job broadcast. Cell
/// writes replace the whole Arc, loads are a clone of it; both happen
/// under short critical sections of a single lock.
pub struct TemplateRegistry {
	cells: RwLock<HashMap<String, Arc<BlockTemplate>>>,
	updated: RwLock<HashMap<String, bool>>,
}

impl TemplateRegistry {
	/// New empty registry.
	pub fn new() -> TemplateRegistry {
		TemplateRegistry {
			cells: RwLock::new(HashMap::new()),
			updated: RwLock::new(HashMap::new()),
		}
	}

	/// Current template for the login, if one has been fetched.
	pub fn current(&self, login: &str) -> Option<Arc<BlockTemplate>> {
		self.cells.read().get(login).cloned()
	}

	/// Swap in a new template for the login.
	pub fn replace(&self, login: &str, template: BlockTemplate) {
		self.cells
			.write()
			.insert(login.to_string(), Arc::new(template));
	}

	/// Mark the start of a refresh: the login is not due a broadcast
	/// until the refresh stores something new.
	pub fn begin_refresh(&self, login: &str) {
		self.updated.write().insert(login.to_string(), false);
	}

	/// Flag the login for the next broadcast cycle.
	pub fn mark_updated(&self, login: &str) {
		self.updated.write().insert(login.to_string(), true);
	}

	/// Logins currently flagged for broadcast.
	pub fn updated_logins(&self) -> Vec<String> {
		self.updated
			.read()
			.iter()
			.filter(|(_, updated)| **updated)
			.map(|(login, _)| login.clone())
			.collect()
	}

	/// Drop cells and flags for logins that are no longer connected.
	pub fn prune<F>(&self, is_active: F)
	where
		F: Fn(&str) -> bool,
	{
		self.cells.write().retain(|login, _| is_active(login));
		self.updated.write().retain(|login, _| is_active(login));
	}

	/// All current templates, for the stats surface.
	pub fn templates(&self) -> Vec<Arc<BlockTemplate>> {
		self.cells.read().values().cloned().collect()
	}
}

impl Default for TemplateRegistry {
	fn default() -> TemplateRegistry {
		TemplateRegistry::new()
	}
}
