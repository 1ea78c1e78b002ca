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

//! Proxy stat collection types, to be used by tests, logging or an
//! external dashboard to observe proxy status.

use chrono::prelude::*;
use serde_json::Value;

/// Struct to return relevant information about a stratum session.
#[derive(Clone, Serialize, Debug)]
pub struct SessionStats {
	/// Unique id for this session
	pub id: u64,
	/// Remote IP
	pub ip: String,
	/// Login the session authenticated as, if any
	pub login: Option<String>,
	/// Last share target sent to this session
	pub last_target: String,
	/// number of valid shares submitted
	pub num_accepted: u64,
	/// number of invalid shares submitted
	pub num_invalid: u64,
	/// number of shares referencing unknown or expired jobs
	pub num_stale: u64,
	/// Timestamp of the most recent request on this session
	pub last_seen: DateTime<Utc>,
}

/// Struct to return relevant information about the proxy.
#[derive(Clone, Serialize, Debug)]
pub struct ProxyStats {
	/// whether the stratum listener is up
	pub is_running: bool,
	/// Number of connected sessions
	pub num_sessions: usize,
	/// Number of distinct logins across sessions
	pub num_logins: usize,
	/// Highest template height seen
	pub block_height: u64,
	/// Whether the upstream is currently considered sick
	pub upstream_sick: bool,
	/// Accepted shares since start
	pub accepted_shares: u64,
	/// Invalid shares since start
	pub invalid_shares: u64,
	/// Candidate blocks since start
	pub candidate_blocks: u64,
	/// Most recent upstream pending-block snapshot, forwarded opaquely
	pub pending_block: Option<Value>,
	/// Individual session status
	pub session_stats: Vec<SessionStats>,
	/// When this snapshot was built
	pub updated_at: DateTime<Utc>,
}

impl Default for ProxyStats {
	fn default() -> ProxyStats {
		ProxyStats {
			is_running: false,
			num_sessions: 0,
			num_logins: 0,
			block_height: 0,
			upstream_sick: false,
			accepted_shares: 0,
			invalid_shares: 0,
			candidate_blocks: 0,
			pending_block: None,
			session_stats: Vec::new(),
			updated_at: Utc::now(),
		}
	}
}
