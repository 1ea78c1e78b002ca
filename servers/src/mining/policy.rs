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

//! Per-IP rate and abuse tracking: login failures, malformed requests
//! and invalid-share ratios, with decaying windows and TTL bans. All
//! state is in-memory and process-lifetime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::types::PolicyConfig;
use crate::util::Mutex;

#[derive(Default)]
struct IpBucket {
	valid_shares: u64,
	invalid_shares: u64,
	malformed: u32,
	failed_logins: u32,
	window_start: Option<Instant>,
	banned_until: Option<Instant>,
}

impl IpBucket {
	fn decay(&mut self, window: Duration, now: Instant) {
		match self.window_start {
			Some(start) if now.duration_since(start) >= window => {
				self.valid_shares = 0;
				self.invalid_shares = 0;
				self.malformed = 0;
				self.failed_logins = 0;
				self.window_start = Some(now);
			}
			Some(_) => {}
			None => self.window_start = Some(now),
		}
	}

	fn is_banned(&mut self, now: Instant) -> bool {
		match self.banned_until {
			Some(until) if now < until => true,
			Some(_) => {
				// Ban expired, forget it.
				self.banned_until = None;
				false
			}
			None => false,
		}
	}

	fn reset_shares(&mut self) {
		self.valid_shares = 0;
		self.invalid_shares = 0;
	}
}

/// The abuse policy engine. One bucket per remote IP.
pub struct PolicyServer {
	config: PolicyConfig,
	buckets: Mutex<HashMap<String, IpBucket>>,
}

impl PolicyServer {
	/// New engine with the given thresholds.
	pub fn new(config: PolicyConfig) -> PolicyServer {
		PolicyServer {
			config,
			buckets: Mutex::new(HashMap::new()),
		}
	}

	fn ban(bucket: &mut IpBucket, ip: &str, timeout: Duration, now: Instant) {
		warn!("Banning {} for {:?}", ip, timeout);
		bucket.banned_until = Some(now + timeout);
	}

	/// Gate for `eth_submitLogin`: false when the IP is banned.
	pub fn apply_login_policy(&self, login: &str, ip: &str) -> bool {
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(ip.to_string()).or_default();
		bucket.decay(self.decay_window(), now);
		if bucket.is_banned(now) {
			info!("Rejected login {} from banned ip {}", login, ip);
			return false;
		}
		true
	}

	/// Count a rejected login towards the IP's retry budget; bans the IP
	/// once the budget is spent.
	pub fn note_failed_login(&self, ip: &str) {
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(ip.to_string()).or_default();
		bucket.decay(self.decay_window(), now);
		bucket.failed_logins += 1;
		if bucket.failed_logins >= self.config.limits.login_attempts {
			Self::ban(bucket, ip, self.ban_timeout(), now);
		}
	}

	/// Count a malformed request; bans the IP past the malformed limit.
	pub fn apply_malformed_policy(&self, ip: &str) {
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(ip.to_string()).or_default();
		bucket.decay(self.decay_window(), now);
		bucket.malformed += 1;
		if bucket.malformed >= self.config.limits.malformed_limit {
			Self::ban(bucket, ip, self.ban_timeout(), now);
		}
	}

	/// Count a share submission verdict. Returns false when the invalid
	/// ratio over the current window crossed the banning threshold; the
	/// caller should close the connection.
	pub fn apply_share_policy(&self, ip: &str, valid_share: bool) -> bool {
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(ip.to_string()).or_default();
		bucket.decay(self.decay_window(), now);
		if valid_share {
			bucket.valid_shares += 1;
		} else {
			bucket.invalid_shares += 1;
		}
		if !self.config.banning.enabled {
			return true;
		}
		let total = bucket.valid_shares + bucket.invalid_shares;
		if total < self.config.banning.check_threshold {
			return true;
		}
		let ratio = bucket.invalid_shares as f64 / total as f64 * 100.0;
		if ratio >= self.config.banning.invalid_percent {
			Self::ban(bucket, ip, self.ban_timeout(), now);
			bucket.reset_shares();
			return false;
		}
		bucket.reset_shares();
		true
	}

	fn decay_window(&self) -> Duration {
		Duration::from_secs(self.config.limits.decay_secs)
	}

	fn ban_timeout(&self) -> Duration {
		Duration::from_secs(self.config.banning.timeout_secs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::types::{BanningConfig, LimitsConfig};
	use std::thread;

	fn config() -> PolicyConfig {
		PolicyConfig {
			banning: BanningConfig {
				enabled: true,
				check_threshold: 4,
				invalid_percent: 50.0,
				timeout_secs: 600,
			},
			limits: LimitsConfig {
				login_attempts: 3,
				malformed_limit: 3,
				decay_secs: 600,
			},
		}
	}

	#[test]
	fn bad_share_ratio_bans() {
		let policy = PolicyServer::new(config());
		assert!(policy.apply_share_policy("1.2.3.4", true));
		assert!(policy.apply_share_policy("1.2.3.4", false));
		assert!(policy.apply_share_policy("1.2.3.4", false));
		// Fourth submission hits the check threshold at 75% invalid.
		assert!(!policy.apply_share_policy("1.2.3.4", false));
		assert!(!policy.apply_login_policy("0xabc", "1.2.3.4"));
		// Another IP is unaffected.
		assert!(policy.apply_login_policy("0xabc", "5.6.7.8"));
	}

	#[test]
	fn good_shares_keep_connection_alive() {
		let policy = PolicyServer::new(config());
		for _ in 0..20 {
			assert!(policy.apply_share_policy("1.2.3.4", true));
		}
		assert!(policy.apply_login_policy("0xabc", "1.2.3.4"));
	}

	#[test]
	fn malformed_limit_bans() {
		let policy = PolicyServer::new(config());
		policy.apply_malformed_policy("9.9.9.9");
		policy.apply_malformed_policy("9.9.9.9");
		assert!(policy.apply_login_policy("0xabc", "9.9.9.9"));
		policy.apply_malformed_policy("9.9.9.9");
		assert!(!policy.apply_login_policy("0xabc", "9.9.9.9"));
	}

	#[test]
	fn failed_logins_spend_the_retry_budget() {
		let policy = PolicyServer::new(config());
		policy.note_failed_login("8.8.8.8");
		policy.note_failed_login("8.8.8.8");
		assert!(policy.apply_login_policy("0xabc", "8.8.8.8"));
		policy.note_failed_login("8.8.8.8");
		assert!(!policy.apply_login_policy("0xabc", "8.8.8.8"));
	}

	#[test]
	fn ban_expires_after_ttl() {
		let mut cfg = config();
		cfg.banning.timeout_secs = 0; // expires immediately
		let policy = PolicyServer::new(cfg);
		policy.apply_malformed_policy("7.7.7.7");
		policy.apply_malformed_policy("7.7.7.7");
		policy.apply_malformed_policy("7.7.7.7");
		thread::sleep(Duration::from_millis(5));
		assert!(policy.apply_login_policy("0xabc", "7.7.7.7"));
	}

	#[test]
	fn ban_is_monotonic_until_expiry() {
		let policy = PolicyServer::new(config());
		policy.note_failed_login("6.6.6.6");
		policy.note_failed_login("6.6.6.6");
		policy.note_failed_login("6.6.6.6");
		for _ in 0..5 {
			assert!(!policy.apply_login_policy("0xabc", "6.6.6.6"));
		}
	}
}
