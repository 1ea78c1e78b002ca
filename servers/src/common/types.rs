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

//! Server types: configuration sections and the crate error type.

use std::fmt;
use std::io;
use std::num::ParseIntError;

/// Error type wrapping the failures the proxy surfaces outside a session.
/// Per-session protocol errors never reach this type, they are answered
/// in-band as JSON error members.
#[derive(Debug)]
pub enum Error {
	/// Invalid or unusable configuration value.
	Config(String),
	/// I/O error, typically from the stratum listener.
	Io(io::Error),
	/// Upstream node RPC failure (recoverable, callers log and move on).
	Upstream(String),
	/// Accounting backend failure.
	Storage(String),
	/// Malformed data where a hex quantity or work reply was expected.
	Format(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Error::Config(ref msg) => write!(f, "configuration error: {}", msg),
			Error::Io(ref e) => write!(f, "I/O error: {}", e),
			Error::Upstream(ref msg) => write!(f, "upstream error: {}", msg),
			Error::Storage(ref msg) => write!(f, "storage error: {}", msg),
			Error::Format(ref msg) => write!(f, "format error: {}", msg),
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e)
	}
}

impl From<ParseIntError> for Error {
	fn from(e: ParseIntError) -> Error {
		Error::Format(e.to_string())
	}
}

/// Upstream node connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
	/// Display name used in log lines.
	#[serde(default = "default_upstream_name")]
	pub name: String,
	/// Base URL of the node JSON-RPC endpoint.
	#[serde(default = "default_upstream_url")]
	pub url: String,
	/// Per-request timeout.
	#[serde(default = "default_upstream_timeout_secs")]
	pub timeout_secs: u64,
	/// Consecutive request failures after which the upstream is
	/// considered sick and getWork responses are withheld.
	#[serde(default = "default_upstream_max_fails")]
	pub max_fails: u64,
}

fn default_upstream_name() -> String {
	"main".to_string()
}
fn default_upstream_url() -> String {
	"http://127.0.0.1:38391".to_string()
}
fn default_upstream_timeout_secs() -> u64 {
	5
}
fn default_upstream_max_fails() -> u64 {
	5
}

impl Default for UpstreamConfig {
	fn default() -> UpstreamConfig {
		UpstreamConfig {
			name: default_upstream_name(),
			url: default_upstream_url(),
			timeout_secs: default_upstream_timeout_secs(),
			max_fails: default_upstream_max_fails(),
		}
	}
}

/// Stratum listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumConfig {
	/// Run the stratum TCP listener.
	#[serde(default = "default_stratum_enabled")]
	pub enabled: bool,
	/// Address and port to listen on.
	#[serde(default = "default_stratum_listen")]
	pub listen: String,
	/// Per-connection idle timeout; a session that stays silent longer
	/// than this is disconnected.
	#[serde(default = "default_stratum_timeout_secs")]
	pub timeout_secs: u64,
}

fn default_stratum_enabled() -> bool {
	true
}
fn default_stratum_listen() -> String {
	"0.0.0.0:8008".to_string()
}
fn default_stratum_timeout_secs() -> u64 {
	120
}

impl Default for StratumConfig {
	fn default() -> StratumConfig {
		StratumConfig {
			enabled: default_stratum_enabled(),
			listen: default_stratum_listen(),
			timeout_secs: default_stratum_timeout_secs(),
		}
	}
}

/// Work distribution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
	/// How often the template fetcher polls the upstream for fresh work,
	/// in milliseconds.
	#[serde(default = "default_block_refresh_ms")]
	pub block_refresh_ms: u64,
	/// How often the stats snapshot is rebuilt, in seconds.
	#[serde(default = "default_state_update_secs")]
	pub state_update_secs: u64,
	/// Fallback share difficulty, used for the session target before any
	/// template has been fetched.
	#[serde(default = "default_difficulty")]
	pub difficulty: u64,
	/// Shard whose work this proxy serves, `0x`-prefixed hex.
	#[serde(default = "default_shard_id")]
	pub shard_id: String,
	/// Expected miner-contract bytecode; empty disables the check.
	#[serde(default)]
	pub byte_code: String,
	/// Expected pool maintainer address in contract storage slot 8;
	/// empty disables the check.
	#[serde(default)]
	pub admin: String,
	/// Minimum pool fee in contract storage slot 9; zero disables the
	/// check.
	#[serde(default)]
	pub fee: u64,
}

fn default_block_refresh_ms() -> u64 {
	500
}
fn default_state_update_secs() -> u64 {
	10
}
fn default_difficulty() -> u64 {
	2_000_000_000
}
fn default_shard_id() -> String {
	"0x0".to_string()
}

impl Default for ProxyConfig {
	fn default() -> ProxyConfig {
		ProxyConfig {
			block_refresh_ms: default_block_refresh_ms(),
			state_update_secs: default_state_update_secs(),
			difficulty: default_difficulty(),
			shard_id: default_shard_id(),
			byte_code: String::new(),
			admin: String::new(),
			fee: 0,
		}
	}
}

/// Thresholds for banning abusive IPs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanningConfig {
	/// Master switch for share-ratio banning.
	#[serde(default = "default_banning_enabled")]
	pub enabled: bool,
	/// Number of submissions after which the invalid-share ratio is
	/// evaluated.
	#[serde(default = "default_check_threshold")]
	pub check_threshold: u64,
	/// Percentage of invalid shares within a window that triggers a ban.
	#[serde(default = "default_invalid_percent")]
	pub invalid_percent: f64,
	/// How long a ban lasts.
	#[serde(default = "default_ban_timeout_secs")]
	pub timeout_secs: u64,
}

fn default_banning_enabled() -> bool {
	true
}
fn default_check_threshold() -> u64 {
	30
}
fn default_invalid_percent() -> f64 {
	30.0
}
fn default_ban_timeout_secs() -> u64 {
	600
}

impl Default for BanningConfig {
	fn default() -> BanningConfig {
		BanningConfig {
			enabled: default_banning_enabled(),
			check_threshold: default_check_threshold(),
			invalid_percent: default_invalid_percent(),
			timeout_secs: default_ban_timeout_secs(),
		}
	}
}

/// Per-IP rate limits with a shared decay window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
	/// Failed logins tolerated within the decay window.
	#[serde(default = "default_login_attempts")]
	pub login_attempts: u32,
	/// Malformed requests tolerated within the decay window.
	#[serde(default = "default_malformed_limit")]
	pub malformed_limit: u32,
	/// Length of the decay window after which per-IP counters reset.
	#[serde(default = "default_decay_secs")]
	pub decay_secs: u64,
}

fn default_login_attempts() -> u32 {
	5
}
fn default_malformed_limit() -> u32 {
	5
}
fn default_decay_secs() -> u64 {
	600
}

impl Default for LimitsConfig {
	fn default() -> LimitsConfig {
		LimitsConfig {
			login_attempts: default_login_attempts(),
			malformed_limit: default_malformed_limit(),
			decay_secs: default_decay_secs(),
		}
	}
}

/// Abuse policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
	/// Banning thresholds.
	#[serde(default)]
	pub banning: BanningConfig,
	/// Rate limits.
	#[serde(default)]
	pub limits: LimitsConfig,
}

/// Full server configuration, aggregating the configurations required
/// for the different components.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
	/// Upstream node.
	#[serde(default)]
	pub upstream: UpstreamConfig,
	/// Stratum listener.
	#[serde(default)]
	pub stratum: StratumConfig,
	/// Work distribution.
	#[serde(default)]
	pub proxy: ProxyConfig,
	/// Abuse policy.
	#[serde(default)]
	pub policy: PolicyConfig,
}
