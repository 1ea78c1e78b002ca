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

//! Configuration file management

use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::path::PathBuf;

use crate::servers::ServerConfig;
use crate::types::{ConfigError, ConfigMembers};
use crate::util::LoggingConfig;

/// Base name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "qpool.toml";
const QPOOL_HOME: &str = ".qpool";

/// Whether a configuration file already exists at the conventional
/// locations (current dir first, then the home dot-directory).
pub fn config_file_exists() -> bool {
	default_locations().iter().any(|p| p.exists())
}

fn default_locations() -> Vec<PathBuf> {
	let mut locations = vec![];
	if let Ok(mut current) = env::current_dir() {
		current.push(CONFIG_FILE_NAME);
		locations.push(current);
	}
	if let Some(mut home) = dirs::home_dir() {
		home.push(QPOOL_HOME);
		home.push(CONFIG_FILE_NAME);
		locations.push(home);
	}
	locations
}

/// Going to hold all of the various configuration types separately for
/// now, then put them together as a single ServerConfig object
/// afterwards. This is to flatten out the configuration file into
/// logical sections, as they tend to be quite nested in the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
	/// Keep track of the file we've read
	pub config_file_path: Option<PathBuf>,
	/// Keep track of whether we're using a config file or just the
	/// defaults for each member
	pub using_config_file: bool,
	/// Global member config
	pub members: Option<ConfigMembers>,
}

impl Default for GlobalConfig {
	fn default() -> GlobalConfig {
		GlobalConfig {
			config_file_path: None,
			using_config_file: false,
			members: Some(ConfigMembers::default()),
		}
	}
}

impl GlobalConfig {
	/// Load configuration. An explicit path must exist; otherwise the
	/// conventional locations are probed and missing files simply mean
	/// defaults.
	pub fn new(file_path: Option<&str>) -> Result<GlobalConfig, ConfigError> {
		let mut config = GlobalConfig::default();
		if let Some(fp) = file_path {
			let path = PathBuf::from(fp);
			if !path.exists() {
				return Err(ConfigError::FileNotFoundError(fp.to_string()));
			}
			config.config_file_path = Some(path);
		} else {
			config.config_file_path = default_locations().into_iter().find(|p| p.exists());
		}
		match config.config_file_path {
			Some(_) => config.read(),
			None => Ok(config),
		}
	}

	/// Read and parse the config file at the recorded location.
	fn read(mut self) -> Result<GlobalConfig, ConfigError> {
		let path = self
			.config_file_path
			.clone()
			.expect("read requires a located config file");
		let file_name = path.to_string_lossy().into_owned();
		let mut file = File::open(&path)
			.map_err(|e| ConfigError::FileIOError(file_name.clone(), e.to_string()))?;
		let mut contents = String::new();
		file.read_to_string(&mut contents)
			.map_err(|e| ConfigError::FileIOError(file_name.clone(), e.to_string()))?;
		let members: ConfigMembers = toml::from_str(&contents)
			.map_err(|e| ConfigError::ParseError(file_name, e.to_string()))?;
		self.using_config_file = true;
		self.members = Some(members);
		Ok(self)
	}

	/// Serialize the in-memory configuration as TOML.
	pub fn ser_config(&self) -> Result<String, ConfigError> {
		toml::to_string(self.members.as_ref().expect("members are always set"))
			.map_err(|e| ConfigError::SerializationError(e.to_string()))
	}

	/// Write the current configuration out, typically to seed a default
	/// file on first run.
	pub fn write_to_file(&self, name: &str) -> Result<(), ConfigError> {
		let conf_out = self.ser_config()?;
		let mut file =
			File::create(name).map_err(|e| ConfigError::FileIOError(name.to_string(), e.to_string()))?;
		file.write_all(conf_out.as_bytes())
			.map_err(|e| ConfigError::FileIOError(name.to_string(), e.to_string()))?;
		Ok(())
	}

	/// Server section, owned.
	pub fn server_config(&self) -> ServerConfig {
		self.members
			.as_ref()
			.expect("members are always set")
			.server
			.clone()
	}

	/// Logging section, owned.
	pub fn logging_config(&self) -> Option<LoggingConfig> {
		self.members
			.as_ref()
			.expect("members are always set")
			.logging
			.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn parse_config_sections() {
		let toml_str = r#"
			[server.upstream]
			name = "qkc-shard0"
			url = "http://10.0.0.5:38391"
			timeout_secs = 3

			[server.stratum]
			listen = "0.0.0.0:8008"
			timeout_secs = 90

			[server.proxy]
			block_refresh_ms = 250
			difficulty = 5000000
			shard_id = "0x3"
			fee = 100

			[server.policy.banning]
			invalid_percent = 25.0

			[logging]
			log_to_stdout = true
			stdout_log_level = "Info"
			log_to_file = false
			file_log_level = "Debug"
			log_file_path = "qpool.log"
			log_file_append = true
		"#;

		let members: ConfigMembers = toml::from_str(toml_str).unwrap();
		assert_eq!(members.server.upstream.name, "qkc-shard0");
		assert_eq!(members.server.upstream.timeout_secs, 3);
		assert_eq!(members.server.stratum.timeout_secs, 90);
		assert_eq!(members.server.proxy.block_refresh_ms, 250);
		assert_eq!(members.server.proxy.shard_id, "0x3");
		assert_eq!(members.server.proxy.fee, 100);
		assert_eq!(members.server.policy.banning.invalid_percent, 25.0);
		// Sections not present fall back to defaults.
		assert_eq!(members.server.policy.limits.login_attempts, 5);
		assert!(members.server.proxy.byte_code.is_empty());
	}

	#[test]
	fn defaults_round_trip_through_toml() {
		let config = GlobalConfig::default();
		let serialized = config.ser_config().unwrap();
		let reparsed: ConfigMembers = toml::from_str(&serialized).unwrap();
		assert_eq!(
			reparsed.server.stratum.listen,
			config.server_config().stratum.listen
		);
		assert_eq!(
			reparsed.server.proxy.difficulty,
			config.server_config().proxy.difficulty
		);
	}
}
