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

//! Main for building the binary of the qpool stratum proxy.

#[macro_use]
extern crate log;

use std::process::exit;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};

use qpool_config::{config_file_exists, GlobalConfig, CONFIG_FILE_NAME};
use qpool_servers::mining::pow::EthashMixVerifier;
use qpool_servers::rpc::HttpNodeClient;
use qpool_servers::storage::MemShareLog;
use qpool_servers::ProxyServer;
use qpool_util::init_logger;

fn main() {
	let args = App::new("qpool")
		.version("0.2.0")
		.author("The qpool Developers")
		.about("Stratum mining-pool proxy for QuarkChain and other Ethash-family networks")
		.arg(
			Arg::with_name("config")
				.short("c")
				.long("config")
				.value_name("FILE")
				.help("Path to the configuration file")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("gen_config")
				.long("gen-config")
				.help("Write a default configuration file to the current directory and exit"),
		)
		.get_matches();

	if args.is_present("gen_config") {
		if config_file_exists() {
			eprintln!("A {} already exists, refusing to overwrite it", CONFIG_FILE_NAME);
			exit(1);
		}
		let config = GlobalConfig::default();
		if let Err(e) = config.write_to_file(CONFIG_FILE_NAME) {
			eprintln!("Failed to write {}: {}", CONFIG_FILE_NAME, e);
			exit(1);
		}
		println!("Default configuration written to {}", CONFIG_FILE_NAME);
		return;
	}

	let global_config = match GlobalConfig::new(args.value_of("config")) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Failed to load configuration: {}", e);
			exit(1);
		}
	};

	init_logger(global_config.logging_config());
	if global_config.using_config_file {
		info!(
			"Using configuration file at {:?}",
			global_config.config_file_path
		);
	} else {
		info!("No configuration file found, using defaults");
	}

	let server_config = global_config.server_config();
	if !server_config.stratum.enabled {
		eprintln!("The stratum listener is disabled in the configuration, nothing to run");
		exit(1);
	}

	let upstream = &server_config.upstream;
	let rpc = match HttpNodeClient::new(
		&upstream.name,
		&upstream.url,
		Duration::from_secs(upstream.timeout_secs),
		upstream.max_fails,
	) {
		Ok(client) => client,
		Err(e) => {
			eprintln!("Failed to set up the upstream client: {}", e);
			exit(1);
		}
	};

	let server = Arc::new(ProxyServer::new(
		server_config,
		Arc::new(rpc),
		Arc::new(MemShareLog::new()),
		Arc::new(EthashMixVerifier::new()),
	));

	if let Err(e) = server.start() {
		error!("Failed to start the stratum server: {}", e);
		eprintln!("Failed to start the stratum server: {}", e);
		exit(1);
	}

	// Park the main thread until interrupted.
	let (tx, rx) = mpsc::channel();
	if let Err(e) = ctrlc::set_handler(move || {
		let _ = tx.send(());
	}) {
		error!("Failed to install the shutdown handler: {}", e);
		exit(1);
	}
	let _ = rx.recv();
	warn!("Shutting down");
}
