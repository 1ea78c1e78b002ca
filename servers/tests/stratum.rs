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

//! Start a proxy against a scripted upstream node, speak stratum to it
//! over real TCP and verify the protocol behavior end to end.

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::io::prelude::{BufRead, Write};
use std::net::TcpStream;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{thread, time};

use bufstream::BufStream;
use primitive_types::U256;
use serde_json::{json, Value};

use qpool_servers::common::types::ServerConfig;
use qpool_servers::mining::pow::{self, PowVerifier};
use qpool_servers::rpc::{GetWorkReply, NodeClient};
use qpool_servers::storage::{MemShareLog, ShareLog};
use qpool_servers::{Error, ProxyServer};
use qpool_util as util;
use qpool_util::Mutex;

const LOGIN: &str = "0xabababababababababababababababababababab";
const HEADER: &str =
	"0x1111111111111111111111111111111111111111111111111111111111111111";
const MIX: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

// ----------------------------------------
// Scripted collaborators

struct MockNode {
	work: Mutex<GetWorkReply>,
	submitted: Mutex<Vec<(String, String, String, String)>>,
	sick: AtomicBool,
}

impl MockNode {
	fn new(reply: GetWorkReply) -> MockNode {
		MockNode {
			work: Mutex::new(reply),
			submitted: Mutex::new(vec![]),
			sick: AtomicBool::new(false),
		}
	}

	fn submissions(&self) -> Vec<(String, String, String, String)> {
		self.submitted.lock().clone()
	}
}

impl NodeClient for MockNode {
	fn get_work(&self, _shard_id: &str, _login: &str) -> Result<GetWorkReply, Error> {
		Ok(self.work.lock().clone())
	}

	fn get_pending_block(&self, _shard_id: &str) -> Result<Value, Error> {
		Ok(json!({"number": "0x64", "difficulty": "0x3e8"}))
	}

	fn get_code(&self, _contract_id: &str) -> Result<String, Error> {
		Ok("0x".to_string())
	}

	fn get_storage_at(&self, _contract_id: &str, _slot: u64) -> Result<String, Error> {
		Ok("0x0".to_string())
	}

	fn submit_work(
		&self,
		shard_id: &str,
		nonce: &str,
		header: &str,
		mix_digest: &str,
	) -> Result<bool, Error> {
		self.submitted.lock().push((
			shard_id.to_string(),
			nonce.to_string(),
			header.to_string(),
			mix_digest.to_string(),
		));
		Ok(true)
	}

	fn is_sick(&self) -> bool {
		self.sick.load(Ordering::Relaxed)
	}

	fn name(&self) -> &str {
		"mock"
	}
}

// Verifier scripted by nonce: each known nonce achieves a fixed
// difficulty, unknown nonces fail verification outright.
struct ScriptedVerifier {
	achieved: HashMap<u64, u64>,
}

impl PowVerifier for ScriptedVerifier {
	fn verify(
		&self,
		_header: &[u8; 32],
		nonce: u64,
		_mix_digest: &[u8; 32],
		_seed: &[u8; 32],
		target: U256,
	) -> Option<U256> {
		let achieved = U256::from(*self.achieved.get(&nonce)?);
		if achieved >= pow::diff_from_target(target) {
			Some(achieved)
		} else {
			None
		}
	}
}

// ----------------------------------------
// Wire helpers

fn test_config(port: u16) -> ServerConfig {
	let mut config = ServerConfig::default();
	config.stratum.listen = format!("127.0.0.1:{}", port);
	config.stratum.timeout_secs = 30;
	config.proxy.block_refresh_ms = 100;
	config.proxy.state_update_secs = 1;
	config.proxy.difficulty = 1000;
	config.proxy.shard_id = "0x0".to_string();
	config
}

fn start_proxy(
	port: u16,
	node: Arc<MockNode>,
	verifier: ScriptedVerifier,
) -> (Arc<ProxyServer>, Arc<MemShareLog>) {
	let log = Arc::new(MemShareLog::new());
	let share_log: Arc<dyn ShareLog> = log.clone();
	let server = Arc::new(ProxyServer::new(
		test_config(port),
		node,
		share_log,
		Arc::new(verifier),
	));
	server.start().unwrap();
	(server, log)
}

fn connect(port: u16) -> BufStream<TcpStream> {
	// Wait for the listener to come up, the way a miner retries.
	for _ in 0..50 {
		if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
			return BufStream::new(stream);
		}
		thread::sleep(time::Duration::from_millis(100));
	}
	panic!("stratum listener did not come up on port {}", port);
}

fn send(stream: &mut BufStream<TcpStream>, line: &str) {
	stream.write(line.as_bytes()).unwrap();
	stream.write(b"\n").unwrap();
	stream.flush().unwrap();
}

// Read the next response, skipping pushed job notifications (id 0).
fn read_response(stream: &mut BufStream<TcpStream>) -> Value {
	loop {
		let mut line = String::new();
		stream.read_line(&mut line).unwrap();
		assert!(!line.is_empty(), "connection closed while expecting a response");
		let value: Value = serde_json::from_str(&line).unwrap();
		if value["id"] != json!(0) {
			return value;
		}
	}
}

fn login(stream: &mut BufStream<TcpStream>, id: u64, worker: &str) {
	send(
		stream,
		&format!(
			"{{\"id\":{},\"method\":\"eth_submitLogin\",\"params\":[\"{}\"],\"worker\":\"{}\"}}",
			id, LOGIN, worker
		),
	);
	let resp = read_response(stream);
	assert_eq!(resp["id"], json!(id));
	assert_eq!(resp["result"], json!(true));
	assert_eq!(resp["error"], Value::Null);
}

fn submit(
	stream: &mut BufStream<TcpStream>,
	id: u64,
	nonce: &str,
	header: &str,
	worker: &str,
) -> Value {
	send(
		stream,
		&format!(
			"{{\"id\":{},\"method\":\"eth_submitWork\",\"params\":[\"{}\",\"{}\",\"{}\"],\"worker\":\"{}\"}}",
			id, nonce, header, MIX, worker
		),
	);
	read_response(stream)
}

// Poll getWork until the login's template has been fetched.
fn wait_for_work(stream: &mut BufStream<TcpStream>) -> Value {
	for attempt in 0..50 {
		send(
			stream,
			&format!(
				"{{\"id\":{},\"method\":\"eth_getWork\",\"params\":[]}}",
				900 + attempt
			),
		);
		let resp = read_response(stream);
		if resp["error"] == Value::Null {
			return resp["result"].clone();
		}
		thread::sleep(time::Duration::from_millis(100));
	}
	panic!("work never became ready");
}

fn watchdog(secs: u64) {
	let _ = thread::spawn(move || {
		thread::sleep(time::Duration::from_secs(secs));
		error!("stratum test failed on timeout!");
		thread::sleep(time::Duration::from_millis(100));
		process::exit(1);
	});
}

// ----------------------------------------
// Scenarios

// Login then getWork round-trips, unknown methods and unauthenticated
// calls are answered with their protocol errors.
#[test]
fn login_and_getwork() {
	util::init_test_logger();
	watchdog(60);

	let node = Arc::new(MockNode::new(GetWorkReply {
		header: HEADER.to_string(),
		height_hex: "0x64".to_string(),
		diff_hex: "0x3e8".to_string(),
		network_diff_hex: None,
	}));
	let (_server, log) = start_proxy(21801, node, ScriptedVerifier {
		achieved: HashMap::new(),
	});

	// getWork before login is refused.
	let mut w = connect(21801);
	send(&mut w, "{\"id\":7,\"method\":\"eth_getWork\",\"params\":[]}");
	let resp = read_response(&mut w);
	assert_eq!(resp["id"], json!(7));
	assert_eq!(resp["error"]["code"], json!(25));
	assert_eq!(resp["error"]["message"], json!("Not subscribed"));

	login(&mut w, 1, "rig1");
	info!("login ok");

	// The login warms the template cell; poll getWork until it lands.
	let mut work = None;
	for attempt in 0..50 {
		send(
			&mut w,
			&format!("{{\"id\":{},\"method\":\"eth_getWork\",\"params\":[]}}", 100 + attempt),
		);
		let resp = read_response(&mut w);
		if resp["error"] == Value::Null {
			work = Some(resp["result"].clone());
			break;
		}
		assert_eq!(resp["error"]["code"], json!(0));
		assert_eq!(resp["error"]["message"], json!("Work not ready"));
		thread::sleep(time::Duration::from_millis(100));
	}
	let work = work.expect("work never became ready");
	assert_eq!(work[0], json!(HEADER));
	// Height 100 is epoch zero, so the seed is all zeroes.
	assert_eq!(work[1], json!(format!("0x{}", "0".repeat(64))));
	assert_eq!(work[2], json!(pow::target_hex(U256::from(1000))));
	info!("getWork ok");

	// Unknown method.
	send(&mut w, "{\"id\":3,\"method\":\"mining.subscribe\",\"params\":[]}");
	let resp = read_response(&mut w);
	assert_eq!(resp["id"], json!(3));
	assert_eq!(resp["result"], Value::Null);
	assert_eq!(resp["error"]["code"], json!(-3));
	assert_eq!(resp["error"]["message"], json!("Method not found"));
	info!("unknown method ok");

	// Hashrate reports are accepted.
	send(
		&mut w,
		"{\"id\":4,\"method\":\"eth_submitHashrate\",\"params\":[\"0x500000\",\"0xid\"],\"worker\":\"rig1\"}",
	);
	let resp = read_response(&mut w);
	assert_eq!(resp["result"], json!(true));
	let (rate, _ts) = log.hashrate(LOGIN, "rig1").expect("hashrate sample recorded");
	assert_eq!(rate, 0x500000);
	info!("submitHashrate ok");
}

// The full share pipeline: plain shares, duplicates across sessions,
// stale headers, invalid proofs and a candidate block reaching the
// upstream node exactly once.
#[test]
fn share_pipeline() {
	util::init_test_logger();
	watchdog(60);

	// Guardian-style work: share difficulty 10_000_000 / 10000 = 1000,
	// network difficulty 2_000_000.
	let node = Arc::new(MockNode::new(GetWorkReply {
		header: HEADER.to_string(),
		height_hex: "0x64".to_string(),
		diff_hex: "0x989680".to_string(),
		network_diff_hex: Some("0x1e8480".to_string()),
	}));
	let mut achieved = HashMap::new();
	achieved.insert(1u64, 5_000u64); // meets share difficulty only
	achieved.insert(2u64, 3_000_000u64); // meets network difficulty
	let (_server, log) = start_proxy(21802, node.clone(), ScriptedVerifier { achieved });

	let mut w1 = connect(21802);
	login(&mut w1, 1, "rig1");
	let mut w2 = connect(21802);
	login(&mut w2, 1, "rig2");

	// The login-triggered refresh needs to land before submitting.
	let work = wait_for_work(&mut w1);
	assert_eq!(work[0], json!(HEADER));

	let nonce_share = "0x0000000000000001";
	let nonce_block = "0x0000000000000002";
	let nonce_bad = "0x0000000000000003";

	// Accepted share.
	let resp = submit(&mut w1, 10, nonce_share, HEADER, "rig1");
	assert_eq!(resp["result"], json!(true));
	assert_eq!(resp["error"], Value::Null);
	let shares = log.shares();
	assert_eq!(shares.len(), 1);
	assert_eq!(shares[0].login, LOGIN);
	assert_eq!(shares[0].worker, "rig1");
	assert_eq!(shares[0].height, 100);
	assert_eq!(shares[0].difficulty, U256::from(1000));
	info!("accepted share ok");

	// The same solution from another session is a duplicate.
	let resp = submit(&mut w2, 11, nonce_share, HEADER, "rig2");
	assert_eq!(resp["result"], Value::Null);
	assert_eq!(resp["error"]["code"], json!(22));
	assert_eq!(resp["error"]["message"], json!("Duplicate share"));
	assert_eq!(log.shares().len(), 1);
	info!("duplicate share ok");

	// A header outside every backlog is a stale share: soft drop, no
	// records, no protocol error.
	let unknown_header = format!("0x{}", "33".repeat(32));
	let resp = submit(&mut w1, 12, "0x0000000000000004", &unknown_header, "rig1");
	assert_eq!(resp["result"], json!(false));
	assert_eq!(resp["error"], Value::Null);
	assert_eq!(log.shares().len(), 1);
	info!("stale share ok");

	// A failed proof is also a soft drop.
	let resp = submit(&mut w1, 13, nonce_bad, HEADER, "rig1");
	assert_eq!(resp["result"], json!(false));
	assert_eq!(resp["error"], Value::Null);
	info!("invalid share ok");

	// Candidate block: recorded and submitted upstream exactly once.
	let resp = submit(&mut w2, 14, nonce_block, HEADER, "rig2");
	assert_eq!(resp["result"], json!(true));
	let candidates = log.candidates();
	assert_eq!(candidates.len(), 1);
	assert_eq!(candidates[0].nonce, nonce_block);
	assert_eq!(candidates[0].mix_digest, MIX);
	assert_eq!(candidates[0].share.worker, "rig2");
	let submissions = node.submissions();
	assert_eq!(submissions.len(), 1);
	assert_eq!(submissions[0].1, nonce_block);
	assert_eq!(submissions[0].2, HEADER);
	info!("candidate block ok");

	// Malformed submissions are protocol errors, not shares.
	send(
		&mut w1,
		"{\"id\":15,\"method\":\"eth_submitWork\",\"params\":[\"0x01\",\"0x02\"],\"worker\":\"rig1\"}",
	);
	let resp = read_response(&mut w1);
	assert_eq!(resp["error"]["code"], json!(-1));
	assert_eq!(resp["error"]["message"], json!("Invalid params"));

	send(
		&mut w1,
		&format!(
			"{{\"id\":16,\"method\":\"eth_submitWork\",\"params\":[\"0xNOPE\",\"{}\",\"{}\"],\"worker\":\"rig1\"}}",
			HEADER, MIX
		),
	);
	let resp = read_response(&mut w1);
	assert_eq!(resp["error"]["code"], json!(-1));
	assert_eq!(resp["error"]["message"], json!("Malformed PoW result"));
	info!("malformed submissions ok");

	// The miner was registered on first login.
	assert_eq!(log.miners(), vec![LOGIN.to_string()]);
}

// A sick upstream withholds work but the session stays up.
#[test]
fn sick_upstream_withholds_work() {
	util::init_test_logger();
	watchdog(60);

	let node = Arc::new(MockNode::new(GetWorkReply {
		header: HEADER.to_string(),
		height_hex: "0x64".to_string(),
		diff_hex: "0x3e8".to_string(),
		network_diff_hex: None,
	}));
	let (_server, _log) = start_proxy(21803, node.clone(), ScriptedVerifier {
		achieved: HashMap::new(),
	});

	let mut w = connect(21803);
	login(&mut w, 1, "rig1");
	thread::sleep(time::Duration::from_millis(500));

	node.sick.store(true, Ordering::Relaxed);
	send(&mut w, "{\"id\":2,\"method\":\"eth_getWork\",\"params\":[]}");
	let resp = read_response(&mut w);
	assert_eq!(resp["error"]["code"], json!(0));
	assert_eq!(resp["error"]["message"], json!("Work not ready"));

	// Recovery brings work back on the same connection.
	node.sick.store(false, Ordering::Relaxed);
	send(&mut w, "{\"id\":3,\"method\":\"eth_getWork\",\"params\":[]}");
	let resp = read_response(&mut w);
	assert_eq!(resp["error"], Value::Null);
	assert_eq!(resp["result"][0], json!(HEADER));
}
