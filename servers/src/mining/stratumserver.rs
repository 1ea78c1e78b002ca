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

//! Stratum proxy server. One reader thread per TCP connection decodes
//! newline-delimited JSON-RPC and dispatches; a refresh loop keeps a
//! per-miner template in the registry and pushes job notifications.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};

use crate::common::stats::{ProxyStats, SessionStats};
use crate::common::types::{Error, ServerConfig};
use crate::mining::blocks::TemplateRegistry;
use crate::mining::policy::PolicyServer;
use crate::mining::pow::PowVerifier;
use crate::mining::shares;
use crate::rpc::NodeClient;
use crate::storage::ShareLog;
use crate::util::{Mutex, RwLock};

// Longest request line we accept before treating the peer as abusive.
const MAX_REQ_SIZE: usize = 1024;

lazy_static! {
	static ref ADDRESS_PATTERN: Regex = Regex::new(r"^0x[0-9a-f]{40}$").unwrap();
	static ref ZERO_PATTERN: Regex = Regex::new(r"^0?x?0+$").unwrap();
}

/// Whether the string is a usable miner address: lowercase `0x` hex,
/// 20 bytes, not all zero.
pub fn is_valid_hex_address(s: &str) -> bool {
	!ZERO_PATTERN.is_match(s) && ADDRESS_PATTERN.is_match(s)
}

/// JSON error member of a stratum response.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorReply {
	/// Numeric code, see the protocol table.
	pub code: i64,
	/// Human-readable reason.
	pub message: String,
}

impl ErrorReply {
	/// Shorthand constructor.
	pub fn new(code: i64, message: &str) -> ErrorReply {
		ErrorReply {
			code,
			message: message.to_string(),
		}
	}
}

#[derive(Deserialize, Debug)]
struct StratumRequest {
	#[serde(default)]
	id: Value,
	method: String,
	#[serde(default)]
	params: Value,
	#[serde(default)]
	worker: String,
}

#[derive(Serialize, Debug)]
struct StratumResponse {
	id: Value,
	result: Value,
	error: Value,
}

impl StratumResponse {
	fn ok(id: Value, result: Value) -> StratumResponse {
		StratumResponse {
			id,
			result,
			error: Value::Null,
		}
	}

	fn err(id: Value, error: &ErrorReply) -> StratumResponse {
		StratumResponse {
			id,
			result: Value::Null,
			error: serde_json::to_value(error).expect("error reply serializes"),
		}
	}
}

/// Authentication state of a session. Work distribution and share
/// submission require the `Authenticated` arm, so a submit without a
/// prior login cannot reach the pipeline.
#[derive(Debug, Clone)]
pub enum AuthState {
	/// Connected, no accepted login yet.
	Unauthenticated,
	/// Logged in as the contained miner address.
	Authenticated {
		/// Miner address the session authenticated as.
		login: String,
	},
}

/// One stratum TCP connection.
pub struct Session {
	/// Session id, unique per proxy lifetime.
	pub id: u64,
	/// Remote IP, without port.
	pub ip: String,
	writer: Mutex<TcpStream>,
	auth: RwLock<AuthState>,
	last_target: RwLock<String>,
	last_seen: RwLock<chrono::DateTime<Utc>>,
	closed: AtomicBool,
	pub(crate) num_accepted: AtomicU64,
	pub(crate) num_invalid: AtomicU64,
	pub(crate) num_stale: AtomicU64,
}

impl Session {
	fn new(id: u64, ip: String, writer: TcpStream, initial_target: String) -> Session {
		Session {
			id,
			ip,
			writer: Mutex::new(writer),
			auth: RwLock::new(AuthState::Unauthenticated),
			last_target: RwLock::new(initial_target),
			last_seen: RwLock::new(Utc::now()),
			closed: AtomicBool::new(false),
			num_accepted: AtomicU64::new(0),
			num_invalid: AtomicU64::new(0),
			num_stale: AtomicU64::new(0),
		}
	}

	/// Login this session authenticated as, if any.
	pub fn login(&self) -> Option<String> {
		match *self.auth.read() {
			AuthState::Unauthenticated => None,
			AuthState::Authenticated { ref login } => Some(login.clone()),
		}
	}

	fn authenticate(&self, login: String) {
		*self.auth.write() = AuthState::Authenticated { login };
	}

	fn set_last_target(&self, target: &str) {
		*self.last_target.write() = target.to_string();
	}

	/// Write one JSON line to the peer. The mutex serializes responses
	/// and pushed notifications so they never interleave on the wire.
	fn write_line(&self, line: &str) -> bool {
		let res = {
			let mut writer = self.writer.lock();
			writer
				.write_all(line.as_bytes())
				.and_then(|_| writer.write_all(b"\n"))
				.and_then(|_| writer.flush())
		};
		if let Err(e) = res {
			debug!("Session {}: write failed: {}", self.id, e);
			self.close();
			return false;
		}
		true
	}

	fn send(&self, resp: &StratumResponse) -> bool {
		match serde_json::to_string(resp) {
			Ok(line) => self.write_line(&line),
			Err(e) => {
				error!("Session {}: response did not serialize: {}", self.id, e);
				false
			}
		}
	}

	fn close(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			let _ = self.writer.lock().shutdown(Shutdown::Both);
		}
	}

	fn stats(&self) -> SessionStats {
		SessionStats {
			id: self.id,
			ip: self.ip.clone(),
			login: self.login(),
			last_target: self.last_target.read().clone(),
			num_accepted: self.num_accepted.load(Ordering::Relaxed),
			num_invalid: self.num_invalid.load(Ordering::Relaxed),
			num_stale: self.num_stale.load(Ordering::Relaxed),
			last_seen: *self.last_seen.read(),
		}
	}
}

/// The stratum proxy: session set, per-miner template registry, policy
/// engine and the seams to the upstream node, PoW verifier and
/// accounting store.
pub struct ProxyServer {
	pub(crate) config: ServerConfig,
	pub(crate) rpc: Arc<dyn NodeClient>,
	pub(crate) storage: Arc<dyn ShareLog>,
	pub(crate) verifier: Arc<dyn PowVerifier>,
	pub(crate) policy: PolicyServer,
	pub(crate) registry: TemplateRegistry,
	sessions: RwLock<HashMap<u64, Arc<Session>>>,
	next_session_id: AtomicU64,
	stats: RwLock<ProxyStats>,
	pub(crate) accepted_total: AtomicU64,
	pub(crate) invalid_total: AtomicU64,
	pub(crate) candidate_total: AtomicU64,
}

impl ProxyServer {
	/// Assemble a proxy from its collaborators.
	pub fn new(
		config: ServerConfig,
		rpc: Arc<dyn NodeClient>,
		storage: Arc<dyn ShareLog>,
		verifier: Arc<dyn PowVerifier>,
	) -> ProxyServer {
		let policy = PolicyServer::new(config.policy.clone());
		ProxyServer {
			config,
			rpc,
			storage,
			verifier,
			policy,
			registry: TemplateRegistry::new(),
			sessions: RwLock::new(HashMap::new()),
			next_session_id: AtomicU64::new(0),
			stats: RwLock::new(ProxyStats::default()),
			accepted_total: AtomicU64::new(0),
			invalid_total: AtomicU64::new(0),
			candidate_total: AtomicU64::new(0),
		}
	}

	/// Bind the stratum listener and start the accept, refresh and stats
	/// threads. Fails fast when the listen address is unusable.
	pub fn start(self: &Arc<Self>) -> Result<(), Error> {
		if self.config.proxy.difficulty == 0 {
			return Err(Error::Config(
				"proxy.difficulty must be positive".to_string(),
			));
		}
		let listener = TcpListener::bind(&self.config.stratum.listen)?;
		warn!("Stratum server started on {}", self.config.stratum.listen);
		{
			let mut stats = self.stats.write();
			stats.is_running = true;
		}

		let server = self.clone();
		let _ = thread::Builder::new()
			.name("stratum-accept".to_string())
			.spawn(move || server.accept_loop(listener))?;

		let server = self.clone();
		let refresh = Duration::from_millis(self.config.proxy.block_refresh_ms);
		let _ = thread::Builder::new()
			.name("template-refresh".to_string())
			.spawn(move || loop {
				server.refresh_templates();
				thread::sleep(refresh);
			})?;

		let server = self.clone();
		let update = Duration::from_secs(self.config.proxy.state_update_secs);
		let _ = thread::Builder::new()
			.name("state-update".to_string())
			.spawn(move || loop {
				server.update_stats();
				thread::sleep(update);
			})?;

		Ok(())
	}

	/// Snapshot of the proxy state, rebuilt on the state update
	/// interval.
	pub fn stats(&self) -> ProxyStats {
		self.stats.read().clone()
	}

	// ----------------------------------------
	// Session lifecycle

	fn accept_loop(self: Arc<Self>, listener: TcpListener) {
		let timeout = Duration::from_secs(self.config.stratum.timeout_secs);
		for stream in listener.incoming() {
			match stream {
				Ok(stream) => {
					let ip = match stream.peer_addr() {
						Ok(addr) => addr.ip().to_string(),
						Err(e) => {
							warn!("Error reading peer address: {}", e);
							continue;
						}
					};
					if let Err(e) = stream.set_read_timeout(Some(timeout)) {
						warn!("Error configuring connection from {}: {}", ip, e);
						continue;
					}
					let writer = match stream.try_clone() {
						Ok(w) => w,
						Err(e) => {
							warn!("Error cloning connection from {}: {}", ip, e);
							continue;
						}
					};
					let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
					let session = Arc::new(Session::new(
						id,
						ip,
						writer,
						crate::mining::pow::target_hex(self.config.proxy.difficulty.into()),
					));
					debug!("New connection {} from {}", session.id, session.ip);
					self.sessions.write().insert(id, session.clone());
					let server = self.clone();
					let _ = thread::Builder::new()
						.name(format!("stratum-session-{}", id))
						.spawn(move || server.handle_session(session, stream));
				}
				Err(e) => {
					warn!("Error accepting connection: {}", e);
				}
			}
		}
	}

	fn handle_session(self: Arc<Self>, session: Arc<Session>, stream: TcpStream) {
		let mut reader = BufReader::new(stream);
		let mut line = String::new();
		loop {
			line.clear();
			match reader.read_line(&mut line) {
				Ok(0) => {
					debug!("Session {}: peer closed connection", session.id);
					break;
				}
				Ok(n) if n > MAX_REQ_SIZE => {
					warn!("Session {}: oversized request from {}", session.id, session.ip);
					self.policy.apply_malformed_policy(&session.ip);
					break;
				}
				Ok(_) => {
					let trimmed = line.trim();
					if trimmed.is_empty() {
						continue;
					}
					let request: StratumRequest = match serde_json::from_str(trimmed) {
						Ok(request) => request,
						Err(e) => {
							warn!(
								"Session {}: malformed request from {}: {}",
								session.id, session.ip, e
							);
							self.policy.apply_malformed_policy(&session.ip);
							break;
						}
					};
					if !self.dispatch(&session, request) {
						break;
					}
				}
				Err(ref e)
					if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
				{
					info!(
						"Session {}: idle for {}s, disconnecting {}",
						session.id, self.config.stratum.timeout_secs, session.ip
					);
					break;
				}
				Err(e) => {
					debug!("Session {}: read failed: {}", session.id, e);
					break;
				}
			}
		}
		session.close();
		self.sessions.write().remove(&session.id);
		debug!("Session {} from {} removed", session.id, session.ip);
	}

	// Dispatch one decoded request. Returns false when the connection
	// should be closed.
	fn dispatch(self: &Arc<Self>, session: &Arc<Session>, request: StratumRequest) -> bool {
		*session.last_seen.write() = Utc::now();
		let StratumRequest {
			id,
			method,
			params,
			worker,
		} = request;
		match method.as_str() {
			"eth_submitLogin" => {
				let reply = self.handle_login(session, params);
				match reply {
					Ok(result) => session.send(&StratumResponse::ok(id, result)),
					Err(e) => session.send(&StratumResponse::err(id, &e)),
				}
			}
			"eth_getWork" => match session.login() {
				None => session.send(&StratumResponse::err(
					id,
					&ErrorReply::new(25, "Not subscribed"),
				)),
				Some(login) => match self.handle_get_work(session, &login) {
					Ok(result) => session.send(&StratumResponse::ok(id, result)),
					Err(e) => session.send(&StratumResponse::err(id, &e)),
				},
			},
			"eth_submitWork" => match session.login() {
				None => session.send(&StratumResponse::err(
					id,
					&ErrorReply::new(25, "Not subscribed"),
				)),
				Some(login) => {
					let params: Vec<String> =
						serde_json::from_value(params).unwrap_or_default();
					match shares::handle_submit(self, session, &login, &worker, params) {
						Ok(result) => session.send(&StratumResponse::ok(id, result)),
						Err(verdict) => {
							let sent =
								session.send(&StratumResponse::err(id, &verdict.reply));
							if verdict.close {
								info!(
									"Session {}: closing {} on policy verdict",
									session.id, session.ip
								);
								return false;
							}
							sent
						}
					}
				}
			},
			"eth_submitHashrate" => match session.login() {
				None => session.send(&StratumResponse::err(
					id,
					&ErrorReply::new(25, "Not subscribed"),
				)),
				Some(login) => {
					let result = self.handle_submit_hashrate(&login, &worker, params);
					session.send(&StratumResponse::ok(id, result))
				}
			},
			_ => {
				debug!(
					"Session {}: unknown method {} from {}",
					session.id, method, session.ip
				);
				self.policy.apply_malformed_policy(&session.ip);
				session.send(&StratumResponse::err(
					id,
					&ErrorReply::new(-3, "Method not found"),
				))
			}
		}
	}

	// ----------------------------------------
	// Method handlers

	fn handle_login(
		self: &Arc<Self>,
		session: &Arc<Session>,
		params: Value,
	) -> Result<Value, ErrorReply> {
		let params: Vec<String> = serde_json::from_value(params).unwrap_or_default();
		let login = match params.first() {
			Some(l) => l.to_lowercase(),
			None => return Err(ErrorReply::new(-1, "Invalid params")),
		};
		if !is_valid_hex_address(&login) {
			self.policy.note_failed_login(&session.ip);
			return Err(ErrorReply::new(-1, "Invalid login"));
		}
		if !self.policy.apply_login_policy(&login, &session.ip) {
			return Err(ErrorReply::new(-1, "You are blacklisted"));
		}
		self.check_miner_contract(&login, &session.ip)?;

		match self.storage.is_miner_registered(&login) {
			Ok(false) => {
				if let Err(e) = self.storage.register_miner(&login) {
					error!("Failed to register miner {}: {}", login, e);
				}
			}
			Ok(true) => {}
			Err(e) => error!("Miner lookup failed for {}: {}", login, e),
		}

		session.authenticate(login.clone());
		info!("Stratum miner connected {}@{}", login, session.ip);

		// Warm the template cell so the first getWork doesn't have to
		// wait out a refresh tick.
		let server = self.clone();
		let _ = thread::Builder::new()
			.name("login-refresh".to_string())
			.spawn(move || {
				if server.refresh_login(&login) {
					server.broadcast_new_jobs();
				}
			});

		Ok(json!(true))
	}

	// On-chain admission gates, each enabled by the corresponding
	// configuration value being set.
	fn check_miner_contract(&self, login: &str, ip: &str) -> Result<(), ErrorReply> {
		let proxy = &self.config.proxy;
		if proxy.byte_code.is_empty() && proxy.admin.is_empty() && proxy.fee == 0 {
			return Ok(());
		}
		let contract_id = format!("{}000{}", login, proxy.shard_id.trim_start_matches("0x"));

		if !proxy.byte_code.is_empty() {
			let code = self.rpc.get_code(&contract_id).unwrap_or_else(|e| {
				warn!("getCode failed for {}: {}", contract_id, e);
				String::new()
			});
			if code != proxy.byte_code {
				self.policy.note_failed_login(ip);
				return Err(ErrorReply::new(-1, "Invalid smart contract bytecode"));
			}
		}
		if !proxy.admin.is_empty() {
			let admin = self.rpc.get_storage_at(&contract_id, 8).unwrap_or_else(|e| {
				warn!("getStorageAt(8) failed for {}: {}", contract_id, e);
				String::new()
			});
			if admin != proxy.admin {
				self.policy.note_failed_login(ip);
				return Err(ErrorReply::new(-1, "Invalid smart contract pool maintainer"));
			}
		}
		if proxy.fee != 0 {
			let fee = self
				.rpc
				.get_storage_at(&contract_id, 9)
				.ok()
				.and_then(|word| crate::util::hex_to_u64(&word).ok())
				.unwrap_or(0);
			if fee < proxy.fee {
				self.policy.note_failed_login(ip);
				return Err(ErrorReply::new(-1, "Invalid smart contract pool fee"));
			}
		}
		Ok(())
	}

	fn handle_get_work(&self, session: &Arc<Session>, login: &str) -> Result<Value, ErrorReply> {
		let template = self.registry.current(login);
		match template {
			Some(ref t) if !self.rpc.is_sick() => {
				session.set_last_target(&t.target);
				Ok(json!([t.header, t.seed, t.target]))
			}
			_ => Err(ErrorReply::new(0, "Work not ready")),
		}
	}

	fn handle_submit_hashrate(&self, login: &str, worker: &str, params: Value) -> Value {
		let params: Vec<String> = serde_json::from_value(params).unwrap_or_default();
		if let Some(rate) = params
			.first()
			.and_then(|hex| crate::util::hex_to_u64(hex).ok())
		{
			let worker = shares::normalize_worker(worker);
			if let Err(e) =
				self.storage
					.record_hashrate(login, &worker, rate, Utc::now().timestamp_millis())
			{
				debug!("Hashrate sample for {} dropped: {}", login, e);
			}
		}
		json!(true)
	}

	// ----------------------------------------
	// Template refresh and job broadcast

	// One refresh tick: fetch fresh work for every connected login, then
	// notify the sessions whose template changed.
	fn refresh_templates(self: &Arc<Self>) {
		let logins: HashSet<String> = self
			.sessions
			.read()
			.values()
			.filter_map(|s| s.login())
			.collect();
		self.registry.prune(|login| logins.contains(login));
		if logins.is_empty() {
			return;
		}

		let mut handles = Vec::with_capacity(logins.len());
		for login in logins {
			let server = self.clone();
			handles.push(
				thread::Builder::new()
					.name("template-fetch".to_string())
					.spawn(move || server.refresh_login(&login)),
			);
		}
		let mut any_updated = false;
		for handle in handles {
			match handle {
				Ok(h) => {
					if let Ok(updated) = h.join() {
						any_updated = any_updated || updated;
					}
				}
				Err(e) => warn!("Failed to spawn template fetch: {}", e),
			}
		}
		if any_updated {
			self.broadcast_new_jobs();
		}
	}

	// Fetch work for one login and store it. Returns whether a new
	// template was stored; on any upstream failure the previous
	// template stays in place.
	pub(crate) fn refresh_login(&self, login: &str) -> bool {
		self.registry.begin_refresh(login);
		let shard = &self.config.proxy.shard_id;
		let pending = match self.rpc.get_pending_block(shard) {
			Ok(block) => Some(block),
			Err(e) => {
				debug!("Error refreshing pending block on {}: {}", self.rpc.name(), e);
				None
			}
		};
		let reply = match self.rpc.get_work(shard, login) {
			Ok(reply) => reply,
			Err(e) => {
				warn!(
					"Error refreshing block template on {}: {}",
					self.rpc.name(),
					e
				);
				return false;
			}
		};
		let prev = self.registry.current(login);
		// No need to update, the job is still fresh.
		if let Some(ref prev) = prev {
			if prev.header == reply.header {
				return false;
			}
		}
		let template =
			match crate::mining::blocks::BlockTemplate::build(&reply, prev.as_deref(), pending) {
				Ok(t) => t,
				Err(e) => {
					warn!("Unusable work reply on {}: {}", self.rpc.name(), e);
					return false;
				}
			};
		info!(
			"New block to mine on {} at height {} / {} for {}",
			self.rpc.name(),
			template.height,
			&template.header[..10.min(template.header.len())],
			login
		);
		self.registry.replace(login, template);
		self.registry.mark_updated(login);
		true
	}

	// Push the current job to every session whose login is flagged.
	pub(crate) fn broadcast_new_jobs(&self) {
		let updated: HashSet<String> = self.registry.updated_logins().into_iter().collect();
		if updated.is_empty() {
			return;
		}
		let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
		let mut notified = 0;
		for session in sessions {
			let login = match session.login() {
				Some(l) => l,
				None => continue,
			};
			if !updated.contains(&login) {
				continue;
			}
			if let Some(t) = self.registry.current(&login) {
				let push = StratumResponse::ok(json!(0), json!([t.header, t.seed, t.target]));
				session.set_last_target(&t.target);
				if session.send(&push) {
					notified += 1;
				}
			}
		}
		debug!("Broadcast new jobs to {} sessions", notified);
	}

	// ----------------------------------------
	// Stats

	fn update_stats(&self) {
		let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
		let session_stats: Vec<SessionStats> = sessions.iter().map(|s| s.stats()).collect();
		let logins: HashSet<String> = sessions.iter().filter_map(|s| s.login()).collect();
		let templates = self.registry.templates();
		let block_height = templates.iter().map(|t| t.height).max().unwrap_or(0);
		let pending_block = templates
			.iter()
			.max_by_key(|t| t.height)
			.and_then(|t| t.pending_cache.clone());

		let mut stats = self.stats.write();
		stats.num_sessions = session_stats.len();
		stats.num_logins = logins.len();
		stats.block_height = block_height;
		stats.upstream_sick = self.rpc.is_sick();
		stats.accepted_shares = self.accepted_total.load(Ordering::Relaxed);
		stats.invalid_shares = self.invalid_total.load(Ordering::Relaxed);
		stats.candidate_blocks = self.candidate_total.load(Ordering::Relaxed);
		stats.pending_block = pending_block;
		stats.session_stats = session_stats;
		stats.updated_at = Utc::now();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn address_validation() {
		assert!(is_valid_hex_address(
			"0x12345678901234567890abcdefabcdefabcdefab"
		));
		// Wrong length
		assert!(!is_valid_hex_address("0x1234"));
		// Uppercase is not canonical (callers lowercase first)
		assert!(!is_valid_hex_address(
			"0x12345678901234567890ABCDEFABCDEFABCDEFAB"
		));
		// No prefix
		assert!(!is_valid_hex_address(
			"12345678901234567890abcdefabcdefabcdefab"
		));
		// The zero address is reserved
		assert!(!is_valid_hex_address(&format!("0x{}", "0".repeat(40))));
	}

	#[test]
	fn responses_round_trip_the_request_id() {
		let resp = StratumResponse::ok(json!(42), json!(true));
		let line = serde_json::to_string(&resp).unwrap();
		let parsed: Value = serde_json::from_str(&line).unwrap();
		assert_eq!(parsed["id"], json!(42));
		assert_eq!(parsed["result"], json!(true));
		assert_eq!(parsed["error"], Value::Null);

		let resp = StratumResponse::err(json!("7"), &ErrorReply::new(-3, "Method not found"));
		let line = serde_json::to_string(&resp).unwrap();
		let parsed: Value = serde_json::from_str(&line).unwrap();
		assert_eq!(parsed["id"], json!("7"));
		assert_eq!(parsed["result"], Value::Null);
		assert_eq!(parsed["error"]["code"], json!(-3));
	}
}
