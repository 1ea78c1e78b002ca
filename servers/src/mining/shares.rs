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

//! The share-submission pipeline: shape checks, backlog lookup,
//! proof-of-work verification, duplicate detection and classification
//! into shares and candidate blocks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};

use crate::mining::pow;
use crate::mining::stratumserver::{ErrorReply, ProxyServer, Session};
use crate::storage::{CandidateRecord, ShareRecord};

lazy_static! {
	// Only lowercase hexadecimal with 0x prefix is accepted on the wire.
	static ref NONCE_PATTERN: Regex = Regex::new(r"^0x[0-9a-f]{16}$").unwrap();
	static ref HASH_PATTERN: Regex = Regex::new(r"^0x[0-9a-f]{64}$").unwrap();
	static ref WORKER_PATTERN: Regex = Regex::new(r"^[0-9a-zA-Z_-]{1,8}$").unwrap();
}

/// A rejected submission: the JSON error to answer with and whether the
/// session has exhausted its invalid-share budget and must be closed.
#[derive(Debug)]
pub struct SubmitError {
	/// Error member for the response.
	pub reply: ErrorReply,
	/// Close the connection after responding.
	pub close: bool,
}

/// Worker tags are free-form but bounded; anything else accounts to
/// worker "0".
pub fn normalize_worker(worker: &str) -> String {
	if WORKER_PATTERN.is_match(worker) {
		worker.to_string()
	} else {
		"0".to_string()
	}
}

enum Reject {
	Stale,
	BadPow,
}

/// Validate one `eth_submitWork` call and record its outcome.
///
/// `Ok(true)` is an accepted share (or candidate block), `Ok(false)` a
/// soft-dropped invalid share, `Err` carries the protocol error and the
/// close verdict.
pub fn handle_submit(
	server: &Arc<ProxyServer>,
	session: &Arc<Session>,
	login: &str,
	worker: &str,
	params: Vec<String>,
) -> Result<Value, SubmitError> {
	let worker = normalize_worker(worker);

	if params.len() != 3 {
		server.policy.apply_malformed_policy(&session.ip);
		warn!("Malformed params from {}@{}: {:?}", login, session.ip, params);
		return Err(SubmitError {
			reply: ErrorReply::new(-1, "Invalid params"),
			close: false,
		});
	}
	let nonce_hex = &params[0];
	let header_hex = &params[1];
	let mix_hex = &params[2];
	if !NONCE_PATTERN.is_match(nonce_hex)
		|| !HASH_PATTERN.is_match(header_hex)
		|| !HASH_PATTERN.is_match(mix_hex)
	{
		server.policy.apply_malformed_policy(&session.ip);
		warn!(
			"Malformed PoW result from {}@{}: {:?}",
			login, session.ip, params
		);
		return Err(SubmitError {
			reply: ErrorReply::new(-1, "Malformed PoW result"),
			close: false,
		});
	}

	// Locate the job. A missing template or a header outside the
	// backlog is a stale share, not a protocol violation.
	let template = match server.registry.current(login) {
		Some(t) => t,
		None => return reject(server, session, login, Reject::Stale),
	};
	let entry = match template.backlog_entry(header_hex) {
		Some(e) => e.clone(),
		None => return reject(server, session, login, Reject::Stale),
	};

	// The regexes above pin the exact widths, so these conversions
	// cannot fail; stay defensive anyway and count decode misses as
	// malformed rather than panic.
	let (header_bytes, mix_bytes, nonce) =
		match decode_solution(header_hex, mix_hex, nonce_hex) {
			Some(parts) => parts,
			None => {
				server.policy.apply_malformed_policy(&session.ip);
				return Err(SubmitError {
					reply: ErrorReply::new(-1, "Malformed PoW result"),
					close: false,
				});
			}
		};

	// Judge the solution under the difficulty the header was issued at,
	// with the seed of that height's epoch.
	let seed = pow::seed_hash(entry.height);
	let target = pow::target_from_diff(entry.diff);
	let actual = match server
		.verifier
		.verify(&header_bytes, nonce, &mix_bytes, &seed, target)
	{
		Some(actual) => actual,
		None => return reject(server, session, login, Reject::BadPow),
	};

	match server.storage.insert_share_unique(header_hex, nonce_hex) {
		Ok(false) => {}
		Ok(true) => {
			warn!(
				"Duplicate share from {}@{} {:?}",
				login, session.ip, params
			);
			let _ = server.policy.apply_share_policy(&session.ip, false);
			return Err(SubmitError {
				reply: ErrorReply::new(22, "Duplicate share"),
				close: false,
			});
		}
		Err(e) => {
			// Backend down: the share cannot be credited nor checked for
			// doubles, drop it without penalizing the miner.
			error!("Duplicate check failed for {}: {}", login, e);
			return Ok(json!(false));
		}
	}

	let share = ShareRecord {
		login: login.to_string(),
		worker,
		ip: session.ip.clone(),
		difficulty: entry.diff,
		height: entry.height,
		header: header_hex.clone(),
		timestamp_ms: Utc::now().timestamp_millis(),
	};

	// A share whose achieved difficulty reaches the network difficulty
	// is a candidate block and goes upstream.
	let network_difficulty = template.network_difficulty.unwrap_or(entry.diff);
	if actual >= network_difficulty {
		let shard = &server.config.proxy.shard_id;
		match server.rpc.submit_work(shard, nonce_hex, header_hex, mix_hex) {
			Ok(true) => {
				warn!(
					"Candidate block at height {} found by {}@{} - submitted upstream",
					entry.height, login, session.ip
				);
				let candidate = CandidateRecord {
					share: share.clone(),
					nonce: nonce_hex.clone(),
					mix_digest: mix_hex.clone(),
				};
				if let Err(e) = server.storage.write_candidate(&candidate) {
					error!("Failed to record candidate block for {}: {}", login, e);
				}
				server.candidate_total.fetch_add(1, Ordering::Relaxed);
				// Move this miner to the next height right away rather
				// than waiting out the refresh tick.
				let server_refresh = server.clone();
				let login_refresh = login.to_string();
				let _ = thread::Builder::new()
					.name("candidate-refresh".to_string())
					.spawn(move || {
						if server_refresh.refresh_login(&login_refresh) {
							server_refresh.broadcast_new_jobs();
						}
					});
			}
			Ok(false) => {
				warn!(
					"Upstream rejected candidate block from {}@{} at height {}",
					login, session.ip, entry.height
				);
				record_share(server, login, &share);
			}
			Err(e) => {
				error!("Candidate block submission failed for {}: {}", login, e);
				record_share(server, login, &share);
			}
		}
	} else {
		record_share(server, login, &share);
	}

	debug!("Valid share from {}@{}", login, session.ip);
	session.num_accepted.fetch_add(1, Ordering::Relaxed);
	server.accepted_total.fetch_add(1, Ordering::Relaxed);
	let _ = server.policy.apply_share_policy(&session.ip, true);
	Ok(json!(true))
}

fn record_share(server: &Arc<ProxyServer>, login: &str, share: &ShareRecord) {
	if let Err(e) = server.storage.write_share(share) {
		error!("Failed to record share for {}: {}", login, e);
	}
}

fn reject(
	server: &Arc<ProxyServer>,
	session: &Arc<Session>,
	login: &str,
	kind: Reject,
) -> Result<Value, SubmitError> {
	match kind {
		Reject::Stale => {
			info!("Stale share from {}@{}", login, session.ip);
			session.num_stale.fetch_add(1, Ordering::Relaxed);
		}
		Reject::BadPow => {
			info!("Invalid share from {}@{}", login, session.ip);
			session.num_invalid.fetch_add(1, Ordering::Relaxed);
		}
	}
	server.invalid_total.fetch_add(1, Ordering::Relaxed);
	if server.policy.apply_share_policy(&session.ip, false) {
		// Soft drop, the connection may keep submitting.
		Ok(json!(false))
	} else {
		Err(SubmitError {
			reply: ErrorReply::new(23, "Invalid share"),
			close: true,
		})
	}
}

fn decode_solution(
	header_hex: &str,
	mix_hex: &str,
	nonce_hex: &str,
) -> Option<([u8; 32], [u8; 32], u64)> {
	let header = crate::util::from_hex(header_hex).ok()?;
	let mix = crate::util::from_hex(mix_hex).ok()?;
	let nonce = crate::util::hex_to_u64(nonce_hex).ok()?;
	if header.len() != 32 || mix.len() != 32 {
		return None;
	}
	let mut header_bytes = [0u8; 32];
	header_bytes.copy_from_slice(&header);
	let mut mix_bytes = [0u8; 32];
	mix_bytes.copy_from_slice(&mix);
	Some((header_bytes, mix_bytes, nonce))
}
