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

//! Upstream node JSON-RPC client. The proxy only ever consumes a node,
//! never serves one, and everything it needs is behind the `NodeClient`
//! trait so tests can run against a scripted node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

use crate::common::types::Error;

/// Decomposed `getWork` reply. The upstream answers with a 3- or
/// 4-element array; the optional fourth element is the network
/// difficulty, in which case element 2 carries the guardian-scaled
/// share difficulty.
#[derive(Debug, Clone)]
pub struct GetWorkReply {
	/// Header hash identifying the job, 32 bytes of `0x` hex.
	pub header: String,
	/// Block height as a hex quantity.
	pub height_hex: String,
	/// Share difficulty as a hex quantity.
	pub diff_hex: String,
	/// Network difficulty as a hex quantity, present on guardian shards.
	pub network_diff_hex: Option<String>,
}

impl GetWorkReply {
	/// Split a raw reply array into its parts.
	pub fn from_parts(parts: Vec<String>) -> Result<GetWorkReply, Error> {
		if parts.len() != 3 && parts.len() != 4 {
			return Err(Error::Format(format!(
				"getWork reply has {} elements, want 3 or 4",
				parts.len()
			)));
		}
		let mut it = parts.into_iter();
		Ok(GetWorkReply {
			header: it.next().unwrap(),
			height_hex: it.next().unwrap(),
			diff_hex: it.next().unwrap(),
			network_diff_hex: it.next(),
		})
	}
}

/// Everything the proxy asks of the upstream node.
pub trait NodeClient: Send + Sync {
	/// Fetch a fresh work template for the given miner on the given shard.
	fn get_work(&self, shard_id: &str, login: &str) -> Result<GetWorkReply, Error>;
	/// Fetch the pending block, returned opaquely for the stats surface.
	fn get_pending_block(&self, shard_id: &str) -> Result<Value, Error>;
	/// Fetch contract code for login admission checks.
	fn get_code(&self, contract_id: &str) -> Result<String, Error>;
	/// Fetch a contract storage word for login admission checks.
	fn get_storage_at(&self, contract_id: &str, slot: u64) -> Result<String, Error>;
	/// Submit a candidate block. Returns the node's accept verdict.
	fn submit_work(
		&self,
		shard_id: &str,
		nonce: &str,
		header: &str,
		mix_digest: &str,
	) -> Result<bool, Error>;
	/// Whether the node has failed enough consecutive requests that work
	/// distribution should be withheld.
	fn is_sick(&self) -> bool;
	/// Display name for log lines.
	fn name(&self) -> &str;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
	jsonrpc: &'static str,
	method: &'a str,
	params: Value,
	id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
	result: Option<Value>,
	error: Option<RpcErrorObject>,
}

#[derive(Deserialize, Debug)]
struct RpcErrorObject {
	code: i64,
	message: String,
}

/// Blocking HTTP JSON-RPC client with consecutive-failure sickness
/// tracking. Any transport failure bumps the failure counter; any
/// response from the node (success or JSON-RPC error) resets it.
pub struct HttpNodeClient {
	name: String,
	url: String,
	max_fails: u64,
	client: reqwest::blocking::Client,
	request_id: AtomicU64,
	failures: AtomicU64,
}

impl HttpNodeClient {
	/// Build a client against the given endpoint.
	pub fn new(name: &str, url: &str, timeout: Duration, max_fails: u64) -> Result<HttpNodeClient, Error> {
		let client = reqwest::blocking::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| Error::Upstream(e.to_string()))?;
		Ok(HttpNodeClient {
			name: name.to_string(),
			url: url.to_string(),
			max_fails,
			client,
			request_id: AtomicU64::new(0),
			failures: AtomicU64::new(0),
		})
	}

	fn mark_sick(&self) {
		let n = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
		if n == self.max_fails {
			warn!("Upstream {} is sick after {} failures", self.name, n);
		}
	}

	fn mark_alive(&self) {
		self.failures.store(0, Ordering::Relaxed);
	}

	fn call<T>(&self, method: &str, params: Value) -> Result<T, Error>
	where
		for<'de> T: serde::Deserialize<'de>,
	{
		let req = RpcRequest {
			jsonrpc: "2.0",
			method,
			params,
			id: self.request_id.fetch_add(1, Ordering::Relaxed),
		};
		let resp = self
			.client
			.post(&self.url)
			.json(&req)
			.send()
			.and_then(|r| r.json::<RpcResponse>())
			.map_err(|e| {
				self.mark_sick();
				Error::Upstream(format!("{}: {}", method, e))
			})?;
		self.mark_alive();
		if let Some(err) = resp.error {
			return Err(Error::Upstream(format!(
				"{}: node returned {} {}",
				method, err.code, err.message
			)));
		}
		let result = resp
			.result
			.ok_or_else(|| Error::Upstream(format!("{}: empty result", method)))?;
		serde_json::from_value(result)
			.map_err(|e| Error::Format(format!("{}: invalid result: {}", method, e)))
	}
}

impl NodeClient for HttpNodeClient {
	fn get_work(&self, shard_id: &str, login: &str) -> Result<GetWorkReply, Error> {
		let parts: Vec<String> = self.call("getWork", json!([shard_id, login]))?;
		GetWorkReply::from_parts(parts)
	}

	fn get_pending_block(&self, shard_id: &str) -> Result<Value, Error> {
		self.call("getPendingBlock", json!([shard_id]))
	}

	fn get_code(&self, contract_id: &str) -> Result<String, Error> {
		self.call("getCode", json!([contract_id]))
	}

	fn get_storage_at(&self, contract_id: &str, slot: u64) -> Result<String, Error> {
		self.call("getStorageAt", json!([contract_id, format!("{:#x}", slot)]))
	}

	fn submit_work(
		&self,
		shard_id: &str,
		nonce: &str,
		header: &str,
		mix_digest: &str,
	) -> Result<bool, Error> {
		self.call("submitWork", json!([shard_id, nonce, header, mix_digest]))
	}

	fn is_sick(&self) -> bool {
		self.failures.load(Ordering::Relaxed) >= self.max_fails
	}

	fn name(&self) -> &str {
		&self.name
	}
}
