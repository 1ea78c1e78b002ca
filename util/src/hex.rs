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

//! Implements hex-encoding from bytes to string and decoding of strings
//! to bytes. The stratum wire format wants everything lowercase with a
//! `0x` prefix, so that is the canonical form produced here.

use std::fmt::Write;
use std::num::ParseIntError;

/// Encode the provided bytes into a lowercase hex string, no prefix.
pub fn to_hex(bytes: &[u8]) -> String {
	let mut s = String::with_capacity(bytes.len() * 2);
	for byte in bytes {
		write!(&mut s, "{:02x}", byte).expect("hex write");
	}
	s
}

/// Encode the provided bytes into a canonical `0x`-prefixed hex string.
pub fn to_hex_prefixed(bytes: &[u8]) -> String {
	format!("0x{}", to_hex(bytes))
}

/// Decode a hex string, with or without `0x` prefix, into bytes. An odd
/// number of digits is padded with a leading zero, matching the quantity
/// encoding used on the wire.
pub fn from_hex(hex_str: &str) -> Result<Vec<u8>, ParseIntError> {
	let hex_trim = hex_str.trim_start_matches("0x");
	let padded = if hex_trim.len() % 2 == 1 {
		format!("0{}", hex_trim)
	} else {
		hex_trim.to_owned()
	};
	(0..padded.len() / 2)
		.map(|i| u8::from_str_radix(&padded[2 * i..2 * i + 2], 16))
		.collect()
}

/// Parse a hex quantity, with or without `0x` prefix, into a u64.
pub fn hex_to_u64(hex_str: &str) -> Result<u64, ParseIntError> {
	u64::from_str_radix(hex_str.trim_start_matches("0x"), 16)
}
