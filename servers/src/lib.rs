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

//! The qpool stratum proxy: per-miner block-template acquisition and
//! distribution, the stratum session state machine, the share-submission
//! pipeline and the seams to the upstream node and the accounting store.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

use qpool_util as util;

pub mod common;
pub mod mining;
pub mod rpc;
pub mod storage;

pub use crate::common::stats::{ProxyStats, SessionStats};
pub use crate::common::types::{Error, ServerConfig, StratumConfig};
pub use crate::mining::stratumserver::ProxyServer;
