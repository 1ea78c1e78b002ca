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

//! Configuration file management for the qpool proxy. Discovers a TOML
//! file, parses it into the typed sections the other crates consume and
//! can generate a default file on first run.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate serde_derive;

use qpool_servers as servers;
use qpool_util as util;

mod config;
mod types;

pub use crate::config::{config_file_exists, GlobalConfig, CONFIG_FILE_NAME};
pub use crate::types::{ConfigError, ConfigMembers};
