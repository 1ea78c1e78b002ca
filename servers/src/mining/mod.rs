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

//! Everything between a miner's TCP connection and the upstream node:
//! templates, proof-of-work checks, abuse policy, the share pipeline and
//! the stratum server itself.

pub mod blocks;
pub mod policy;
pub mod pow;
pub mod shares;
pub mod stratumserver;
