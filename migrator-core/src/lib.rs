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

#[cfg(test)]
test_r::enable!();

pub mod bootstrap;
pub mod classifier;
pub mod client_pool;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hasher;
pub mod memory;
pub mod model;
pub mod network;
pub mod planner;
pub mod tuner;
pub mod worker;

pub use error::{CoordinatorError, PlannerError, TransferError};
