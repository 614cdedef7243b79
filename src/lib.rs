// Copyright 2023 The SeamDB Authors.
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

//! Client side building blocks for multi-document transactions over a document store that only
//! offers single document atomicity.
//!
//! Each attempt records its state in an entry of an active transaction record (ATR) document and
//! stages mutations as metadata on the documents it touches.

pub mod atr;
pub mod attempt;
pub mod clock;
pub mod compat;
pub mod config;
pub mod document;
pub mod error;
pub mod getmulti;
pub mod memory;
pub mod staged;
pub mod store;
pub mod task;
pub mod timer;
pub mod utils;
pub mod wrapper;

pub use self::attempt::AttemptContext;
pub use self::config::TransactionConfig;
pub use self::error::{ErrorClass, Result, TransactionOperationFailed, TxnError};
pub use self::getmulti::{GetMultiManager, GetMultiMode, GetMultiOptions, GetMultiResult, GetMultiSpec};
pub use self::wrapper::OperationWrapper;
