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

use std::time::Duration;

use crate::getmulti::GetMultiMode;

const EXPIRATION: Duration = Duration::from_secs(15);
const KV_TIMEOUT: Duration = Duration::from_millis(2500);
const GET_MULTI_CONCURRENCY: usize = 100;
const UNSTAGING_CONCURRENCY: usize = 100;
const REPEAT_DELAY: Duration = Duration::from_millis(1);
const RETRY_LIMIT: usize = 100_000;

#[derive(Clone, Debug)]
pub struct TransactionConfig {
    expiration: Duration,
    kv_timeout: Duration,
    get_multi_mode: GetMultiMode,
    get_multi_concurrency: usize,
    unstaging_concurrency: usize,
    repeat_delay: Duration,
    retry_limit: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration: EXPIRATION,
            kv_timeout: KV_TIMEOUT,
            get_multi_mode: GetMultiMode::default(),
            get_multi_concurrency: GET_MULTI_CONCURRENCY,
            unstaging_concurrency: UNSTAGING_CONCURRENCY,
            repeat_delay: REPEAT_DELAY,
            retry_limit: RETRY_LIMIT,
        }
    }
}

impl TransactionConfig {
    pub fn with_expiration(self, expiration: Duration) -> Self {
        Self { expiration, ..self }
    }

    pub fn with_kv_timeout(self, kv_timeout: Duration) -> Self {
        Self { kv_timeout, ..self }
    }

    pub fn with_get_multi_mode(self, get_multi_mode: GetMultiMode) -> Self {
        Self { get_multi_mode, ..self }
    }

    pub fn with_get_multi_concurrency(self, concurrency: usize) -> Self {
        Self { get_multi_concurrency: concurrency.max(1), ..self }
    }

    pub fn with_unstaging_concurrency(self, concurrency: usize) -> Self {
        Self { unstaging_concurrency: concurrency.max(1), ..self }
    }

    pub fn with_repeat_delay(self, repeat_delay: Duration) -> Self {
        Self { repeat_delay, ..self }
    }

    pub fn with_retry_limit(self, retry_limit: usize) -> Self {
        Self { retry_limit, ..self }
    }

    #[inline]
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    #[inline]
    pub fn kv_timeout(&self) -> Duration {
        self.kv_timeout
    }

    #[inline]
    pub fn get_multi_mode(&self) -> GetMultiMode {
        self.get_multi_mode
    }

    #[inline]
    pub fn get_multi_concurrency(&self) -> usize {
        self.get_multi_concurrency
    }

    #[inline]
    pub fn unstaging_concurrency(&self) -> usize {
        self.unstaging_concurrency
    }

    #[inline]
    pub fn repeat_delay(&self) -> Duration {
        self.repeat_delay
    }

    #[inline]
    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }
}
