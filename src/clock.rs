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

use std::ops::Add;
use std::time::{Duration, Instant};

use static_assertions::assert_impl_all;

/// Absolute point in monotonic time after which an operation should give up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    instant: Instant,
}

assert_impl_all!(Deadline: Send, Sync, Copy);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    pub fn after(duration: Duration) -> Self {
        Self { instant: Instant::now() + duration }
    }

    pub fn now() -> Self {
        Self { instant: Instant::now() }
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn remaining(&self) -> Duration {
        self.instant.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.instant
    }

    /// Earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Self {
        Ord::min(self, other)
    }
}

impl Add<Duration> for Deadline {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self { instant: self.instant + rhs }
    }
}

impl std::fmt::Display for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} remaining", self.remaining())
    }
}

/// Wall clock milliseconds since unix epoch, comparable to decoded CAS timestamps.
pub fn unix_millis_now() -> i64 {
    jiff::Timestamp::now().as_millisecond()
}
