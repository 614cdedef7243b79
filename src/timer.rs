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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_io::Timer as IoTimer;

enum Inner {
    Ready(Instant),
    Timer(IoTimer),
}

pub struct Timer {
    inner: Inner,
}

impl Timer {
    pub fn ready() -> Timer {
        Self { inner: Inner::Ready(Instant::now()) }
    }

    pub fn after(duration: Duration) -> Timer {
        if duration.is_zero() {
            return Self::ready();
        }
        Self { inner: Inner::Timer(IoTimer::after(duration)) }
    }
}

impl Future for Timer {
    type Output = Instant;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(instant) => Poll::Ready(*instant),
            Inner::Timer(timer) => Pin::new(timer).poll(cx),
        }
    }
}

/// Doubling delay sequence starting from an initial delay.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    next: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Doubles without bound.
    pub fn unbounded(initial: Duration) -> Self {
        Self { initial, next: initial, max: None }
    }

    pub fn capped(initial: Duration, max: Duration) -> Self {
        Self { initial, next: initial.min(max), max: Some(max) }
    }

    /// Delay to sleep for this round, advancing to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let doubled = self.next.saturating_mul(2);
        self.next = match self.max {
            None => doubled,
            Some(max) => doubled.min(max),
        };
        delay
    }

    pub fn peek(&self) -> Duration {
        self.next
    }

    pub fn reset(&mut self) {
        self.next = match self.max {
            None => self.initial,
            Some(max) => self.initial.min(max),
        };
    }

    pub async fn wait(&mut self) {
        Timer::after(self.next_delay()).await;
    }
}
