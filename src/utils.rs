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

use ignore_result::Ignore;
use tokio::sync::watch;

/// Broadcast condition that can be closed and reopened any number of times.
///
/// Waiters block until the gate is observed open. A waiter that subscribes while the gate is
/// closed is released by the next open, not by an earlier one.
#[derive(Debug)]
pub struct Gate {
    sender: watch::Sender<bool>,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        let (sender, _receiver) = watch::channel(open);
        Self { sender }
    }

    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    pub fn close(&self) {
        self.sender.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // Sender lives in self, so this never fails.
        receiver.wait_for(|open| *open).await.ignore();
    }
}
