// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Timeouts of the verification flows.
//!
//! Timeouts are kept as absolute deadlines, the remaining time is always
//! recomputed from the deadline instead of counting ticks of a sleeping timer.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    timeout: Duration,
    deadline: Instant,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, deadline: Instant::now() + timeout }
    }

    /// A deadline that started at an earlier point in time, for example when
    /// the other side sent a request.
    pub fn started_ago(timeout: Duration, elapsed: Duration) -> Self {
        let deadline = Instant::now() + timeout.saturating_sub(elapsed);
        Self { timeout, deadline }
    }

    /// Push the deadline back by a full timeout, called whenever an expected
    /// event arrives.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub fn instant(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Wait until the deadline returned by `deadline` passes.
///
/// The deadline is fetched again after every wakeup so resets that happened
/// while we were sleeping are respected. Returns early if `deadline` returns
/// `None`, i.e. the flow finished and no longer has a deadline.
pub(crate) async fn wait_for_deadline(mut deadline: impl FnMut() -> Option<Instant>) {
    while let Some(instant) = deadline() {
        if Instant::now() >= instant {
            return;
        }

        tokio::time::sleep_until(instant).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio::time::Instant;

    use super::{wait_for_deadline, Deadline};

    #[tokio::test(start_paused = true)]
    async fn deadlines_expire() {
        let mut deadline = Deadline::new(Duration::from_secs(60));

        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(15));

        deadline.reset();
        assert_eq!(deadline.remaining(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);

        let deadline = Deadline::started_ago(Duration::from_secs(60), Duration::from_secs(90));
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_respects_resets() {
        let deadline = Arc::new(Mutex::new(Deadline::new(Duration::from_secs(10))));
        let start = Instant::now();

        let waiter = tokio::spawn({
            let deadline = deadline.clone();
            async move { wait_for_deadline(|| Some(deadline.lock().unwrap().instant())).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        deadline.lock().unwrap().reset();

        waiter.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_stops_without_deadline() {
        wait_for_deadline(|| None).await;
    }
}
