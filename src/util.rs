// CIRRUS: Orchestration of Ephemeral Cloud Testbeds for Network Measurement Experiments
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Utility module collection of functions

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

pub fn init_logging() {
    log4rs::init_file("log4rs.yml", Default::default()).unwrap();
}

/// Exponential backoff with jitter and a monotonic deadline.
///
/// Delays start at `base`, double per step up to `max`, and every delay is
/// scaled by a random factor in `[0.5, 1.5)`. The optional budget is checked
/// against a monotonic clock so that wall-clock adjustments cannot extend a
/// retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    deadline: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            delay: base,
            max_delay,
            deadline: None,
        }
    }

    /// Limit the total time budget of the retry loop.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    /// Whether the time budget is used up.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The next delay to sleep for.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = self.delay.mul_f64(jitter);
        self.delay = (self.delay * 2).min(self.max_delay);
        delay
    }

    /// Sleep for the next (jittered) delay.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

/// Cooperative cancellation flag for in-flight provisioning/teardown tasks.
///
/// Tasks check the token between steps, never mid-API-call, so cancellation
/// always leaves a resource graph that is a valid input to teardown.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

pub trait PathBufExt: Sized {
    fn then(self, p: impl AsRef<Path>) -> PathBuf;
}

impl PathBufExt for PathBuf {
    fn then(mut self, p: impl AsRef<Path>) -> PathBuf {
        self.push(p);
        self
    }
}

impl PathBufExt for &Path {
    fn then(self, p: impl AsRef<Path>) -> PathBuf {
        let mut path = self.to_path_buf();
        path.push(p);
        path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_delays_grow_and_stay_jittered() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50) && first < Duration::from_millis(150));

        // after enough steps, the un-jittered delay saturates at the max
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped < Duration::from_secs(3));
    }

    #[test]
    fn backoff_budget_expires() {
        let backoff =
            Backoff::new(Duration::from_millis(1), Duration::from_millis(1)).with_budget(Duration::ZERO);
        assert!(backoff.expired());

        let fresh = Backoff::new(Duration::from_millis(1), Duration::from_millis(1))
            .with_budget(Duration::from_secs(3600));
        assert!(!fresh.expired());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
