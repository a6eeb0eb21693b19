use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Mutex;
use std::time::Duration;

/// Source of monotonic time and delays for the engine
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock was created
    fn now(&self) -> Duration;

    /// Local wall time, stamped on ledger rows
    fn wall_time(&self) -> NaiveDateTime;

    /// Suspend the current task for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_time(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Simulated clock: sleeping advances time instantly and is recorded.
///
/// Lets backoff and rate-limit behaviour be asserted without waiting.
#[derive(Default)]
pub struct ManualClock {
    start: NaiveDateTime,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose wall time begins at `start`
    pub fn starting_at(start: NaiveDateTime) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    /// Move time forward without recording a sleep (simulates work)
    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or_default()
    }

    fn wall_time(&self) -> NaiveDateTime {
        chrono::Duration::from_std(self.now())
            .ok()
            .and_then(|elapsed| self.start.checked_add_signed(elapsed))
            .unwrap_or(self.start)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}

/// Fixed-interval limiter: a token bucket holding a single token.
///
/// `acquire` waits until `interval` has passed since the previous `release`.
/// The first acquire never waits, so a run of N calls produces at most N-1 waits
/// and nothing trails the last call.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_release: Option<Duration>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_release: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&mut self, clock: &dyn Clock) {
        let Some(last) = self.last_release else {
            return;
        };

        let since = clock.now().saturating_sub(last);
        if since < self.interval {
            let wait = self.interval - since;
            tracing::debug!("Rate limit: waiting {:.1}s before next call", wait.as_secs_f64());
            clock.sleep(wait).await;
        }
    }

    pub fn release(&mut self, clock: &dyn Clock) {
        self.last_release = Some(clock.now());
    }
}
