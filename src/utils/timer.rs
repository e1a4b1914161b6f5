//! Resettable timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::OrdercastError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Used as a `select!`
/// branch that fires periodically by restarting it after each expiry.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box so that it
    /// can be awaited repeatedly.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer that immediately times out after a zero-length
    /// duration.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
        }
    }

    /// Gets the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Restarts the timer with the given duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), OrdercastError> {
        if dur.is_zero() {
            return Err(OrdercastError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Restarts the timer with the last used duration.
    pub fn kickoff(&mut self) -> Result<(), OrdercastError> {
        self.restart(self.last_dur)
    }

    /// Waits for the timer to time out. Typically used as a branch of a
    /// `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let mut timer = Timer::new();
        assert!(timer.get_dur().is_zero());
        assert!(timer.kickoff().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), OrdercastError> {
        let mut timer = Timer::new();
        let mut start = Instant::now();
        timer.restart(Duration::from_millis(100))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        // kicking off again reuses the same duration
        start = Instant::now();
        timer.kickoff()?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(timer.get_dur(), Duration::from_millis(100));
        Ok(())
    }
}
