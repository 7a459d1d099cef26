//! Restartable debounce timer.
//!
//! ```text
//! arm()               deadline = now + grace, pending
//! fired().await       completes once per arming, after the deadline
//! cancel_if_pending() disarms; reports whether a fire was owed
//! ```
//!
//! Re-arming resets the single underlying deadline, so an elapsed but not
//! yet consumed expiry can never produce a second fire.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

#[derive(Debug)]
pub struct DebounceTimer {
    grace: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl DebounceTimer {
    /// Must be called within a Tokio runtime.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            sleep: Box::pin(tokio::time::sleep(grace)),
            armed: false,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Start, or restart, the quiet period.
    pub fn arm(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.grace);
        self.armed = true;
    }

    /// Disarm. Returns true if a fire was pending, elapsed or not.
    pub fn cancel_if_pending(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }

    /// Wait for the armed deadline. Pending forever while disarmed.
    ///
    /// Cancel safe: dropping the future before completion leaves the timer
    /// armed.
    pub async fn fired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}
