//! Time sources, injectable so retry and cooldown logic is testable.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    calls: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(clock.now() - start, chrono::Duration::minutes(10));
    }

    #[tokio::test]
    async fn recording_sleeper_keeps_order() {
        let sleeper = RecordingSleeper::default();
        sleeper.sleep(Duration::from_millis(5)).await;
        sleeper.sleep(Duration::from_millis(10)).await;
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(5), Duration::from_millis(10)]
        );
    }
}
