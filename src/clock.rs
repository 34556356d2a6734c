/// Time source for the watchdog loop.
///
/// Frame timestamps are wall-clock (`SystemTime`), so `now()` is wall-clock too.
/// All waiting in the loop goes through `sleep()`, which lets tests advance
/// time without actually blocking.
use std::future::Future;
use std::time::{Duration, SystemTime};

pub trait Clock {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Suspend the caller for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// The real clock: `SystemTime::now()` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Test clock: `sleep()` returns immediately after moving `now()` forward.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: std::sync::Arc<std::sync::Mutex<SystemTime>>,
    slept: std::sync::Arc<std::sync::Mutex<Vec<Duration>>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(start)),
            slept: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    /// Every duration passed to `sleep()`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        self.slept.lock().unwrap().push(duration);
        std::future::ready(())
    }
}
