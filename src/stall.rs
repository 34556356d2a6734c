use std::time::{Duration, SystemTime};

/// Verdict on the newest frame's age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The newest frame is within the time limit.
    Progressing,
    /// The newest frame is older than the time limit.
    Stalled { age: Duration },
}

/// Decides whether the render has stalled based on how old the newest frame is.
///
/// Stalled iff `now - frame_time > time_limit`. An age exactly equal to the
/// limit still counts as progressing: the poll interval equals the limit, so
/// most checks land on that boundary.
#[derive(Debug, Clone, Copy)]
pub struct StallDetector {
    time_limit: Duration,
}

impl StallDetector {
    pub fn new(time_limit: Duration) -> Self {
        Self { time_limit }
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    /// Evaluate a frame timestamp against `now`.
    ///
    /// A timestamp in the future (clock skew, network filesystems) is treated
    /// as age zero.
    pub fn evaluate(&self, frame_time: SystemTime, now: SystemTime) -> Progress {
        let age = now.duration_since(frame_time).unwrap_or(Duration::ZERO);
        if age > self.time_limit {
            Progress::Stalled { age }
        } else {
            Progress::Progressing
        }
    }
}
