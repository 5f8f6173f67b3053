use std::time::{Duration, Instant};
use tracing::info;

/// Wall-clock span of one build phase, logged when finished.
pub struct Timer {
    phase: String,
    began: Instant,
}

impl Timer {
    pub fn start(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            began: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let took = self.began.elapsed();
        info!(phase = %self.phase, took = %format_duration(took), "phase finished");
        took
    }
}

/// Tenths of a second below a minute, tenths of a minute above.
pub fn format_duration(d: Duration) -> String {
    match d.as_secs_f64() {
        s if s < 60.0 => format!("{:.1}s", s),
        s => format!("{:.1}m", s / 60.0),
    }
}
