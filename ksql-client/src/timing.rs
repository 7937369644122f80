use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::classify::Mode;

/// Logs wall-clock time of a dispatch call when dropped.
pub(crate) struct CallTimer {
    started: Instant,
    slow_threshold: Duration,
    mode: Option<Mode>,
}

impl CallTimer {
    pub(crate) fn start(slow_threshold: Duration) -> Self {
        Self {
            started: Instant::now(),
            slow_threshold,
            mode: None,
        }
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = Some(mode);
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let elapsed_secs = format!("{:.4}", elapsed.as_secs_f64());
        let mode = self.mode.map(|m| m.as_str()).unwrap_or("unclassified");
        if is_slow(elapsed, self.slow_threshold) {
            warn!(mode, %elapsed_secs, "took {elapsed_secs}secs (that was definitely slow)");
        } else {
            info!(mode, %elapsed_secs, "took {elapsed_secs}secs");
        }
    }
}

pub(crate) fn is_slow(elapsed: Duration, threshold: Duration) -> bool {
    elapsed > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_means_strictly_above_threshold() {
        let threshold = Duration::from_millis(500);
        assert!(!is_slow(Duration::from_millis(500), threshold));
        assert!(is_slow(Duration::from_millis(501), threshold));
        assert!(!is_slow(Duration::from_millis(20), threshold));
    }
}
