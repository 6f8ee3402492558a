//! Recording Meter (C3)
//!
//! Separates "connected" time from "actually recording" time by accumulating
//! billable milliseconds across pause/resume segments.

use std::time::Instant;

struct Segment {
    start: Instant,
    end: Option<Instant>,
}

/// Per-session recording duration tracker.
pub struct RecordingMeter {
    session_start: Instant,
    total_ms: i64,
    is_recording: bool,
    segment_start: Option<Instant>,
    segments: Vec<Segment>,
}

impl RecordingMeter {
    pub fn new() -> Self {
        Self {
            session_start: Instant::now(),
            total_ms: 0,
            is_recording: false,
            segment_start: None,
            segments: Vec::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Start a recording segment. A second `start` while already recording is
    /// a no-op (idempotent).
    pub fn start(&mut self) {
        if self.is_recording {
            tracing::debug!("start_recording ignored: already recording");
            return;
        }
        let now = Instant::now();
        self.segment_start = Some(now);
        self.is_recording = true;
        self.segments.push(Segment { start: now, end: None });
    }

    /// Stop the current recording segment. A `stop` while not recording is a
    /// no-op.
    pub fn stop(&mut self) {
        if !self.is_recording {
            tracing::debug!("stop_recording ignored: not recording");
            return;
        }
        let now = Instant::now();
        let Some(start) = self.segment_start else {
            return;
        };
        self.total_ms += (now - start).as_millis() as i64;
        if let Some(last) = self.segments.last_mut() {
            last.end = Some(now);
        }
        self.segment_start = None;
        self.is_recording = false;
    }

    /// Current billable duration. Falls back to wall-clock-since-connect for
    /// sessions that never recorded a segment (legacy compatibility for
    /// clients that connected before metering existed).
    pub fn current_duration_ms(&self) -> i64 {
        let recording_extra = if self.is_recording {
            self.segment_start
                .map(|s| (Instant::now() - s).as_millis() as i64)
                .unwrap_or(0)
        } else {
            0
        };
        let total = self.total_ms + recording_extra;
        if self.segments.is_empty() {
            (Instant::now() - self.session_start).as_millis() as i64
        } else {
            total
        }
    }
}

impl Default for RecordingMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn start_stop_idempotent() {
        let mut m = RecordingMeter::new();
        m.start();
        m.start(); // ignored
        assert!(m.is_recording());
        m.stop();
        m.stop(); // ignored
        assert!(!m.is_recording());
    }

    #[test]
    fn duration_monotone_while_recording() {
        let mut m = RecordingMeter::new();
        m.start();
        let d1 = m.current_duration_ms();
        sleep(Duration::from_millis(5));
        let d2 = m.current_duration_ms();
        assert!(d2 >= d1);
    }

    #[test]
    fn duration_invariant_while_paused() {
        let mut m = RecordingMeter::new();
        m.start();
        sleep(Duration::from_millis(5));
        m.stop();
        let d1 = m.current_duration_ms();
        sleep(Duration::from_millis(5));
        let d2 = m.current_duration_ms();
        assert_eq!(d1, d2);
    }

    #[test]
    fn pause_resume_sums_closed_segments() {
        let mut m = RecordingMeter::new();
        m.start();
        sleep(Duration::from_millis(10));
        m.stop();
        m.start();
        sleep(Duration::from_millis(10));
        m.stop();
        assert!(m.current_duration_ms() >= 18);
    }
}
