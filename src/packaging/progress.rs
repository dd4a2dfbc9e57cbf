/// Percent progress over a known byte total.
///
/// Emits each integer percentage at most once and never goes backwards,
/// so observers polling the task record see a clean 0..=100 ramp instead
/// of one update per archived file.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    written: u64,
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            written: 0,
            last: None,
        }
    }

    /// Records `bytes` more written and returns the percentage to emit,
    /// or `None` when the integer value has not moved since the last
    /// emission. A zero total never emits.
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        self.written = self.written.saturating_add(bytes);
        let percent = (self.written.min(self.total) * 100 / self.total) as u8;
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}
