//! Job progress tracking.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Latest progress reported by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Progress percentage (0-100)
    pub percent: u8,
    /// Current step description
    pub message: Option<String>,
    /// When the update was recorded
    pub timestamp: DateTime<Utc>,
}

impl Default for ProgressUpdate {
    fn default() -> Self {
        Self {
            percent: 0,
            message: None,
            timestamp: Utc::now(),
        }
    }
}

/// Progress handle owned by a job status.
#[derive(Debug, Default)]
pub struct JobProgress {
    current: RwLock<ProgressUpdate>,
}

impl JobProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new value, clamped to 100. Progress never goes backwards.
    pub fn update(&self, percent: u8, message: Option<String>) -> ProgressUpdate {
        let mut current = self.current.write();
        current.percent = percent.min(100).max(current.percent);
        current.message = message;
        current.timestamp = Utc::now();
        current.clone()
    }

    /// Jump straight to 100%.
    pub fn complete(&self) -> ProgressUpdate {
        let message = self.current.read().message.clone();
        self.update(100, message)
    }

    pub fn percent(&self) -> u8 {
        self.current.read().percent
    }

    pub fn current(&self) -> ProgressUpdate {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_clamps_and_is_monotonic() {
        let progress = JobProgress::new();
        assert_eq!(progress.percent(), 0);

        progress.update(40, Some("indexing".into()));
        assert_eq!(progress.percent(), 40);

        progress.update(20, None);
        assert_eq!(progress.percent(), 40);

        progress.update(250, None);
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_complete_keeps_message() {
        let progress = JobProgress::new();
        progress.update(10, Some("copying".into()));
        let update = progress.complete();
        assert_eq!(update.percent, 100);
        assert_eq!(update.message.as_deref(), Some("copying"));
    }
}
