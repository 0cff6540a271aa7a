//! Reconciler tuning.
//!
//! The thresholds here were chosen empirically; they are settings, not
//! protocol invariants.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Characters compared when checking a finalized message for a replay.
    pub dedup_prefix_chars: usize,
    /// Both messages must be longer than this for the replay check to apply.
    pub dedup_min_chars: usize,
    /// Window after a message's timestamp in which a new artifact is
    /// associated with it for display.
    pub association_window_secs: u64,
    /// How far recovered history is moved into the past.
    pub history_time_shift_secs: u64,
    /// How long a completed pipeline stays visible before it is cleared.
    pub progress_hold_ms: u64,
    /// Step name that marks the end of a pipeline.
    pub final_step: String,
    /// Artifact types announced by the pipeline completion message.
    pub completion_artifact_types: Vec<String>,
    /// Text of the pipeline completion message.
    pub completion_message: String,
    /// Announcement appended when the workflow enters a phase.
    pub phase_announcements: BTreeMap<String, String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let phase_announcements = [
            ("discovery", "Starting discovery. I'll look at the data you provided."),
            ("profiling", "Moving on to profiling the data."),
            ("modeling", "Moving on to data modeling."),
            ("review", "Everything is ready for your review."),
        ]
        .into_iter()
        .map(|(phase, text)| (phase.to_string(), text.to_string()))
        .collect();

        Self {
            dedup_prefix_chars: 200,
            dedup_min_chars: 50,
            association_window_secs: 30,
            history_time_shift_secs: 3600,
            progress_hold_ms: 1500,
            final_step: "artifacts".to_string(),
            completion_artifact_types: vec!["erd".to_string(), "data_quality".to_string()],
            completion_message: "Analysis complete. The generated artifacts are ready to review."
                .to_string(),
            phase_announcements,
        }
    }
}

impl ReconcilerConfig {
    pub fn association_window(&self) -> Duration {
        Duration::from_secs(self.association_window_secs)
    }

    pub fn history_time_shift(&self) -> Duration {
        Duration::from_secs(self.history_time_shift_secs)
    }

    pub fn progress_hold(&self) -> Duration {
        Duration::from_millis(self.progress_hold_ms)
    }

    pub fn announcement(&self, phase: &str) -> Option<&str> {
        self.phase_announcements.get(phase).map(String::as_str)
    }
}
