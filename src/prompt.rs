use serde::Serialize;

use crate::matcher::SearchResult;
use crate::models::{BookRecord, Stage};

/// Answer to the search-result selection prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultChoice {
    /// Zero-based ordinal into the offered results.
    Select(usize),
    ManualSearch(String),
    Skip,
    /// Leave the record pending and move on.
    Later,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallChoice {
    KeepWaiting,
    Retry,
    Abandon,
}

/// User decisions the pipeline cannot make on its own. Methods returning
/// `Option` answer `None` while the user has not decided yet; the record
/// then stays in its current stage.
pub trait Prompter {
    fn choose_result(&self, record: &BookRecord, query: &str, results: &[SearchResult]) -> ResultChoice;
    fn confirm_skip(&self, record: &BookRecord) -> bool;
    /// Offered when no results were found or the search page could not be read.
    fn manual_search(&self, record: &BookRecord, reason: &str) -> Option<String>;
    fn confirm_cover(&self, record: &BookRecord, candidate: &[u8]) -> Option<bool>;
    fn cover_url(&self, record: &BookRecord, error: Option<&str>) -> Option<String>;
    fn confirm_overwrite(&self, target: &std::path::Path) -> bool;
    fn download_stalled(&self, label: &str, waited_secs: u64) -> StallChoice;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub record_id: String,
    pub stage: Stage,
    pub label: String,
    /// Position of the stage in the fixed order, 0.0 to 1.0.
    pub fraction: f32,
}

impl Progress {
    pub fn for_record(record: &BookRecord) -> Self {
        let steps = (Stage::ORDER.len() - 1) as f32;
        let fraction = match record.stage.ordinal() {
            Some(ordinal) => ordinal as f32 / steps,
            None => 1.0,
        };
        Self {
            record_id: record.id.clone(),
            stage: record.stage,
            label: record.display_title(),
            fraction,
        }
    }
}

pub trait ProgressSink {
    fn report(&self, progress: &Progress);
}

/// Writes progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, progress: &Progress) {
        log::info!(
            "[{:>3.0}%] {}: {}",
            progress.fraction * 100.0,
            progress.stage.label(),
            progress.label
        );
    }
}
