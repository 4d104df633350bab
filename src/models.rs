use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MetacleanError, Result};

/// Position of a record in the per-book pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Queued,
    Cleaning,
    SearchingMetadata,
    ResolvingCover,
    SavingMetadata,
    Renaming,
    Complete,
    Skipped,
    Errored,
}

impl Stage {
    pub const ORDER: [Stage; 7] = [
        Stage::Queued,
        Stage::Cleaning,
        Stage::SearchingMetadata,
        Stage::ResolvingCover,
        Stage::SavingMetadata,
        Stage::Renaming,
        Stage::Complete,
    ];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Queued => Some(Stage::Cleaning),
            Stage::Cleaning => Some(Stage::SearchingMetadata),
            Stage::SearchingMetadata => Some(Stage::ResolvingCover),
            Stage::ResolvingCover => Some(Stage::SavingMetadata),
            Stage::SavingMetadata => Some(Stage::Renaming),
            Stage::Renaming => Some(Stage::Complete),
            Stage::Complete | Stage::Skipped | Stage::Errored => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Skipped | Stage::Errored)
    }

    /// Index within [`Stage::ORDER`]; absorbing states have none.
    pub fn ordinal(self) -> Option<usize> {
        Stage::ORDER.iter().position(|stage| *stage == self)
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Queued => "Queued",
            Stage::Cleaning => "Cleaning Book Content",
            Stage::SearchingMetadata => "Searching Metadata",
            Stage::ResolvingCover => "Confirming Cover Image",
            Stage::SavingMetadata => "Updating Book Metadata",
            Stage::Renaming => "Renaming EPUB File",
            Stage::Complete => "Complete",
            Stage::Skipped => "Skipped",
            Stage::Errored => "Errored",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Fields that may be merged into a record. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookPatch {
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
    pub publish_info: Option<String>,
    pub scraped_cover_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    pub id: String, // UUID
    pub source_url: Option<String>,
    pub file_path: PathBuf,
    pub title: Option<String>,
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
    pub publish_info: Option<String>,
    /// Manifest id of the embedded cover; `None` when the EPUB declares none.
    pub cover_id: Option<String>,
    #[serde(skip)]
    pub embedded_cover: Option<Vec<u8>>,
    pub scraped_cover_url: Option<String>,
    #[serde(skip)]
    pub scraped_cover: Option<Vec<u8>>,
    #[serde(skip)]
    pub chosen_cover: Option<Vec<u8>>,
    pub cleaned: bool,
    pub metadata_updated: bool,
    pub requeue: bool,
    pub stage: Stage,
    /// Stage a failed record was in, so a retry resumes there.
    pub failed_stage: Option<Stage>,
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BookRecord {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_url: None,
            file_path: file_path.into(),
            title: None,
            author: None,
            series: None,
            series_index: None,
            publish_info: None,
            cover_id: None,
            embedded_cover: None,
            scraped_cover_url: None,
            scraped_cover: None,
            chosen_cover: None,
            cleaned: false,
            metadata_updated: false,
            requeue: false,
            stage: Stage::Queued,
            failed_stage: None,
            diagnostic: None,
            created_at: Utc::now(),
        }
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn display_title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => self
                .file_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    /// Normalized `title|author` used to recognise the same book across runs.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}",
            normalize_key(&self.display_title()),
            normalize_key(self.author.as_deref().unwrap_or(""))
        )
    }

    pub fn has_cover_entry(&self) -> bool {
        self.cover_id.is_some()
    }

    /// Copies every defined field of `patch` into the record.
    pub fn merge(&mut self, patch: &BookPatch) {
        if let Some(value) = &patch.source_url {
            self.source_url = Some(value.clone());
        }
        if let Some(value) = &patch.title {
            self.title = Some(value.clone());
        }
        if let Some(value) = &patch.author {
            self.author = Some(value.clone());
        }
        if let Some(value) = &patch.series {
            self.series = Some(value.clone());
        }
        if let Some(value) = patch.series_index {
            self.series_index = Some(value);
        }
        if let Some(value) = &patch.publish_info {
            self.publish_info = Some(value.clone());
        }
        if let Some(value) = &patch.scraped_cover_url {
            self.scraped_cover_url = Some(value.clone());
        }
    }

    /// Merges the bibliographic and cover fields another record has set.
    /// Identity (`id`, `file_path`) and pipeline state stay untouched.
    pub fn merge_from(&mut self, other: &BookRecord) {
        self.merge(&BookPatch {
            source_url: other.source_url.clone(),
            title: other.title.clone(),
            author: other.author.clone(),
            series: other.series.clone(),
            series_index: other.series_index,
            publish_info: other.publish_info.clone(),
            scraped_cover_url: other.scraped_cover_url.clone(),
        });
        if other.cover_id.is_some() {
            self.cover_id = other.cover_id.clone();
        }
        if other.embedded_cover.is_some() {
            self.embedded_cover = other.embedded_cover.clone();
        }
        if other.scraped_cover.is_some() {
            self.scraped_cover = other.scraped_cover.clone();
        }
        if other.chosen_cover.is_some() {
            self.chosen_cover = other.chosen_cover.clone();
        }
    }
}

impl PartialEq for BookRecord {
    fn eq(&self, other: &Self) -> bool {
        self.file_path == other.file_path
    }
}

pub fn normalize_key(value: &str) -> String {
    let mut lowered = String::new();
    for ch in value.chars() {
        if ch.is_alphanumeric() {
            lowered.extend(ch.to_lowercase());
        } else {
            lowered.push(' ');
        }
    }
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ordered set of records owned by the active workflow.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<BookRecord>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record. Two records may not share a file path.
    pub fn add(&mut self, record: BookRecord) -> Result<usize> {
        if self.position_of(&record.file_path).is_some() {
            return Err(MetacleanError::FileConflict(record.file_path));
        }
        self.records.push(record);
        Ok(self.records.len() - 1)
    }

    pub fn remove(&mut self, index: usize, delete_file: bool) -> Result<BookRecord> {
        if index >= self.records.len() {
            return Err(MetacleanError::UnknownRecord(index));
        }
        let record = self.records.remove(index);
        if delete_file {
            match std::fs::remove_file(&record.file_path) {
                Ok(()) => log::info!("deleted {}", record.file_path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(MetacleanError::io(&record.file_path, err)),
            }
        }
        Ok(record)
    }

    /// Removes and returns every record matching `predicate`, keeping the
    /// relative order of those left behind.
    pub fn drain_where<F>(&mut self, mut predicate: F) -> Vec<BookRecord>
    where
        F: FnMut(&BookRecord) -> bool,
    {
        let mut taken = vec![];
        let mut kept = Vec::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if predicate(&record) {
                taken.push(record);
            } else {
                kept.push(record);
            }
        }
        self.records = kept;
        taken
    }

    pub fn position_of(&self, path: &Path) -> Option<usize> {
        self.records.iter().position(|record| record.file_path == path)
    }

    pub fn get(&self, index: usize) -> Option<&BookRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BookRecord> {
        self.records.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BookRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Display ordering; storage order is left alone.
    pub fn sorted_by_title(&self) -> Vec<&BookRecord> {
        let mut sorted: Vec<&BookRecord> = self.records.iter().collect();
        sorted.sort_by_key(|record| record.display_title().to_lowercase());
        sorted
    }
}
