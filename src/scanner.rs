use std::path::Path;
use walkdir::WalkDir;

use crate::db::History;
use crate::error::{MetacleanError, Result};
use crate::models::{Batch, BookRecord, Stage};
use crate::parser::epub::ContainerOpener;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub added: u64,
    pub unreadable: u64,
    pub previously_processed: u64,
}

/// Builds a record for one EPUB, pulling embedded metadata and the cover
/// entry from the container. An unreadable file yields an `Errored` record;
/// the file itself is left alone.
pub fn scan_file(path: &Path, opener: &dyn ContainerOpener) -> BookRecord {
    let mut record = BookRecord::new(path);
    let container = match opener.open(path) {
        Ok(container) => container,
        Err(err) => {
            log::warn!("cannot open {}: {}", path.display(), err);
            record.failed_stage = Some(Stage::Queued);
            record.stage = Stage::Errored;
            record.diagnostic = Some(err.to_string());
            return record;
        }
    };

    let metadata = container.read_metadata();
    record.title = metadata.title.filter(|value| !value.trim().is_empty());
    record.author = metadata.author.filter(|value| !value.trim().is_empty());
    record.series = metadata.series;
    record.series_index = metadata.series_index;
    record.publish_info = metadata.publish_info;

    record.cover_id = container.cover_manifest_id();
    if let Some(cover_id) = record.cover_id.as_deref() {
        match container.read_item(cover_id) {
            Ok(bytes) if !bytes.is_empty() => record.embedded_cover = Some(bytes),
            Ok(_) => {}
            Err(err) => log::warn!("cover {} unreadable in {}: {}", cover_id, path.display(), err),
        }
    }
    record
}

/// History lookups never fail a scan; a broken store just means nothing
/// counts as seen.
fn seen_before(history: &History, record: &BookRecord) -> bool {
    let by_key = history.contains(&record.dedup_key()).unwrap_or_else(|err| {
        log::warn!("history lookup for {} failed: {}", record.file_name(), err);
        false
    });
    by_key
        || history.contains_file(&record.file_path).unwrap_or_else(|err| {
            log::warn!("history hash lookup for {} failed: {}", record.file_name(), err);
            false
        })
}

/// Collects the `.epub` files directly inside `dir` into a batch, in file
/// name order. Books found in `history` are marked as already matched.
pub fn scan_directory(
    dir: &Path,
    opener: &dyn ContainerOpener,
    history: Option<&History>,
) -> Result<(Batch, ScanStats)> {
    if !dir.is_dir() {
        return Err(MetacleanError::Config(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut batch = Batch::new();
    let mut stats = ScanStats::default();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter();

    for entry in walker.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_lowercase();
        if ext != "epub" {
            continue;
        }

        let mut record = scan_file(path, opener);
        if record.stage == Stage::Errored {
            stats.unreadable += 1;
        } else if let Some(history) = history {
            if seen_before(history, &record) {
                log::info!("{} was processed before; metadata search will be skipped", record.file_name());
                record.metadata_updated = true;
                stats.previously_processed += 1;
            }
        }
        batch.add(record)?;
        stats.added += 1;
    }

    log::info!(
        "scan of {} finished: added={} unreadable={} previously_processed={}",
        dir.display(),
        stats.added,
        stats.unreadable,
        stats.previously_processed
    );
    Ok((batch, stats))
}
