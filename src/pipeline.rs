use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cleaner::strip_watermark;
use crate::config::{pipeline_debug_enabled, Settings};
use crate::cover::{CoverFormat, CoverResolver, CoverState};
use crate::db::History;
use crate::error::{MetacleanError, Result};
use crate::http::Fetch;
use crate::matcher::{build_query, parse_book_page, parse_search_results, SearchQuery, SearchResult};
use crate::models::{Batch, BookRecord, Stage};
use crate::naming::{canonical_file_name, rename_to, RenameOutcome};
use crate::parser::epub::{ContainerOpener, EpubMetadata};
use crate::prompt::{Progress, ProgressSink, Prompter, ResultChoice};

/// Shared cancellation flag, checked between stages and before blocking calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one [`PipelineController::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The record moved to this stage.
    Advanced(Stage),
    /// Waiting on the user; the record keeps its stage.
    Pending,
    /// The record was already terminal.
    Finished(Stage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub complete: usize,
    pub pending: usize,
    pub skipped: usize,
    pub errored: usize,
    pub cancelled: bool,
}

/// Collaborators the controller calls out to.
pub struct Services<'a> {
    pub opener: &'a dyn ContainerOpener,
    pub fetcher: &'a dyn Fetch,
    pub prompter: &'a dyn Prompter,
    pub progress: &'a dyn ProgressSink,
}

enum Step {
    Done,
    JumpTo(Stage),
    Pending,
}

pub struct PipelineController<'a> {
    batch: Batch,
    settings: Settings,
    services: Services<'a>,
    history: Option<History>,
    cancel: CancelToken,
    queries: HashMap<String, SearchQuery>,
    resolvers: HashMap<String, CoverResolver>,
}

impl<'a> PipelineController<'a> {
    pub fn new(batch: Batch, settings: Settings, services: Services<'a>) -> Self {
        Self {
            batch,
            settings,
            services,
            history: None,
            cancel: CancelToken::new(),
            queries: HashMap::new(),
            resolvers: HashMap::new(),
        }
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn cancel(&self) {
        log::info!("cancel requested; stopping after the current stage");
        self.cancel.cancel();
    }

    fn record(&self, index: usize) -> Result<&BookRecord> {
        self.batch
            .get(index)
            .ok_or(MetacleanError::UnknownRecord(index))
    }

    fn record_mut(&mut self, index: usize) -> Result<&mut BookRecord> {
        self.batch
            .get_mut(index)
            .ok_or(MetacleanError::UnknownRecord(index))
    }

    fn report(&self, index: usize) {
        if let Some(record) = self.batch.get(index) {
            self.services.progress.report(&Progress::for_record(record));
        }
    }

    fn debug(&self, record: &BookRecord, message: &str) {
        if pipeline_debug_enabled() {
            log::info!(
                "[pipeline-debug] id={} stage={:?} file={} {}",
                record.id,
                record.stage,
                record.file_name(),
                message
            );
        }
    }

    /// Performs the work of the record's current stage and moves it on.
    pub fn advance(&mut self, index: usize) -> Result<Advance> {
        if self.cancel.is_cancelled() {
            return Err(MetacleanError::Cancelled);
        }
        let stage = self.record(index)?.stage;
        if stage.is_terminal() {
            return Ok(Advance::Finished(stage));
        }
        self.report(index);

        let step = match stage {
            Stage::Queued => Ok(Step::Done),
            Stage::Cleaning => self.clean(index),
            Stage::SearchingMetadata => self.search(index),
            Stage::ResolvingCover => self.resolve_cover(index),
            Stage::SavingMetadata => self.save_metadata(index),
            Stage::Renaming => self.rename(index),
            Stage::Complete | Stage::Skipped | Stage::Errored => return Ok(Advance::Finished(stage)),
        };

        let next = match step {
            Ok(Step::Pending) => {
                self.debug(self.record(index)?, "waiting on user input");
                return Ok(Advance::Pending);
            }
            Ok(Step::Done) => stage.next().unwrap_or(Stage::Complete),
            Ok(Step::JumpTo(target)) => target,
            Err(MetacleanError::Cancelled) => return Err(MetacleanError::Cancelled),
            Err(err) => {
                let record = self.record_mut(index)?;
                log::warn!(
                    "record {} ({}) failed at {:?}: {}",
                    record.id,
                    record.file_name(),
                    stage,
                    err
                );
                record.failed_stage = Some(stage);
                record.diagnostic = Some(err.to_string());
                record.stage = Stage::Errored;
                self.report(index);
                return Ok(Advance::Advanced(Stage::Errored));
            }
        };

        self.record_mut(index)?.stage = next;
        if next == Stage::Complete {
            self.on_complete(index)?;
        }
        self.report(index);
        Ok(Advance::Advanced(next))
    }

    /// Runs every non-terminal record as far as it can go without user input.
    pub fn sweep(&mut self) -> SweepReport {
        let mut report = SweepReport::default();

        for index in 0..self.batch.len() {
            if let Some(record) = self.batch.get_mut(index) {
                if record.stage == Stage::Complete && record.requeue {
                    log::info!("requeueing {}", record.file_name());
                    record.requeue = false;
                    record.metadata_updated = false;
                    record.scraped_cover_url = None;
                    record.scraped_cover = None;
                    record.chosen_cover = None;
                    record.stage = Stage::SearchingMetadata;
                }
            }
        }

        'records: for index in 0..self.batch.len() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            loop {
                match self.advance(index) {
                    Ok(Advance::Advanced(_)) => continue,
                    Ok(Advance::Pending) | Ok(Advance::Finished(_)) => break,
                    Err(MetacleanError::Cancelled) => {
                        report.cancelled = true;
                        break 'records;
                    }
                    Err(err) => {
                        log::error!("sweep stopped on record {}: {}", index, err);
                        break;
                    }
                }
            }
        }

        for record in self.batch.iter() {
            match record.stage {
                Stage::Complete => report.complete += 1,
                Stage::Skipped => report.skipped += 1,
                Stage::Errored => report.errored += 1,
                _ => report.pending += 1,
            }
        }
        log::info!(
            "sweep finished: complete={} pending={} skipped={} errored={} cancelled={}",
            report.complete,
            report.pending,
            report.skipped,
            report.errored,
            report.cancelled
        );
        report
    }

    /// Explicit user skip of a whole record.
    pub fn skip(&mut self, index: usize) -> Result<()> {
        let record = self.record_mut(index)?;
        if record.stage.is_terminal() {
            return Ok(());
        }
        record.stage = Stage::Skipped;
        let id = record.id.clone();
        self.resolvers.remove(&id);
        self.queries.remove(&id);
        self.report(index);
        Ok(())
    }

    /// Puts an errored record back into the stage it failed in.
    pub fn retry(&mut self, index: usize) -> Result<bool> {
        let record = self.record_mut(index)?;
        if record.stage != Stage::Errored {
            return Ok(false);
        }
        record.stage = record.failed_stage.take().unwrap_or(Stage::Queued);
        record.diagnostic = None;
        Ok(true)
    }

    /// Flags a completed record for another metadata pass on the next sweep.
    pub fn requeue(&mut self, index: usize) -> Result<bool> {
        let record = self.record_mut(index)?;
        if record.stage != Stage::Complete {
            return Ok(false);
        }
        record.requeue = true;
        Ok(true)
    }

    /// Hands completed records off, removing them from the batch.
    pub fn take_completed(&mut self) -> Vec<BookRecord> {
        self.batch
            .drain_where(|record| record.stage == Stage::Complete && !record.requeue)
    }

    fn clean(&mut self, index: usize) -> Result<Step> {
        let record = self.record(index)?;
        if record.cleaned {
            self.debug(record, "already cleaned");
            return Ok(Step::Done);
        }
        let mut container = self.services.opener.open(&record.file_path)?;
        strip_watermark(container.as_mut(), &self.settings.watermark)?;
        self.record_mut(index)?.cleaned = true;
        Ok(Step::Done)
    }

    fn fetch_results(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let url = self.settings.search_url(&query.query);
        let response = self.services.fetcher.get(&url)?;
        if !response.is_success() {
            return Err(MetacleanError::network(
                &url,
                format!("server answered {}", response.status),
            ));
        }
        parse_search_results(&response.text())
    }

    fn search(&mut self, index: usize) -> Result<Step> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(MetacleanError::Cancelled);
            }
            let record = self.record(index)?;
            if record.metadata_updated {
                self.debug(record, "metadata already settled");
                return Ok(Step::JumpTo(Stage::SavingMetadata));
            }

            let query = match self.queries.get(&record.id) {
                Some(query) => query.clone(),
                None => build_query(&record.file_name(), &self.settings.watermark),
            };
            self.debug(record, &format!("searching for {:?}", query.display));

            let manual_reason = match self.fetch_results(&query) {
                Ok(results) if !results.is_empty() => {
                    let record = self.record(index)?;
                    match self.services.prompter.choose_result(record, &query.display, &results) {
                        ResultChoice::Select(choice) => match results.get(choice) {
                            Some(result) => {
                                self.apply_result(index, result)?;
                                return Ok(Step::Done);
                            }
                            None => {
                                log::warn!("result {} is out of range ({} offered)", choice, results.len());
                                return Ok(Step::Pending);
                            }
                        },
                        ResultChoice::ManualSearch(term) => {
                            self.set_query(index, &term)?;
                            continue;
                        }
                        ResultChoice::Skip => return self.skip_search(index),
                        ResultChoice::Later => return Ok(Step::Pending),
                    }
                }
                Ok(_) => format!("No results were found for \"{}\".", query.display),
                Err(err @ (MetacleanError::Parse { .. } | MetacleanError::Network { .. })) => {
                    log::warn!("search for {:?} failed: {}", query.display, err);
                    err.to_string()
                }
                Err(err) => return Err(err),
            };

            let record = self.record(index)?;
            match self.services.prompter.manual_search(record, &manual_reason) {
                Some(term) if !term.trim().is_empty() => self.set_query(index, &term)?,
                Some(_) => return self.skip_search(index),
                None => return Ok(Step::Pending),
            }
        }
    }

    fn set_query(&mut self, index: usize, term: &str) -> Result<()> {
        let query = build_query(term, &self.settings.watermark);
        let id = self.record(index)?.id.clone();
        self.queries.insert(id, query);
        Ok(())
    }

    fn skip_search(&mut self, index: usize) -> Result<Step> {
        let record = self.record(index)?;
        if !self.services.prompter.confirm_skip(record) {
            return Ok(Step::Pending);
        }
        log::info!("metadata search skipped for {}", record.file_name());
        let id = record.id.clone();
        self.queries.remove(&id);
        self.record_mut(index)?.metadata_updated = true;
        Ok(Step::JumpTo(Stage::SavingMetadata))
    }

    fn apply_result(&mut self, index: usize, result: &SearchResult) -> Result<()> {
        let has_cover_entry = self.record(index)?.has_cover_entry();
        let book_url = result
            .book_href
            .as_deref()
            .map(|href| self.settings.absolute_url(href))
            .or_else(|| {
                result
                    .catalogue_id
                    .as_deref()
                    .map(|id| self.settings.absolute_url(&format!("/book/show/{}", id)))
            });

        let mut page_patch = None;
        let mut scraped_cover = None;
        if let (true, Some(book_url)) = (has_cover_entry, book_url.as_deref()) {
            match self.fetch_book_page(book_url) {
                Ok(page) => {
                    scraped_cover = self.fetch_cover_bytes(&page.cover_url);
                    page_patch = Some(page.to_patch());
                }
                Err(err) => log::warn!("book page {} unusable: {}", book_url, err),
            }
        }

        let record = self.record_mut(index)?;
        let mut patch = result.to_patch();
        patch.source_url = book_url;
        record.merge(&patch);
        record.scraped_cover_url = None;
        if let Some(page_patch) = page_patch {
            record.publish_info = page_patch.publish_info.or(record.publish_info.take());
            record.scraped_cover_url = page_patch.scraped_cover_url;
        }
        record.scraped_cover = scraped_cover;
        let id = record.id.clone();
        self.queries.remove(&id);
        self.resolvers.remove(&id);
        Ok(())
    }

    fn fetch_book_page(&self, url: &str) -> Result<crate::matcher::BookPage> {
        if self.cancel.is_cancelled() {
            return Err(MetacleanError::Cancelled);
        }
        let response = self.services.fetcher.get(url)?;
        if !response.is_success() {
            return Err(MetacleanError::network(url, format!("server answered {}", response.status)));
        }
        parse_book_page(&response.text())
    }

    fn fetch_cover_bytes(&self, url: &str) -> Option<Vec<u8>> {
        match self.services.fetcher.get(url) {
            Ok(response) if response.is_success() && !response.body.is_empty() => Some(response.body),
            Ok(response) => {
                log::warn!("cover {} answered {}", url, response.status);
                None
            }
            Err(err) => {
                log::warn!("cover {} unreachable: {}", url, err);
                None
            }
        }
    }

    fn resolve_cover(&mut self, index: usize) -> Result<Step> {
        let record = self.record(index)?;
        let id = record.id.clone();
        if !self.resolvers.contains_key(&id) {
            // The scraped cover is offered first; the embedded one only when
            // the catalogue gave no cover at all.
            let candidate = if record.scraped_cover_url.is_some() {
                record.scraped_cover.clone()
            } else {
                record.embedded_cover.clone()
            };
            let default_url = record
                .scraped_cover_url
                .clone()
                .or_else(|| Some(self.settings.default_cover_url.clone()));
            let resolver = CoverResolver::new(
                record.has_cover_entry(),
                candidate,
                default_url,
                CoverFormat::from_settings(&self.settings),
            );
            self.resolvers.insert(id.clone(), resolver);
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(MetacleanError::Cancelled);
            }
            let Some(resolver) = self.resolvers.get_mut(&id) else {
                return Ok(Step::Pending);
            };
            if resolver.is_terminal() {
                let image = resolver.accepted().map(<[u8]>::to_vec);
                self.resolvers.remove(&id);
                if let Some(image) = image {
                    self.record_mut(index)?.chosen_cover = Some(image);
                }
                return Ok(Step::Done);
            }
            let record = self
                .batch
                .get(index)
                .ok_or(MetacleanError::UnknownRecord(index))?;
            match resolver.state().clone() {
                CoverState::NoCoverPossible | CoverState::Accepted { .. } => {}
                CoverState::AwaitingConfirmation { candidate } => {
                    match self.services.prompter.confirm_cover(record, &candidate) {
                        Some(true) => resolver.confirm(),
                        Some(false) => resolver.reject(),
                        None => return Ok(Step::Pending),
                    }
                }
                CoverState::AwaitingUserUrl { error } => {
                    match self.services.prompter.cover_url(record, error.as_deref()) {
                        Some(url) => resolver.submit_url(&url, self.services.fetcher),
                        None => return Ok(Step::Pending),
                    }
                }
            }
        }
    }

    fn save_metadata(&mut self, index: usize) -> Result<Step> {
        let record = self.record(index)?;
        let mut container = self.services.opener.open(&record.file_path)?;
        container.write_metadata(&EpubMetadata {
            title: Some(record.display_title()),
            author: record.author.clone(),
            series: record.series.clone(),
            series_index: record.series_index,
            publish_info: record.publish_info.clone(),
        })?;
        if let (Some(cover), Some(cover_id)) = (&record.chosen_cover, &record.cover_id) {
            container.write_item(cover_id, cover)?;
        }
        container.save()?;
        self.debug(record, "metadata written");
        self.record_mut(index)?.metadata_updated = true;
        Ok(Step::Done)
    }

    fn rename(&mut self, index: usize) -> Result<Step> {
        let record = self.record(index)?;
        let file_name = canonical_file_name(record);
        let current = record.file_path.clone();
        let batch = &self.batch;
        let prompter = self.services.prompter;
        let confirm = |target: &std::path::Path| {
            batch.position_of(target).is_none() && prompter.confirm_overwrite(target)
        };
        let outcome = rename_to(&current, &file_name, &confirm)?;
        if matches!(outcome, RenameOutcome::Unchanged(_)) {
            self.debug(self.record(index)?, "already renamed");
        }
        self.record_mut(index)?.file_path = outcome.path().to_path_buf();
        Ok(Step::Done)
    }

    fn on_complete(&mut self, index: usize) -> Result<()> {
        let record = self.record(index)?;
        log::info!("completed {}", record.file_name());
        if let Some(history) = &self.history {
            if let Err(err) = history.record(record) {
                log::warn!("could not record history for {}: {}", record.file_name(), err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fake::FakeFetch;
    use crate::parser::epub::fixtures::{tiny_png, write_epub, FixtureBook};
    use crate::parser::epub::{EpubBook, EpubContainer, ZipOpener};
    use crate::prompt::scripted::{RecordingSink, ScriptedPrompter};
    use crate::scanner::scan_directory;
    use std::path::Path;

    const CATALOGUE: &str = "https://catalogue.test";

    fn settings() -> Settings {
        Settings {
            catalogue_url: CATALOGUE.to_string(),
            cover_width: 8,
            cover_height: 12,
            ..Settings::default()
        }
    }

    fn results_page(id: &str, title: &str, author: &str) -> String {
        format!(
            r#"<table><tr itemscope><td>
                <a class="bookTitle" href="/book/show/{id}"><span>{title}</span></a>
                <a class="authorName"><span>{author}</span></a>
            </td></tr></table>"#
        )
    }

    fn book_page(cover_url: &str) -> String {
        format!(r#"<div class="BookCover__image"><img src="{cover_url}"></div>"#)
    }

    fn add_book(fetch: FakeFetch, query: &str, id: &str, title: &str, author: &str, cover: &str) -> FakeFetch {
        fetch
            .page(&format!("{}/search?q={}", CATALOGUE, query), &results_page(id, title, author))
            .page(&format!("{}/book/show/{}", CATALOGUE, id), &book_page(cover))
    }

    fn epub(dir: &Path, file_name: &str, title: &str, author: &str) {
        let mut book = FixtureBook::new(title, author);
        book.pages = vec![("ch1", "<p>OceanofPDF.com</p><p>Once upon a time</p>".to_string())];
        book.cover = Some(tiny_png());
        write_epub(&dir.join(file_name), &book);
    }

    fn visited(sink: &RecordingSink, id: &str) -> Vec<Stage> {
        let mut stages: Vec<Stage> = Vec::new();
        for (record_id, stage) in sink.events.borrow().iter() {
            if record_id == id && stages.last() != Some(stage) {
                stages.push(*stage);
            }
        }
        stages
    }

    fn is_ordered(stages: &[Stage]) -> bool {
        let ordinals: Vec<usize> = stages.iter().filter_map(|stage| stage.ordinal()).collect();
        ordinals.windows(2).all(|pair| pair[0] < pair[1])
    }

    #[test]
    fn one_missing_cover_does_not_hold_up_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "Elantris.epub", "Elantris", "Brandon Sanderson");
        epub(dir.path(), "Warbreaker.epub", "Warbreaker", "Brandon Sanderson");
        epub(
            dir.path(),
            "_OceanofPDF.com_Mistborn-(Mistborn,-1)_Brandon-Sanderson.epub",
            "Mistborn",
            "Brandon Sanderson",
        );

        let fetch = FakeFetch::default().bytes("https://img.test/ok.png", tiny_png());
        let fetch = add_book(fetch, "Elantris", "68429", "Elantris", "Brandon Sanderson", "https://img.test/ok.png");
        let fetch = add_book(
            fetch,
            "Warbreaker",
            "1268479",
            "Warbreaker (Warbreaker, #1)",
            "Brandon Sanderson",
            "https://img.test/missing.jpg",
        );
        let fetch = add_book(
            fetch,
            "Mistborn+Mistborn+1+Brandon+Sanderson",
            "68428",
            "Mistborn (Mistborn, #1)",
            "Brandon Sanderson",
            "https://img.test/ok.png",
        );

        let prompter = ScriptedPrompter::default();
        let sink = RecordingSink::default();
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );

        let report = controller.sweep();
        assert_eq!(report.complete, 2);
        assert_eq!(report.pending, 1);
        assert_eq!(report.errored, 0);

        let stages: Vec<Stage> = controller.batch().iter().map(|record| record.stage).collect();
        assert_eq!(stages, vec![Stage::Complete, Stage::ResolvingCover, Stage::Complete]);

        let mistborn = controller.batch().get(2).unwrap();
        assert_eq!(mistborn.title.as_deref(), Some("Mistborn"));
        assert_eq!(mistborn.author.as_deref(), Some("Brandon Sanderson"));
        assert_eq!(mistborn.series.as_deref(), Some("Mistborn"));
        assert_eq!(mistborn.series_index, Some(1.0));
        assert_eq!(
            mistborn.file_path,
            dir.path().join("Mistborn (Mistborn, #1) - Brandon Sanderson.epub")
        );

        let saved = EpubBook::open(&mistborn.file_path).unwrap();
        assert_eq!(saved.read_metadata().series.as_deref(), Some("Mistborn"));
        assert!(!saved.read_page("ch1").unwrap().contains("OceanofPDF.com"));
        let cover = saved.read_item("cover-img").unwrap();
        assert_eq!(image::guess_format(&cover).unwrap(), image::ImageFormat::Jpeg);

        for record in controller.batch().iter() {
            assert!(is_ordered(&visited(&sink, &record.id)), "{:?}", visited(&sink, &record.id));
        }

        // The user now supplies a working URL for the stuck record.
        prompter
            .urls
            .borrow_mut()
            .push_back(Some("https://img.test/ok.png".to_string()));
        let report = controller.sweep();
        assert_eq!(report.complete, 3);
        assert!(dir
            .path()
            .join("Warbreaker (Warbreaker, #1) - Brandon Sanderson.epub")
            .exists());
    }

    #[test]
    fn skipping_search_keeps_embedded_fields() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "download.epub", "Elantris", "Brandon Sanderson");
        let fetch = add_book(FakeFetch::default(), "download", "1", "Wrong Book", "Somebody", "https://img.test/x.png");
        let prompter = ScriptedPrompter::default();
        prompter.choices.borrow_mut().push_back(ResultChoice::Skip);
        let sink = RecordingSink::default();
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );

        controller.sweep();
        let record = controller.batch().get(0).unwrap();
        assert_eq!(record.stage, Stage::Complete);
        assert!(record.metadata_updated);
        assert_eq!(record.title.as_deref(), Some("Elantris"));
        assert!(record.chosen_cover.is_none());
        assert_eq!(record.file_name(), "Elantris - Brandon Sanderson.epub");
        assert!(!visited(&sink, &record.id).contains(&Stage::ResolvingCover));
    }

    #[test]
    fn requeue_searches_again_without_recleaning() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "Elantris.epub", "Elantris", "Brandon Sanderson");
        let fetch = FakeFetch::default().bytes("https://img.test/ok.png", tiny_png());
        let fetch = add_book(fetch, "Elantris", "68429", "Elantris", "Brandon Sanderson", "https://img.test/ok.png");
        let fetch = add_book(
            fetch,
            "Elantris+Brandon+Sanderson",
            "68429",
            "Elantris",
            "Brandon Sanderson",
            "https://img.test/ok.png",
        );
        let prompter = ScriptedPrompter::default();
        let sink = RecordingSink::default();
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );

        assert_eq!(controller.sweep().complete, 1);
        let id = controller.batch().get(0).unwrap().id.clone();
        assert!(controller.requeue(0).unwrap());
        sink.events.borrow_mut().clear();

        assert_eq!(controller.sweep().complete, 1);
        let stages = visited(&sink, &id);
        assert_eq!(stages.first(), Some(&Stage::SearchingMetadata));
        assert!(!stages.contains(&Stage::Cleaning));
        let choose_prompts = prompter
            .asked
            .borrow()
            .iter()
            .filter(|entry| entry.starts_with("choose:"))
            .count();
        assert_eq!(choose_prompts, 2);
        assert!(controller.batch().get(0).unwrap().cleaned);
    }

    #[test]
    fn errors_are_isolated_and_retryable() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "a.epub", "A", "Author");
        epub(dir.path(), "b.epub", "B", "Author");
        let prompter = ScriptedPrompter::default();
        prompter.choices.borrow_mut().extend([ResultChoice::Skip, ResultChoice::Skip]);
        let sink = RecordingSink::default();
        let fetch = add_book(FakeFetch::default(), "a", "1", "A", "Author", "https://img.test/x.png");
        let fetch = add_book(fetch, "b", "2", "B", "Author", "https://img.test/x.png");
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );

        let original = std::fs::read(dir.path().join("a.epub")).unwrap();
        std::fs::write(dir.path().join("a.epub"), b"truncated").unwrap();

        let report = controller.sweep();
        assert_eq!(report.errored, 1);
        assert_eq!(report.complete, 1);
        let failed = controller.batch().get(0).unwrap();
        assert_eq!(failed.stage, Stage::Errored);
        assert_eq!(failed.failed_stage, Some(Stage::Cleaning));
        assert!(failed.diagnostic.is_some());
        assert_eq!(std::fs::read(dir.path().join("a.epub")).unwrap(), b"truncated");

        std::fs::write(dir.path().join("a.epub"), original).unwrap();
        assert!(controller.retry(0).unwrap());
        assert_eq!(controller.batch().get(0).unwrap().stage, Stage::Cleaning);
        assert_eq!(controller.sweep().complete, 2);
    }

    #[test]
    fn unreadable_search_page_waits_for_manual_search() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "Elantris.epub", "Elantris", "Brandon Sanderson");
        let fetch = FakeFetch::default().page(
            &format!("{}/search?q=Elantris", CATALOGUE),
            r#"<table><tr><td><a class="bookTitle" href="/book/show/1">Elantris</a></td></tr></table>"#,
        );
        let prompter = ScriptedPrompter::default();
        let sink = RecordingSink::default();
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );

        let report = controller.sweep();
        assert_eq!(report.pending, 1);
        assert_eq!(controller.batch().get(0).unwrap().stage, Stage::SearchingMetadata);
        assert!(prompter.asked.borrow().iter().any(|entry| entry.starts_with("manual:")));
    }

    #[test]
    fn cancel_stops_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "Elantris.epub", "Elantris", "Brandon Sanderson");
        let fetch = FakeFetch::default();
        let prompter = ScriptedPrompter::default();
        let sink = RecordingSink::default();
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );

        controller.cancel();
        let report = controller.sweep();
        assert!(report.cancelled);
        assert_eq!(controller.batch().get(0).unwrap().stage, Stage::Queued);
        assert!(sink.events.borrow().is_empty());
        assert!(matches!(controller.advance(0), Err(MetacleanError::Cancelled)));
    }

    /// Pulls the shared cancel flag once a given record enters a given stage.
    struct CancelAt {
        cancel: CancelToken,
        record_id: String,
        stage: Stage,
        inner: RecordingSink,
    }

    impl ProgressSink for CancelAt {
        fn report(&self, progress: &Progress) {
            self.inner.report(progress);
            if progress.record_id == self.record_id && progress.stage == self.stage {
                self.cancel.cancel();
            }
        }
    }

    #[test]
    fn cancel_mid_batch_leaves_records_where_they_are() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "Elantris.epub", "Elantris", "Brandon Sanderson");
        epub(dir.path(), "Mistborn.epub", "Mistborn", "Brandon Sanderson");
        epub(dir.path(), "Warbreaker.epub", "Warbreaker", "Brandon Sanderson");
        let fetch = FakeFetch::default().bytes("https://img.test/ok.png", tiny_png());
        let fetch = add_book(fetch, "Elantris", "1", "Elantris", "Brandon Sanderson", "https://img.test/ok.png");
        let fetch = add_book(fetch, "Mistborn", "2", "Mistborn", "Brandon Sanderson", "https://img.test/ok.png");
        let fetch = add_book(fetch, "Warbreaker", "3", "Warbreaker", "Brandon Sanderson", "https://img.test/ok.png");

        let prompter = ScriptedPrompter::default();
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let cancel = CancelToken::new();
        let sink = CancelAt {
            cancel: cancel.clone(),
            record_id: batch.get(1).unwrap().id.clone(),
            stage: Stage::ResolvingCover,
            inner: RecordingSink::default(),
        };
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        )
        .with_cancel_token(cancel);

        let report = controller.sweep();
        assert!(report.cancelled);
        let stages: Vec<Stage> = controller.batch().iter().map(|record| record.stage).collect();
        assert_eq!(stages, vec![Stage::Complete, Stage::ResolvingCover, Stage::Queued]);

        let elantris = controller.batch().get(0).unwrap();
        assert_eq!(elantris.file_path, dir.path().join("Elantris - Brandon Sanderson.epub"));
        assert!(elantris.file_path.exists());
        let mistborn = controller.batch().get(1).unwrap();
        assert!(mistborn.cleaned);
        assert_eq!(mistborn.file_path, dir.path().join("Mistborn.epub"));
        assert!(mistborn.diagnostic.is_none());
        assert!(!prompter.asked.borrow().iter().any(|entry| entry == "cover:Mistborn"));
        let warbreaker = controller.batch().get(2).unwrap().id.clone();
        assert!(visited(&sink.inner, &warbreaker).is_empty());

        assert!(matches!(controller.advance(2), Err(MetacleanError::Cancelled)));
    }

    #[test]
    fn unknown_positions_are_reported_as_such() {
        let fetch = FakeFetch::default();
        let prompter = ScriptedPrompter::default();
        let sink = RecordingSink::default();
        let mut controller = PipelineController::new(
            Batch::new(),
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        );
        assert!(matches!(controller.advance(3), Err(MetacleanError::UnknownRecord(3))));
        assert!(matches!(controller.skip(0), Err(MetacleanError::UnknownRecord(0))));
    }

    #[test]
    fn skipped_and_completed_records_are_handled_separately() {
        let dir = tempfile::tempdir().unwrap();
        epub(dir.path(), "a.epub", "A", "Author");
        epub(dir.path(), "b.epub", "B", "Author");
        let prompter = ScriptedPrompter::default();
        prompter.choices.borrow_mut().push_back(ResultChoice::Skip);
        let sink = RecordingSink::default();
        let fetch = add_book(FakeFetch::default(), "b", "2", "B", "Author", "https://img.test/x.png");
        let (batch, _) = scan_directory(dir.path(), &ZipOpener, None).unwrap();
        let history = History::in_memory().unwrap();
        let mut controller = PipelineController::new(
            batch,
            settings(),
            Services {
                opener: &ZipOpener,
                fetcher: &fetch,
                prompter: &prompter,
                progress: &sink,
            },
        )
        .with_history(history);

        controller.skip(0).unwrap();
        let report = controller.sweep();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.complete, 1);

        let handed_off = controller.take_completed();
        assert_eq!(handed_off.len(), 1);
        assert_eq!(handed_off[0].file_name(), "B - Author.epub");
        assert_eq!(controller.batch().len(), 1);
        assert_eq!(controller.batch().get(0).unwrap().stage, Stage::Skipped);
        let history = controller.history.as_ref().unwrap();
        assert!(history.contains(&handed_off[0].dedup_key()).unwrap());
    }
}
