use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::error::{MetacleanError, Result};
use crate::http::Fetch;
use crate::models::{Batch, BookRecord};
use crate::naming::reserve_unique;
use crate::parser::epub::ContainerOpener;
use crate::pipeline::CancelToken;
use crate::prompt::{Prompter, StallChoice};
use crate::scanner::scan_file;

#[derive(Debug)]
pub struct DownloadOutcome {
    pub url: String,
    pub result: Result<PathBuf>,
}

/// `https://site/authors/pdf-epub-mistborn-download/` yields `Mistborn`.
pub fn title_from_url(url: &str) -> Option<String> {
    let slug = url
        .to_lowercase()
        .trim_end_matches('/')
        .rsplit('/')
        .next()?
        .replace("pdf-", "")
        .replace("epub-", "")
        .replace("download", "")
        .replace('-', " ");
    let words: Vec<String> = slug
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

/// Name to save a download under: the server's suggestion with the
/// watermark folder removed, else the last URL segment.
pub fn download_file_name(url: &str, suggested: Option<&str>, watermark: &str) -> String {
    let raw = suggested
        .map(|name| name.replace(&format!("/{}/", watermark), ""))
        .unwrap_or_else(|| {
            url.split('?')
                .next()
                .unwrap_or(url)
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_string()
        });
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    let base = if base.is_empty() {
        title_from_url(url).unwrap_or_else(|| "download".to_string())
    } else {
        base
    };
    if base.to_ascii_lowercase().ends_with(".epub") {
        base
    } else {
        format!("{}.epub", base)
    }
}

fn download_one(
    url: &str,
    dir: &Path,
    settings: &Settings,
    fetcher: &(dyn Fetch + Sync),
    cancel: &CancelToken,
) -> Result<PathBuf> {
    if cancel.is_cancelled() {
        return Err(MetacleanError::Cancelled);
    }
    // Transport retries happen inside the fetcher.
    let response = fetcher.get(url)?;
    if !response.is_success() {
        return Err(MetacleanError::network(
            url,
            format!("server answered {}", response.status),
        ));
    }

    let file_name = download_file_name(url, response.suggested_name.as_deref(), &settings.watermark);
    let target = reserve_unique(dir, &file_name)?;
    let mut partial_name = target.as_os_str().to_os_string();
    partial_name.push(".part");
    let partial = PathBuf::from(partial_name);
    let written = std::fs::write(&partial, &response.body)
        .map_err(|err| MetacleanError::io(&partial, err))
        .and_then(|()| std::fs::rename(&partial, &target).map_err(|err| MetacleanError::io(&target, err)));
    if let Err(err) = written {
        let _ = std::fs::remove_file(&partial);
        let _ = std::fs::remove_file(&target);
        return Err(err);
    }
    log::info!("downloaded {} -> {}", url, target.display());
    Ok(target)
}

/// Downloads every URL into `dir` with at most `max_concurrent_downloads`
/// requests in flight. Outcomes come back in input order.
pub fn download_all(
    urls: &[String],
    dir: &Path,
    settings: &Settings,
    fetcher: &(dyn Fetch + Sync),
    cancel: &CancelToken,
) -> Vec<DownloadOutcome> {
    let queue: Mutex<VecDeque<(usize, String)>> =
        Mutex::new(urls.iter().cloned().enumerate().collect());
    let workers = settings.max_concurrent_downloads.max(1).min(urls.len().max(1));
    let (tx, rx) = mpsc::channel::<(usize, DownloadOutcome)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || loop {
                let next = match queue.lock() {
                    Ok(mut guard) => guard.pop_front(),
                    Err(_) => None,
                };
                let Some((index, url)) = next else {
                    break;
                };
                let result = download_one(&url, dir, settings, fetcher, cancel);
                if let Err(err) = &result {
                    log::warn!("download of {} failed: {}", url, err);
                }
                if tx.send((index, DownloadOutcome { url, result })).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut outcomes: Vec<(usize, DownloadOutcome)> = rx.into_iter().collect();
    outcomes.sort_by_key(|(index, _)| *index);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Turns finished downloads into pipeline records. The listing URL becomes
/// the record's source and, when the EPUB carries no title, its title.
pub fn records_from_downloads(outcomes: &[DownloadOutcome], opener: &dyn ContainerOpener) -> Batch {
    let mut batch = Batch::new();
    for outcome in outcomes {
        let Ok(path) = &outcome.result else {
            continue;
        };
        let mut record = scan_file(path, opener);
        let mut listing = BookRecord::new(path);
        listing.source_url = Some(outcome.url.clone());
        if record.title.is_none() {
            listing.title = title_from_url(&outcome.url);
        }
        record.merge_from(&listing);
        if let Err(err) = batch.add(record) {
            log::warn!("skipping {}: {}", path.display(), err);
        }
    }
    batch
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Arrived(PathBuf),
    Retry,
    Abandoned,
    Cancelled,
}

/// Polls `dir` for a new `.epub` that is not in `baseline`. Every
/// `stall_after` without one, the user is asked whether the download failed.
pub fn wait_for_file(
    dir: &Path,
    baseline: &HashSet<PathBuf>,
    label: &str,
    stall_after: Duration,
    poll_every: Duration,
    prompter: &dyn Prompter,
    cancel: &CancelToken,
) -> Result<WaitOutcome> {
    let started = Instant::now();
    let mut last_prompt = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        if let Some(path) = find_new_epub(dir, baseline)? {
            return Ok(WaitOutcome::Arrived(path));
        }
        if last_prompt.elapsed() >= stall_after {
            match prompter.download_stalled(label, started.elapsed().as_secs()) {
                StallChoice::KeepWaiting => last_prompt = Instant::now(),
                StallChoice::Retry => return Ok(WaitOutcome::Retry),
                StallChoice::Abandon => return Ok(WaitOutcome::Abandoned),
            }
        }
        std::thread::sleep(poll_every);
    }
}

fn find_new_epub(dir: &Path, baseline: &HashSet<PathBuf>) -> Result<Option<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|err| MetacleanError::io(dir, err))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_epub = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("epub"))
            .unwrap_or(false);
        if is_epub && path.is_file() && !baseline.contains(&path) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Snapshot of the `.epub` files already present in `dir`.
pub fn epub_baseline(dir: &Path) -> Result<HashSet<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|err| MetacleanError::io(dir, err))?;
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|value| value.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("epub"))
                .unwrap_or(false)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FetchResponse;
    use crate::parser::epub::fixtures::{write_epub, FixtureBook};
    use crate::parser::epub::ZipOpener;
    use crate::prompt::scripted::ScriptedPrompter;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    /// Thread-safe canned server that tracks how many requests overlap.
    #[derive(Default)]
    struct SlowServer {
        bodies: HashMap<String, Vec<u8>>,
        flaky: Mutex<HashMap<String, u32>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Fetch for SlowServer {
        fn get(&self, url: &str) -> Result<FetchResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(remaining) = self.flaky.lock().unwrap().get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MetacleanError::network(url, "reset by peer"));
                }
            }
            Ok(match self.bodies.get(url) {
                Some(body) => FetchResponse {
                    status: 200,
                    content_type: Some("application/epub+zip".to_string()),
                    suggested_name: Some(format!("/OceanofPDF.com/{}", url.rsplit('/').next().unwrap())),
                    body: body.clone(),
                },
                None => FetchResponse {
                    status: 404,
                    content_type: None,
                    suggested_name: None,
                    body: vec![],
                },
            })
        }
    }

    #[test]
    fn titles_come_from_listing_slugs() {
        assert_eq!(
            title_from_url("https://oceanofpdf.com/authors/brandon-sanderson/pdf-epub-mistborn-the-final-empire-download/").as_deref(),
            Some("Mistborn The Final Empire")
        );
        assert_eq!(title_from_url("https://site.test/"), Some("Site.test".to_string()));
    }

    #[test]
    fn file_names_drop_watermark_folder() {
        assert_eq!(
            download_file_name("https://x.test/dl", Some("/OceanofPDF.com/Mistborn.epub"), "OceanofPDF.com"),
            "Mistborn.epub"
        );
        assert_eq!(
            download_file_name("https://x.test/files/Elantris?token=1", None, "OceanofPDF.com"),
            "Elantris.epub"
        );
    }

    #[test]
    fn downloads_are_bounded_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = SlowServer::default();
        let urls: Vec<String> = (0..6).map(|i| format!("https://dl.test/book{}.epub", i)).collect();
        for url in &urls {
            server.bodies.insert(url.clone(), b"epub".to_vec());
        }
        let settings = Settings {
            max_concurrent_downloads: 2,
            ..Settings::default()
        };

        let outcomes = download_all(&urls, dir.path(), &settings, &server, &CancelToken::new());
        assert_eq!(outcomes.len(), 6);
        assert!(server.peak.load(Ordering::SeqCst) <= 2);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.url, urls[i]);
            let path = outcome.result.as_ref().unwrap();
            assert_eq!(path, &dir.path().join(format!("book{}.epub", i)));
        }
    }

    #[test]
    fn failures_stay_with_their_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = SlowServer::default();
        let url = "https://dl.test/flaky.epub".to_string();
        server.bodies.insert(url.clone(), b"epub".to_vec());
        server.flaky.lock().unwrap().insert(url.clone(), 1);
        let good = "https://dl.test/good.epub".to_string();
        server.bodies.insert(good.clone(), b"epub".to_vec());

        let outcomes = download_all(
            &[url, good],
            dir.path(),
            &Settings::default(),
            &server,
            &CancelToken::new(),
        );
        assert!(matches!(outcomes[0].result, Err(MetacleanError::Network { .. })));
        assert!(outcomes[1].result.is_ok());
        assert!(!dir.path().join("flaky.epub").exists());
    }

    /// Both requests block until the other has arrived, and both offer the
    /// same file name.
    struct TwinServer {
        barrier: Barrier,
    }

    impl Fetch for TwinServer {
        fn get(&self, url: &str) -> Result<FetchResponse> {
            self.barrier.wait();
            Ok(FetchResponse {
                status: 200,
                content_type: Some("application/epub+zip".to_string()),
                suggested_name: Some("/OceanofPDF.com/Book.epub".to_string()),
                body: url.as_bytes().repeat(4096),
            })
        }
    }

    #[test]
    fn concurrent_downloads_with_one_name_keep_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let server = TwinServer {
            barrier: Barrier::new(2),
        };
        let urls = vec![
            "https://dl.test/first".to_string(),
            "https://dl.test/second".to_string(),
        ];
        let settings = Settings {
            max_concurrent_downloads: 2,
            ..Settings::default()
        };

        let outcomes = download_all(&urls, dir.path(), &settings, &server, &CancelToken::new());
        let paths: Vec<PathBuf> = outcomes
            .iter()
            .map(|outcome| outcome.result.as_ref().unwrap().clone())
            .collect();
        assert_ne!(paths[0], paths[1]);
        let mut names: Vec<String> = paths
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Book (1).epub", "Book.epub"]);
        for (url, path) in urls.iter().zip(&paths) {
            assert_eq!(std::fs::read(path).unwrap(), url.as_bytes().repeat(4096));
        }
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 2);
    }

    #[test]
    fn cancelled_queue_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = SlowServer::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcomes = download_all(
            &["https://dl.test/a.epub".to_string()],
            dir.path(),
            &Settings::default(),
            &server,
            &cancel,
        );
        assert!(matches!(outcomes[0].result, Err(MetacleanError::Cancelled)));
        assert_eq!(server.peak.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn downloads_become_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.epub");
        write_epub(&path, &FixtureBook::new("", "Brandon Sanderson"));
        let outcomes = vec![
            DownloadOutcome {
                url: "https://site.test/authors/x/pdf-epub-elantris-download/".to_string(),
                result: Ok(path.clone()),
            },
            DownloadOutcome {
                url: "https://site.test/broken/".to_string(),
                result: Err(MetacleanError::network("https://site.test/broken/", "timeout")),
            },
        ];
        let batch = records_from_downloads(&outcomes, &ZipOpener);
        assert_eq!(batch.len(), 1);
        let record = batch.get(0).unwrap();
        assert_eq!(record.title.as_deref(), Some("Elantris"));
        assert_eq!(record.source_url.as_deref(), Some(outcomes[0].url.as_str()));
    }

    #[test]
    fn waiting_notices_new_files_and_stalls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.epub"), b"x").unwrap();
        let baseline = epub_baseline(dir.path()).unwrap();

        let prompter = ScriptedPrompter::default();
        prompter.stalls.borrow_mut().extend([StallChoice::KeepWaiting, StallChoice::Retry]);
        let outcome = wait_for_file(
            dir.path(),
            &baseline,
            "Mistborn",
            Duration::from_millis(5),
            Duration::from_millis(2),
            &prompter,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Retry);
        assert_eq!(prompter.asked.borrow().len(), 2);

        std::fs::write(dir.path().join("new.epub"), b"x").unwrap();
        let outcome = wait_for_file(
            dir.path(),
            &baseline,
            "Mistborn",
            Duration::from_secs(60),
            Duration::from_millis(2),
            &prompter,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Arrived(dir.path().join("new.epub")));
    }
}
