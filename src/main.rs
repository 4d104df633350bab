use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use metaclean_lib::db::History;
use metaclean_lib::downloads::{download_all, epub_baseline, records_from_downloads, wait_for_file, WaitOutcome};
use metaclean_lib::http::HttpClient;
use metaclean_lib::matcher::SearchResult;
use metaclean_lib::naming::format_series_index;
use metaclean_lib::parser::epub::ZipOpener;
use metaclean_lib::prompt::{LogProgress, Prompter, ResultChoice, StallChoice};
use metaclean_lib::scanner::scan_directory;
use metaclean_lib::{Batch, BookRecord, CancelToken, PipelineController, Services, Settings, SweepReport};

#[derive(Parser, Debug)]
#[command(
    name = "metaclean",
    version,
    about = "Clean, re-tag and rename downloaded EPUB files"
)]
struct Cli {
    /// Settings file (JSON); defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose pipeline logging
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every EPUB in a folder
    Process {
        dir: PathBuf,
        /// Do not read or write the processing history
        #[arg(long, action = ArgAction::SetTrue)]
        no_history: bool,
    },
    /// Download EPUBs into a folder, then process them
    Download {
        dir: PathBuf,
        #[arg(required = true)]
        urls: Vec<String>,
        /// Stop after downloading
        #[arg(long, action = ArgAction::SetTrue)]
        download_only: bool,
    },
    /// Wait for a browser download to land in a folder, then process it
    Watch { dir: PathBuf },
    /// Show recently processed books
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

/// Asks questions on stdin. An empty answer leaves the book for later;
/// `q` stops the run after the current step.
struct ConsolePrompter {
    image_search_url: String,
    cancel: CancelToken,
}

impl ConsolePrompter {
    fn new(settings: &Settings, cancel: &CancelToken) -> Self {
        Self {
            image_search_url: settings.image_search_url.clone(),
            cancel: cancel.clone(),
        }
    }

    fn ask(&self, question: &str) -> Option<String> {
        print!("{} ", question);
        std::io::stdout().flush().ok()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).ok()?;
        let line = line.trim().to_string();
        if line.eq_ignore_ascii_case("q") {
            self.cancel.cancel();
            return None;
        }
        (!line.is_empty()).then_some(line)
    }

    fn yes_no(&self, question: &str) -> Option<bool> {
        let answer = self.ask(&format!("{} [y/n]", question))?;
        Some(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

impl Prompter for ConsolePrompter {
    fn choose_result(&self, record: &BookRecord, query: &str, results: &[SearchResult]) -> ResultChoice {
        println!("\nResults for \"{}\" ({}):", query, record.file_name());
        for (position, result) in results.iter().enumerate() {
            println!("  {:>2}. {}", position + 1, result.summary());
        }
        match self.ask("Pick a number, [s]kip, or type a new search (empty = later):") {
            None => ResultChoice::Later,
            Some(answer) if answer.eq_ignore_ascii_case("s") => ResultChoice::Skip,
            Some(answer) => match answer.parse::<usize>() {
                Ok(position) if position >= 1 => ResultChoice::Select(position - 1),
                _ => ResultChoice::ManualSearch(answer),
            },
        }
    }

    fn confirm_skip(&self, record: &BookRecord) -> bool {
        self.yes_no(&format!(
            "Are you sure you want to skip searching for the details of {}?",
            record.display_title()
        ))
        .unwrap_or(false)
    }

    fn manual_search(&self, record: &BookRecord, reason: &str) -> Option<String> {
        println!("\n{} ({})", reason, record.file_name());
        let answer = self.ask("Search for (s = skip, empty = later):")?;
        if answer.eq_ignore_ascii_case("s") {
            return Some(String::new());
        }
        Some(answer)
    }

    fn confirm_cover(&self, record: &BookRecord, candidate: &[u8]) -> Option<bool> {
        let preview = std::env::temp_dir().join(format!("metaclean-cover-{}.img", record.id));
        if let Err(err) = std::fs::write(&preview, candidate) {
            log::warn!("could not write cover preview: {}", err);
        }
        println!(
            "\nCover for {}: {} bytes, preview at {}",
            record.display_title(),
            candidate.len(),
            preview.display()
        );
        self.yes_no("Are you happy with this cover image?")
    }

    fn cover_url(&self, record: &BookRecord, error: Option<&str>) -> Option<String> {
        if let Some(error) = error {
            println!("\n{}", error);
        }
        println!(
            "Search for artwork: {}{}",
            self.image_search_url,
            urlencoding::encode(&format!("{} cover", record.display_title()))
        );
        let answer = self.ask(&format!(
            "Image URL for {} (d = catalogue default, empty = later):",
            record.display_title()
        ))?;
        if answer.eq_ignore_ascii_case("d") {
            return Some(String::new());
        }
        Some(answer)
    }

    fn confirm_overwrite(&self, target: &Path) -> bool {
        self.yes_no(&format!("{} already exists. Overwrite it?", target.display()))
            .unwrap_or(false)
    }

    fn download_stalled(&self, label: &str, waited_secs: u64) -> StallChoice {
        println!("\nDownload May Have Failed! {} has been waiting {}s.", label, waited_secs);
        match self
            .ask("[k]eep waiting, [r]etry or [a]bandon?")
            .map(|answer| answer.to_ascii_lowercase())
            .as_deref()
        {
            Some("r") => StallChoice::Retry,
            Some("a") => StallChoice::Abandon,
            _ => StallChoice::KeepWaiting,
        }
    }
}

fn open_history(settings: &Settings, dir: &Path) -> Result<History> {
    let path = settings
        .history_path
        .clone()
        .unwrap_or_else(|| dir.join(".metaclean").join("history.db"));
    History::open(&path).with_context(|| format!("open history {}", path.display()))
}

fn run_batch(
    batch: Batch,
    settings: Settings,
    history: Option<History>,
    cancel: CancelToken,
) -> Result<SweepReport> {
    let fetcher = HttpClient::new(&settings)?;
    let prompter = ConsolePrompter::new(&settings, &cancel);
    let progress = LogProgress;
    let mut controller = PipelineController::new(
        batch,
        settings,
        Services {
            opener: &ZipOpener,
            fetcher: &fetcher,
            prompter: &prompter,
            progress: &progress,
        },
    )
    .with_cancel_token(cancel);
    if let Some(history) = history {
        controller = controller.with_history(history);
    }

    println!("Answer q at any prompt to stop after the current step.");
    let mut report = controller.sweep();
    while report.pending > 0 && !report.cancelled {
        let again = prompter.yes_no(&format!(
            "{} book(s) are still waiting on you. Go through them again?",
            report.pending
        ));
        if again != Some(true) {
            break;
        }
        report = controller.sweep();
    }
    for record in controller.batch().sorted_by_title() {
        if let Some(diagnostic) = &record.diagnostic {
            println!("  ! {}: {}", record.file_name(), diagnostic);
        }
    }
    let done = controller.take_completed();
    println!(
        "\n{} complete, {} waiting, {} skipped, {} errored{}",
        done.len(),
        report.pending,
        report.skipped,
        report.errored,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(report)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.debug {
        std::env::set_var("METACLEAN_DEBUG", "1");
    }
    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Process { dir, no_history } => {
            let history = if no_history {
                None
            } else {
                Some(open_history(&settings, &dir)?)
            };
            let (batch, stats) = scan_directory(&dir, &ZipOpener, history.as_ref())?;
            if batch.is_empty() {
                return Err(anyhow!("No EPUB files found in {}", dir.display()));
            }
            log::info!("{} book(s) queued ({} unreadable)", stats.added, stats.unreadable);
            run_batch(batch, settings, history, CancelToken::new())?;
        }
        Command::Download {
            dir,
            urls,
            download_only,
        } => {
            std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            let fetcher = HttpClient::new(&settings)?;
            let cancel = CancelToken::new();
            let outcomes = download_all(&urls, &dir, &settings, &fetcher, &cancel);
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(path) => println!("  downloaded {}", path.display()),
                    Err(err) => println!("  ! {}: {}", outcome.url, err),
                }
            }
            if !download_only {
                let batch = records_from_downloads(&outcomes, &ZipOpener);
                if !batch.is_empty() {
                    let history = open_history(&settings, &dir)?;
                    run_batch(batch, settings, Some(history), cancel)?;
                }
            }
        }
        Command::Watch { dir } => {
            let cancel = CancelToken::new();
            let prompter = ConsolePrompter::new(&settings, &cancel);
            let label = dir.display().to_string();
            loop {
                let baseline = epub_baseline(&dir)?;
                println!("Waiting for a new EPUB in {} ...", dir.display());
                match wait_for_file(
                    &dir,
                    &baseline,
                    &label,
                    Duration::from_secs(settings.stall_prompt_secs),
                    Duration::from_secs(1),
                    &prompter,
                    &cancel,
                )? {
                    WaitOutcome::Arrived(path) => {
                        let mut batch = Batch::new();
                        batch.add(metaclean_lib::scanner::scan_file(&path, &ZipOpener))?;
                        let history = open_history(&settings, &dir)?;
                        run_batch(batch, settings, Some(history), cancel)?;
                        break;
                    }
                    WaitOutcome::Retry => continue,
                    WaitOutcome::Abandoned | WaitOutcome::Cancelled => {
                        println!("Stopped waiting.");
                        break;
                    }
                }
            }
        }
        Command::History { limit } => {
            let dir = std::env::current_dir()?;
            let history = open_history(&settings, &dir)?;
            for entry in history.entries(limit)? {
                let series = match (&entry.metadata.series, entry.metadata.series_index) {
                    (Some(series), Some(index)) => format!(" ({}, #{})", series, format_series_index(index)),
                    (Some(series), None) => format!(" ({})", series),
                    _ => String::new(),
                };
                println!(
                    "{}  {}{}  [{}]",
                    entry.processed_at,
                    entry.metadata.title.as_deref().unwrap_or("?"),
                    series,
                    entry.file_name
                );
            }
        }
    }

    Ok(())
}
