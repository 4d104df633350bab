//! Cleans downloaded EPUB files, matches them against an online catalogue,
//! confirms a cover, writes the metadata back and renames the file.

pub mod cleaner;
pub mod config;
pub mod cover;
pub mod db;
pub mod downloads;
pub mod error;
pub mod http;
pub mod matcher;
pub mod models;
pub mod naming;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod scanner;

pub use config::Settings;
pub use error::{MetacleanError, Result};
pub use models::{Batch, BookRecord, Stage};
pub use pipeline::{Advance, CancelToken, PipelineController, Services, SweepReport};
