use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{MetacleanError, Result};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
static PIPELINE_DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Marker text the source site injects into file names and page content.
    pub watermark: String,
    pub catalogue_url: String,
    pub image_search_url: String,
    /// Catalogue placeholder shown for books without artwork.
    pub default_cover_url: String,
    pub cover_width: u32,
    pub cover_height: u32,
    pub cover_quality: u8,
    pub http_timeout_secs: u64,
    pub http_user_agent: String,
    pub max_concurrent_downloads: usize,
    /// Extra attempts for transport errors and 429/5xx answers.
    pub http_retries: u32,
    pub stall_prompt_secs: u64,
    pub history_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watermark: "OceanofPDF.com".to_string(),
            catalogue_url: "https://www.goodreads.com".to_string(),
            image_search_url: "https://www.google.com/search?tbm=isch&q=".to_string(),
            default_cover_url: "https://dryofg8nmyqjw.cloudfront.net/images/no-cover.png"
                .to_string(),
            cover_width: 1600,
            cover_height: 2560,
            cover_quality: 95,
            http_timeout_secs: 15,
            http_user_agent: DEFAULT_USER_AGENT.to_string(),
            max_concurrent_downloads: 3,
            http_retries: 2,
            stall_prompt_secs: 30,
            history_path: None,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file, falling back to defaults for absent keys.
    /// A missing file yields the defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|err| MetacleanError::io(path, err))?;
                serde_json::from_str::<Settings>(&raw).map_err(|err| {
                    MetacleanError::Config(format!("{}: {}", path.display(), err))
                })?
            }
            Some(path) => {
                log::info!("settings file {} not found, using defaults", path.display());
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("METACLEAN_CATALOGUE_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.catalogue_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Some(limit) = std::env::var("METACLEAN_MAX_DOWNLOADS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
        {
            self.max_concurrent_downloads = limit;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.watermark.trim().is_empty() {
            return Err(MetacleanError::Config("watermark must not be empty".into()));
        }
        if self.cover_width == 0 || self.cover_height == 0 {
            return Err(MetacleanError::Config(
                "cover dimensions must be non-zero".into(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(MetacleanError::Config(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn search_url(&self, query: &str) -> String {
        format!("{}/search?q={}", self.catalogue_url.trim_end_matches('/'), query)
    }

    /// Resolves a result link, which the catalogue emits as a site-relative path.
    pub fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!(
                "{}/{}",
                self.catalogue_url.trim_end_matches('/'),
                href.trim_start_matches('/')
            )
        }
    }
}

pub fn pipeline_debug_enabled() -> bool {
    *PIPELINE_DEBUG_ENABLED.get_or_init(|| {
        std::env::var("METACLEAN_DEBUG")
            .map(|value| {
                let lowered = value.trim().to_ascii_lowercase();
                lowered == "1" || lowered == "true" || lowered == "yes" || lowered == "on"
            })
            .unwrap_or(false)
    })
}
