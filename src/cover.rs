use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder};

use crate::config::Settings;
use crate::error::{MetacleanError, Result};
use crate::http::Fetch;

/// Canonical size and quality every stored cover is re-encoded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverFormat {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

impl CoverFormat {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            width: settings.cover_width,
            height: settings.cover_height,
            quality: settings.cover_quality,
        }
    }
}

/// Decodes any supported image, flattens it to RGB, resizes it to the
/// canonical resolution and encodes it as JPEG.
pub fn normalize_cover(bytes: &[u8], format: CoverFormat) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = decoded.to_rgb8();
    let resized = image::imageops::resize(&rgb, format.width, format.height, FilterType::Lanczos3);

    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, format.quality).write_image(
        &resized,
        format.width,
        format.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(output)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoverState {
    /// The EPUB has no cover entry to write to.
    NoCoverPossible,
    AwaitingConfirmation { candidate: Vec<u8> },
    AwaitingUserUrl { error: Option<String> },
    Accepted { image: Vec<u8> },
}

impl CoverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NoCoverPossible | Self::Accepted { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoCoverPossible => "no-cover-possible",
            Self::AwaitingConfirmation { .. } => "awaiting-confirmation",
            Self::AwaitingUserUrl { .. } => "awaiting-user-url",
            Self::Accepted { .. } => "accepted",
        }
    }
}

/// Chooses one cover for a record, driven by user confirmations.
#[derive(Debug, Clone)]
pub struct CoverResolver {
    state: CoverState,
    default_url: Option<String>,
    format: CoverFormat,
}

impl CoverResolver {
    pub fn new(
        has_cover_entry: bool,
        candidate: Option<Vec<u8>>,
        default_url: Option<String>,
        format: CoverFormat,
    ) -> Self {
        let state = match (has_cover_entry, candidate) {
            (false, _) => CoverState::NoCoverPossible,
            (true, Some(candidate)) => CoverState::AwaitingConfirmation { candidate },
            (true, None) => CoverState::AwaitingUserUrl {
                error: Some("No cover image was found for this book.".to_string()),
            },
        };
        Self {
            state,
            default_url: default_url.filter(|url| !url.trim().is_empty()),
            format,
        }
    }

    pub fn state(&self) -> &CoverState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn accepted(&self) -> Option<&[u8]> {
        match &self.state {
            CoverState::Accepted { image } => Some(image),
            _ => None,
        }
    }

    pub fn confirm(&mut self) {
        let CoverState::AwaitingConfirmation { candidate } = &self.state else {
            log::debug!("cover confirm ignored in state {}", self.state.name());
            return;
        };
        self.state = match normalize_cover(candidate, self.format) {
            Ok(image) => CoverState::Accepted { image },
            Err(err) => {
                log::warn!("cover candidate could not be normalized: {}", err);
                CoverState::AwaitingUserUrl {
                    error: Some(format!("The image could not be used: {}", err)),
                }
            }
        };
    }

    pub fn reject(&mut self) {
        if matches!(self.state, CoverState::AwaitingConfirmation { .. }) {
            self.state = CoverState::AwaitingUserUrl { error: None };
        }
    }

    /// Fetches a replacement cover. Empty input falls back to the default
    /// (scraped) cover URL. Anything that is not a decodable image keeps the
    /// resolver waiting for another URL.
    pub fn submit_url(&mut self, input: &str, fetcher: &dyn Fetch) {
        if !matches!(self.state, CoverState::AwaitingUserUrl { .. }) {
            log::debug!("cover url ignored in state {}", self.state.name());
            return;
        }

        let input = input.trim();
        let url = if input.is_empty() {
            match &self.default_url {
                Some(url) => url.clone(),
                None => {
                    self.state = CoverState::AwaitingUserUrl {
                        error: Some("There is no default cover to fall back on.".to_string()),
                    };
                    return;
                }
            }
        } else {
            input.to_string()
        };

        self.state = match fetch_image(&url, fetcher) {
            Ok(candidate) => CoverState::AwaitingConfirmation { candidate },
            Err(err) => {
                log::warn!("cover url {} rejected: {}", url, err);
                CoverState::AwaitingUserUrl {
                    error: Some(err.to_string()),
                }
            }
        };
    }
}

fn fetch_image(url: &str, fetcher: &dyn Fetch) -> Result<Vec<u8>> {
    let response = fetcher.get(url)?;
    if !response.is_success() {
        return Err(MetacleanError::network(
            url,
            format!("server answered {}", response.status),
        ));
    }
    image::load_from_memory(&response.body)?;
    Ok(response.body)
}
