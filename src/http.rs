use reqwest::blocking::Client;
use std::time::Duration;

use crate::config::{pipeline_debug_enabled, Settings};
use crate::error::{MetacleanError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// File name offered by a `Content-Disposition` header.
    pub suggested_name: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Synchronous GET used for search pages, book pages and image bytes.
/// A non-success status is a response, not an error; transport failures are
/// `MetacleanError::Network`.
pub trait Fetch {
    fn get(&self, url: &str) -> Result<FetchResponse>;
}

pub struct HttpClient {
    client: Client,
    user_agent: String,
    max_retries: u64,
}

impl HttpClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()
            .map_err(|err| MetacleanError::Config(format!("http client: {}", err)))?;
        Ok(Self {
            client,
            user_agent: settings.http_user_agent.clone(),
            max_retries: u64::from(settings.http_retries),
        })
    }
}

impl Fetch for HttpClient {
    fn get(&self, url: &str) -> Result<FetchResponse> {
        let debug_enabled = pipeline_debug_enabled();
        if debug_enabled {
            log::info!("[pipeline-debug] http start url={}", url);
        }

        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .get(url)
                .header(reqwest::header::USER_AGENT, self.user_agent.as_str())
                .header(reqwest::header::ACCEPT, "text/html,image/*;q=0.9,*/*;q=0.8")
                .send();

            let response = match response {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("http transport error url={} attempt={}: {}", url, attempt + 1, err);
                    if attempt < self.max_retries {
                        std::thread::sleep(Duration::from_millis(350 * (attempt + 1)));
                        continue;
                    }
                    return Err(MetacleanError::network(url, err.to_string()));
                }
            };

            let status = response.status();
            if (status.as_u16() == 429 || status.is_server_error()) && attempt < self.max_retries {
                let retry_after_ms = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(|value| value * 1000)
                    .unwrap_or(350 * (attempt + 1));
                if debug_enabled {
                    log::warn!(
                        "[pipeline-debug] http status url={} status={} attempt={}",
                        url,
                        status,
                        attempt + 1
                    );
                }
                std::thread::sleep(Duration::from_millis(retry_after_ms.min(4_000)));
                continue;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            let suggested_name = response
                .headers()
                .get(reqwest::header::CONTENT_DISPOSITION)
                .and_then(|value| value.to_str().ok())
                .and_then(disposition_file_name);
            let body = response
                .bytes()
                .map_err(|err| MetacleanError::network(url, err.to_string()))?
                .to_vec();
            if debug_enabled {
                log::info!(
                    "[pipeline-debug] http done url={} status={} bytes={}",
                    url,
                    status,
                    body.len()
                );
            }
            return Ok(FetchResponse {
                status: status.as_u16(),
                content_type,
                suggested_name,
                body,
            });
        }

        Err(MetacleanError::network(url, "retries exhausted"))
    }
}

/// `attachment; filename="Book.epub"` yields `Book.epub`.
fn disposition_file_name(header: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|part| {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            let encoded = encoded.rsplit("''").next().unwrap_or(encoded);
            return urlencoding::decode(encoded).ok().map(|value| value.into_owned());
        }
        part.strip_prefix("filename=")
            .map(|value| value.trim_matches('"').to_string())
    })
    .filter(|name| !name.is_empty())
}
