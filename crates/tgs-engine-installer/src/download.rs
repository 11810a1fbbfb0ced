use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info};
use tgs_engine_backend::{CancellationToken, EngineError, EngineVersion, ProgressReporter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const LINUX_URL_TEMPLATE: &str =
    "https://www.byond.com/download/build/{major}/{major}.{minor}_byond_linux.zip";
pub const WINDOWS_URL_TEMPLATE: &str =
    "https://www.byond.com/download/build/{major}/{major}.{minor}_byond.zip";

/// Fetches engine archives into memory from a URL template.
///
/// The template understands `{major}` and `{minor}` placeholders.
#[derive(Debug, Clone)]
pub struct ArchiveDownloader {
    client: reqwest::Client,
    template: String,
}

impl ArchiveDownloader {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(template: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let template = template.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("tgs-engine/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::download(&template, e.to_string()))?;
        Ok(Self { client, template })
    }

    #[must_use]
    pub fn url_for(&self, version: &EngineVersion) -> String {
        self.template
            .replace("{major}", &version.major.to_string())
            .replace("{minor}", &version.minor.to_string())
    }

    /// Download the archive for `version`.
    ///
    /// # Errors
    /// Returns [`EngineError::Download`] for transport failures and
    /// non-success statuses, or [`EngineError::Cancelled`].
    pub async fn fetch(
        &self,
        version: &EngineVersion,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        let url = self.url_for(version);
        info!("Downloading engine {version} from {url}");

        let bytes = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.fetch_url(&url, progress) => result?,
        };

        info!("Download complete: {} bytes", bytes.len());
        Ok(bytes)
    }

    async fn fetch_url(&self, url: &str, progress: &ProgressReporter) -> Result<Vec<u8>, EngineError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::download(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::download(url, format!("HTTP {status}")));
        }

        let total = response.content_length().unwrap_or(0);
        let mut buffer = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EngineError::download(url, e.to_string()))?;
            buffer.extend_from_slice(&chunk);
            if total > 0 {
                progress.report(percent_of(buffer.len() as u64, total));
            }
        }

        debug!("Fetched {url}");
        progress.report(100);
        Ok(buffer)
    }
}

fn percent_of(done: u64, total: u64) -> u8 {
    u8::try_from((done.min(total) * 100) / total.max(1)).unwrap_or(100)
}
