use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("download failed for `{url}`: {message}")]
    Download { url: String, message: String },
}

/// Downloads media references and hands them to the classifier as inline
/// base64 data URLs. Normalization (resizing, format conversion) is out of
/// scope; bytes are passed through as served.
pub struct MediaFetcher {
    http: Client,
    max_attempts: u32,
}

impl MediaFetcher {
    pub fn new(http: Client) -> Self {
        let max_attempts = std::env::var("MEDIA_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(2);
        Self { http, max_attempts }
    }

    pub async fn fetch_data_url(&self, url: &str) -> Result<String, MediaError> {
        let mut last_message = String::new();
        for attempt in 1..=self.max_attempts {
            match self.try_fetch(url).await {
                Ok(data_url) => return Ok(data_url),
                Err(message) => {
                    warn!(
                        target: "attrib.media",
                        url,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %message,
                        "media download attempt failed"
                    );
                    last_message = message;
                    if attempt < self.max_attempts {
                        sleep(RETRY_PAUSE).await;
                    }
                }
            }
        }
        Err(MediaError::Download {
            url: url.to_string(),
            message: last_message,
        })
    }

    async fn try_fetch(&self, url: &str) -> Result<String, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| err.to_string())?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_else(|| "image/jpeg".into());
        let bytes = response.bytes().await.map_err(|err| err.to_string())?;
        Ok(format!("data:{content_type};base64,{}", STANDARD.encode(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_client;

    #[tokio::test]
    async fn encodes_served_bytes_as_data_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/main.jpg")
            .with_status(200)
            .with_header("content-type", "image/jpeg")
            .with_body(vec![0xff, 0xd8, 0xff])
            .create_async()
            .await;
        let fetcher = MediaFetcher::new(build_client());
        let url = format!("{}/main.jpg", server.url());
        let data_url = fetcher.fetch_data_url(&url).await.expect("fetch");
        assert_eq!(data_url, format!("data:image/jpeg;base64,{}", STANDARD.encode([0xffu8, 0xd8, 0xff])));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gone.jpg")
            .with_status(404)
            .expect(2)
            .create_async()
            .await;
        let fetcher = MediaFetcher::new(build_client());
        let url = format!("{}/gone.jpg", server.url());
        let err = fetcher.fetch_data_url(&url).await.expect_err("must fail");
        assert!(matches!(err, MediaError::Download { .. }));
        mock.assert_async().await;
    }
}
