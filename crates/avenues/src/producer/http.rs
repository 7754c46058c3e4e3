//! Support to produce resources by downloading them over HTTP.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tokio::runtime::Handle;
use url::Url;

use super::{Completion, ProduceResult, Producer, TaskProducer};
use crate::config::HttpConfig;
use crate::error::ProduceError;
use crate::types::ProcessingState;

/// Creates a [`reqwest::Client`] with the configured timeouts and user agent.
pub fn create_client(config: &HttpConfig) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(config.user_agent.as_str())
        .build()
}

/// A [`Producer`] downloading the contents of URLs.
///
/// Every download runs as a task on the given runtime, see [`TaskProducer`].
#[derive(Clone)]
pub struct HttpProducer {
    tasks: TaskProducer<Url, Bytes>,
}

impl HttpProducer {
    /// Creates a producer downloading with `client`.
    ///
    /// `timeout` is reported in [`ProduceError::Timeout`] when a download times out, and should
    /// match the timeout the client was configured with.
    pub fn new(runtime: Handle, client: Client, timeout: Duration) -> Self {
        let tasks = TaskProducer::with_name("http", runtime, move |url| {
            download(client.clone(), url, timeout)
        });
        Self { tasks }
    }

    /// Creates a producer with a client configured from `config`.
    pub fn from_config(runtime: Handle, config: &HttpConfig) -> reqwest::Result<Self> {
        let client = create_client(config)?;
        Ok(Self::new(runtime, client, config.timeout))
    }
}

async fn download(client: Client, url: Url, timeout: Duration) -> ProduceResult<Bytes> {
    tracing::debug!("Fetching resource from `{}`", url);

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| request_error(err, timeout))?;

    let status = response.status();
    if !status.is_success() {
        tracing::debug!(%url, %status, "Unexpected status code");
        return Err(status_error(status, response.text().await.unwrap_or_default()));
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| request_error(err, timeout))?;

    metric!(time_raw("avenues.http.size") = body.len() as u64);
    Ok(body)
}

fn request_error(err: reqwest::Error, timeout: Duration) -> ProduceError {
    if err.is_timeout() {
        ProduceError::Timeout(timeout)
    } else {
        tracing::debug!(
            error = &err as &dyn std::error::Error,
            "Failed to download resource"
        );
        ProduceError::Download(err.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> ProduceError {
    match status {
        StatusCode::NOT_FOUND => ProduceError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let details = body.trim();
            if details.is_empty() {
                ProduceError::PermissionDenied(status.to_string())
            } else {
                ProduceError::PermissionDenied(format!("{status}: {details}"))
            }
        }
        _ => ProduceError::Download(status.to_string()),
    }
}

impl Producer<Url, Bytes> for HttpProducer {
    fn start(&self, key: Url, completion: Completion<Bytes>) {
        self.tasks.start(key, completion)
    }

    fn cancel(&self, key: &Url) {
        self.tasks.cancel(key)
    }

    fn cancel_all(&self) {
        self.tasks.cancel_all()
    }

    fn status(&self, key: &Url) -> ProcessingState {
        self.tasks.status(key)
    }
}

impl fmt::Debug for HttpProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProducer").finish_non_exhaustive()
    }
}
