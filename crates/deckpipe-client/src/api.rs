use crate::config::ClientConfig;
use async_trait::async_trait;
use deckpipe_core::{HistorySnapshot, RemoteStatus};
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("invalid response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("stream read failed: {0}")]
    Stream(String),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ApiError>> + Send>>;

/// Server endpoints a run is observed through.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn fetch_status(&self, run_id: &str) -> Result<RemoteStatus, ApiError>;

    async fn fetch_history(&self, run_id: &str) -> Result<HistorySnapshot, ApiError>;

    /// Opens the event feed. `last_event_id` is sent as the resume hint.
    async fn open_stream(
        &self,
        run_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, ApiError>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: RemoteStatus,
}

pub struct HttpPipelineApi {
    client: Client,
    config: ClientConfig,
}

impl HttpPipelineApi {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let request = self.client.get(url);
        match self.config.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = self
            .get(url.clone())
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = check_status(response)?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    async fn fetch_status(&self, run_id: &str) -> Result<RemoteStatus, ApiError> {
        let url = self.config.endpoint(&["presentation-status", run_id]);
        let body: StatusResponse = self.get_json(url).await?;
        Ok(body.status)
    }

    async fn fetch_history(&self, run_id: &str) -> Result<HistorySnapshot, ApiError> {
        let mut url = self.config.endpoint(&["logs"]);
        url.query_pairs_mut().append_pair("p_id", run_id);
        self.get_json(url).await
    }

    async fn open_stream(
        &self,
        run_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<ByteStream, ApiError> {
        let url = self.config.endpoint(&["stream", run_id]);
        let mut request = self
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header(LAST_EVENT_ID_HEADER, id);
        }
        debug!(
            "stream_open: run_id={run_id} resume_from={}",
            last_event_id.unwrap_or("-")
        );
        let response = check_status(request.send().await?)?;
        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| ApiError::Stream(err.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ApiError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}
