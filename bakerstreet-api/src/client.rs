//! HTTP client for the registry daemon, used by the agent and query tools

use bakerstreet_core::{Registration, RegistryStats};
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::models::{
    DeregisterResponse, ErrorBody, HeartbeatResponse, RegisterBody, ResolveQuery, ResolveResponse,
    ServicesResponse, WatchEvent,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid registry url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed watch event: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// The registry has no live entry for the instance
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: Client,
    /// Watch streams stay open indefinitely, so only connecting is bounded
    streaming: Client,
    base_url: Url,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        let streaming = Client::builder().connect_timeout(DEFAULT_TIMEOUT).build()?;
        Self::with_clients(client, streaming, base_url)
    }

    /// Use one caller-built client for every request, watches included
    pub fn with_client(client: Client, base_url: &str) -> ClientResult<Self> {
        Self::with_clients(client.clone(), client, base_url)
    }

    fn with_clients(client: Client, streaming: Client, base_url: &str) -> ClientResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            streaming,
            base_url,
        })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn register(&self, service: &str, body: &RegisterBody) -> ClientResult<Registration> {
        let url = self.url(&["api", "v1", "services", service, "instances"])?;
        self.send(self.client.request(Method::POST, url).json(body)).await
    }

    pub async fn heartbeat(&self, service: &str, instance: &str) -> ClientResult<HeartbeatResponse> {
        let url = self.url(&["api", "v1", "services", service, "instances", instance, "heartbeat"])?;
        self.send(self.client.request(Method::PUT, url)).await
    }

    pub async fn deregister(&self, service: &str, instance: &str) -> ClientResult<DeregisterResponse> {
        let url = self.url(&["api", "v1", "services", service, "instances", instance])?;
        self.send(self.client.request(Method::DELETE, url)).await
    }

    pub async fn resolve(&self, service: &str, query: &ResolveQuery) -> ClientResult<ResolveResponse> {
        let url = self.url(&["api", "v1", "services", service])?;
        self.send(self.client.get(url).query(query)).await
    }

    pub async fn services(&self) -> ClientResult<Vec<String>> {
        let url = self.url(&["api", "v1", "services"])?;
        let response: ServicesResponse = self.send(self.client.get(url)).await?;
        Ok(response.services)
    }

    pub async fn stats(&self) -> ClientResult<RegistryStats> {
        let url = self.url(&["api", "v1", "stats"])?;
        self.send(self.client.get(url)).await
    }

    /// Follow a service: a `Snapshot` first, then every change.
    ///
    /// After a `Dropped` event the server re-sends the live entries as
    /// `added` changes. The stream ends when the registry closes it.
    pub async fn watch(
        &self,
        service: &str,
    ) -> ClientResult<impl Stream<Item = ClientResult<WatchEvent>> + Send + 'static> {
        let url = self.url(&["api", "v1", "services", service, "watch"])?;
        let request = self.streaming.get(url).header(ACCEPT, "text/event-stream");
        let response = Self::check(request.send().await?).await?;

        let mut decoder = SseDecoder::default();
        let events = response.bytes_stream().flat_map(move |chunk| {
            let items: Vec<ClientResult<WatchEvent>> = match chunk {
                Ok(bytes) => decoder
                    .push(&bytes)
                    .into_iter()
                    .filter_map(|frame| frame.decode().transpose())
                    .collect(),
                Err(e) => vec![Err(e.into())],
            };
            stream::iter(items)
        });
        Ok(events)
    }

    pub async fn health(&self) -> ClientResult<()> {
        let url = self.url(&["health"])?;
        let response = self.client.get(url).send().await?;
        Self::check(response).await.map(|_| ())
    }

    /// Join path segments onto the base url, percent-encoding each one
    fn url(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn check(response: Response) -> ClientResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// One complete `text/event-stream` message
#[derive(Debug, PartialEq, Eq)]
struct SseFrame {
    event: String,
    data: String,
}

impl SseFrame {
    fn decode(self) -> ClientResult<Option<WatchEvent>> {
        let event = match self.event.as_str() {
            "snapshot" => WatchEvent::Snapshot(serde_json::from_str(&self.data)?),
            "change" => WatchEvent::Change(serde_json::from_str(&self.data)?),
            "dropped" => WatchEvent::Dropped(serde_json::from_str(&self.data)?),
            other => {
                tracing::debug!(event = other, data = %self.data, "Ignoring unknown watch event");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

/// Incremental event-stream parser; chunks may split lines anywhere
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                let event = self.event.take();
                if !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: event.unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            // Comment, used by the server for keep-alives
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_segments() {
        let client = RegistryClient::new("http://localhost:5000").unwrap();
        let url = client.url(&["api", "v1", "services", "checkout"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/api/v1/services/checkout");
    }

    #[test]
    fn test_url_keeps_base_path() {
        let client = RegistryClient::new("http://registry.internal/bakerstreet").unwrap();
        let url = client.url(&["health"]).unwrap();
        assert_eq!(url.as_str(), "http://registry.internal/bakerstreet/health");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            RegistryClient::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_sse_decoder_reassembles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: chan").is_empty());
        assert!(decoder.push(b"ge\ndata: {\"a\":").is_empty());
        let frames = decoder.push(b"1}\n\n: ping\n\nevent: dropped\r\ndata: {\"missed\":3}\r\n\r\n");

        assert_eq!(
            frames,
            vec![
                SseFrame { event: "change".into(), data: "{\"a\":1}".into() },
                SseFrame { event: "dropped".into(), data: "{\"missed\":3}".into() },
            ]
        );
    }

    #[test]
    fn test_sse_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b"data: first\ndata:second\n\n");
        assert_eq!(frames, vec![SseFrame { event: "message".into(), data: "first\nsecond".into() }]);
    }

    #[test]
    fn test_sse_frame_decoding() {
        let dropped = SseFrame { event: "dropped".into(), data: r#"{"missed":3}"#.into() };
        assert_eq!(
            dropped.decode().unwrap(),
            Some(WatchEvent::Dropped(crate::models::DroppedNotice { missed: 3 }))
        );

        let unknown = SseFrame { event: "error".into(), data: "encoding failed".into() };
        assert_eq!(unknown.decode().unwrap(), None);

        let broken = SseFrame { event: "change".into(), data: "{".into() };
        assert!(matches!(broken.decode(), Err(ClientError::Decode(_))));
    }

    #[test]
    fn test_error_classification() {
        let err = ClientError::Api { status: 404, message: "gone".into() };
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }
}
