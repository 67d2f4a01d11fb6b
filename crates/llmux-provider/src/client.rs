use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    pub is_stream: bool,
    pub timeout: Duration,
}

/// Streamed bodies arrive through a bounded channel: the HTTP read task
/// blocks when the consumer falls behind, and dropping the receiver tears
/// down the upstream connection.
#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Result<Bytes, String>>),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// Non-2xx HTTP response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
}

impl ReqwestUpstreamClient {
    pub fn new(proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl UpstreamClient for ReqwestUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut builder = self
                .client
                .post(&req.url)
                .timeout(req.timeout)
                .body(req.body.clone());
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }

            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.to_string(), value.to_string()))
                })
                .collect::<Headers>();

            if status >= 400 {
                let body = response.bytes().await.unwrap_or_default();
                return Err(UpstreamFailure::Http {
                    status,
                    headers,
                    body,
                });
            }

            if req.is_stream {
                let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                tokio::spawn(async move {
                    let mut stream = response.bytes_stream();
                    while let Some(next) = stream.next().await {
                        let item = next.map_err(|err| err.to_string());
                        // A closed receiver means the consumer cancelled;
                        // dropping `stream` here closes the connection.
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Stream(rx),
                })
            } else {
                let body = response
                    .bytes()
                    .await
                    .map_err(map_reqwest_error)?;
                Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                })
            }
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> UpstreamFailure {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    UpstreamFailure::Transport {
        kind,
        message: err.to_string(),
    }
}
