use memview_core::wire::{
    parse_snapshot_value, AllocateAck, AllocateRequest, DeallocateAck, ErrorDetail,
    PayloadError, ProcessLogResponse, SuggestResponse,
};
use memview_core::{LogEntry, ParseReport};
use reqwest::header::ACCEPT;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("building HTTP client: {0}")]
    Client(String),
    #[error("requesting {path}: {message}")]
    Request { path: String, message: String },
    #[error("unexpected status {status} from {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("decoding response from {path}: {message}")]
    Decode { path: String, message: String },
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Command and snapshot endpoints of the allocation backend.
pub trait MemoryApi: Send + Sync + 'static {
    fn allocate(
        &self,
        request: &AllocateRequest,
    ) -> impl Future<Output = Result<AllocateAck, ApiError>> + Send;

    fn deallocate(&self, pid: &str) -> impl Future<Output = Result<DeallocateAck, ApiError>> + Send;

    fn suggest_strategy(
        &self,
        size: u64,
    ) -> impl Future<Output = Result<SuggestResponse, ApiError>> + Send;

    /// Authoritative block list, parsed with per-record isolation.
    fn fetch_snapshot(&self) -> impl Future<Output = Result<ParseReport, ApiError>> + Send;

    fn fetch_process_log(
        &self,
        pid: &str,
    ) -> impl Future<Output = Result<Vec<LogEntry>, ApiError>> + Send;
}

/// Response of a command endpoint: decoded body, or the status and `detail`
/// text of a 4xx rejection.
enum Reply<T> {
    Accepted(T),
    Rejected { status: u16, detail: String },
}

impl<T> Reply<T> {
    /// For endpoints where a rejection is an error like any other.
    fn accepted(self, path: &str) -> Result<T, ApiError> {
        match self {
            Reply::Accepted(value) => Ok(value),
            Reply::Rejected { status, detail } => Err(ApiError::Status {
                path: path.to_string(),
                status,
                body: detail,
            }),
        }
    }
}

pub struct HttpApi {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpApi {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Client(format!(
                "base URL cannot carry a path: {base_url}"
            )));
        }
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Client(err.to_string()))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        request: RequestBuilder,
    ) -> Result<Reply<T>, ApiError> {
        let started = Instant::now();
        let response = request
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| ApiError::Request {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| ApiError::Request {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        debug!(
            event = "api_response",
            path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        if status.is_success() {
            return serde_json::from_str(&body)
                .map(Reply::Accepted)
                .map_err(|err| ApiError::Decode {
                    path: path.to_string(),
                    message: err.to_string(),
                });
        }
        if status.is_client_error() {
            if let Ok(detail) = serde_json::from_str::<ErrorDetail>(&body) {
                return Ok(Reply::Rejected {
                    status: status.as_u16(),
                    detail: detail.text(),
                });
            }
        }
        Err(ApiError::Status {
            path: path.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, url: Url) -> Result<T, ApiError> {
        self.send(path, self.http.get(url)).await?.accepted(path)
    }
}

impl MemoryApi for HttpApi {
    async fn allocate(&self, request: &AllocateRequest) -> Result<AllocateAck, ApiError> {
        let url = self.endpoint(&["allocate"]);
        match self.send("/allocate", self.http.post(url).json(request)).await? {
            Reply::Accepted(ack) => Ok(ack),
            Reply::Rejected { detail, .. } => Ok(AllocateAck::rejected(detail)),
        }
    }

    async fn deallocate(&self, pid: &str) -> Result<DeallocateAck, ApiError> {
        let url = self.endpoint(&["deallocate", pid]);
        match self.send("/deallocate", self.http.delete(url)).await? {
            Reply::Accepted(ack) => Ok(ack),
            Reply::Rejected { detail, .. } => Ok(DeallocateAck::rejected(detail)),
        }
    }

    async fn suggest_strategy(&self, size: u64) -> Result<SuggestResponse, ApiError> {
        let url = self.endpoint(&["suggest-strategy"]);
        let request = self.http.post(url).query(&[("size", size)]);
        self.send("/suggest-strategy", request)
            .await?
            .accepted("/suggest-strategy")
    }

    async fn fetch_snapshot(&self) -> Result<ParseReport, ApiError> {
        let url = self.endpoint(&["memory"]);
        let value: Value = self.get_json("/memory", url).await?;
        Ok(parse_snapshot_value(&value)?)
    }

    async fn fetch_process_log(&self, pid: &str) -> Result<Vec<LogEntry>, ApiError> {
        let url = self.endpoint(&["process-log", pid]);
        let response: ProcessLogResponse = self.get_json("/process-log", url).await?;
        Ok(response.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_under_base_path() {
        let api = HttpApi::new(
            Url::parse("http://localhost:8000/").expect("url"),
            Duration::ZERO,
        )
        .expect("client");
        assert_eq!(
            api.endpoint(&["allocate"]).as_str(),
            "http://localhost:8000/allocate"
        );

        let nested = HttpApi::new(
            Url::parse("http://sim.local/api").expect("url"),
            DEFAULT_TIMEOUT,
        )
        .expect("client");
        assert_eq!(
            nested.endpoint(&["deallocate", "P 1/x"]).as_str(),
            "http://sim.local/api/deallocate/P%201%2Fx"
        );
    }

    #[test]
    fn rejections_keep_their_status() {
        let reply: Reply<SuggestResponse> = Reply::Rejected {
            status: 422,
            detail: "size out of range".to_string(),
        };
        match reply.accepted("/suggest-strategy") {
            Err(ApiError::Status { path, status, body }) => {
                assert_eq!(path, "/suggest-strategy");
                assert_eq!(status, 422);
                assert_eq!(body, "size out of range");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn non_base_urls_are_rejected() {
        let result = HttpApi::new(
            Url::parse("mailto:ops@example.com").expect("url"),
            DEFAULT_TIMEOUT,
        );
        assert!(matches!(result, Err(ApiError::Client(_))));
    }
}
