//! Resolve → ensure-ready → forward. The one place that turns a model name
//! into bytes flowing between a client and the right backend.
//!
//! The WebSocket bridge and the streamed-response path both boil down to the
//! same shape: a bidirectional (or one-way) copy between two async byte
//! streams, once for a raw TCP socket pair and once for a `reqwest`
//! request/response pair.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use futures::Stream;

use crate::error::SwapError;
use crate::process::manager::ProcessManager;
use crate::process::{InFlightGuard, Process, ProcessState};

/// Headers that are connection-scoped and must never be blindly forwarded
/// between hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Dispatcher {
    manager: Arc<ProcessManager>,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        Dispatcher {
            manager,
            http: reqwest::Client::builder()
                .build()
                .expect("reqwest client with default TLS backend"),
        }
    }

    /// Resolve `model_name`, ensure its backend is READY (starting/swapping
    /// as needed), and return both the process and an in-flight guard held
    /// for the duration of the request.
    async fn acquire(&self, model_name: &str) -> Result<(Arc<Process>, InFlightGuard), SwapError> {
        let mut process = self.manager.swap(model_name).await?;
        let mut guard = process.add_in_flight();

        // The process could have been evicted or swapped out in the gap
        // between `swap()` returning and us registering the in-flight
        // count. Retry once, matching the dispatcher's documented retry
        // policy, before giving up.
        if process.state().await != ProcessState::Ready {
            drop(guard);
            process = self.manager.swap(model_name).await?;
            guard = process.add_in_flight();
            if process.state().await != ProcessState::Ready {
                return Err(SwapError::SpawnFailed {
                    model: model_name.to_string(),
                    source: anyhow::anyhow!("process left READY before the request could be served"),
                });
            }
        }
        Ok((process, guard))
    }

    /// Forward an ordinary (non-upgrade) HTTP request to `model_name`'s
    /// backend, streaming the response body — including SSE — back to the
    /// caller without buffering.
    pub async fn forward(
        &self,
        model_name: &str,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<axum::response::Response, SwapError> {
        let (process, guard) = self.acquire(model_name).await?;

        let url = format!("{}{}", process.model.proxy.trim_end_matches('/'), path_and_query);
        let mut req = self.http.request(
            reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET),
            &url,
        );
        for (name, value) in headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            req = req.header(name.as_str(), value.as_bytes());
        }
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| SwapError::ProxyUpstreamError {
                model: model_name.to_string(),
                source: anyhow::Error::new(e),
            })?;
        req = req.body(body_bytes);

        let upstream = req.send().await.map_err(|e| SwapError::ProxyUpstreamError {
            model: model_name.to_string(),
            source: anyhow::Error::new(e),
        })?;

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers().iter() {
            if HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let stream = GuardedStream {
            inner: upstream.bytes_stream(),
            _guard: guard,
        };
        let mut response = axum::response::Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    /// Forward a non-model-scoped aggregate request (`/slots`, `/props`) to
    /// the most recently started READY process, or synthesize an empty
    /// default response if nothing is READY yet — there is no model name to
    /// resolve against, so there is nothing to start on this path.
    pub async fn forward_aggregate(
        &self,
        manager: &ProcessManager,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<axum::response::Response, SwapError> {
        match manager.most_recently_started_ready().await {
            Some(process) => {
                self.forward(&process.id, method, path_and_query, headers, body)
                    .await
            }
            None => {
                let mut response =
                    axum::response::Response::new(Body::from(serde_json::json!({}).to_string()));
                *response.status_mut() = StatusCode::OK;
                response.headers_mut().insert(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Ok(response)
            }
        }
    }

    /// Bridge a WebSocket upgrade request to `model_name`'s backend as an
    /// opaque byte stream: perform the HTTP/1.1 upgrade handshake against
    /// the upstream ourselves, relay its 101 response verbatim, then copy
    /// raw bytes in both directions for the lifetime of the connection. No
    /// WebSocket frame is ever parsed on this path.
    pub async fn forward_upgrade(
        &self,
        model_name: &str,
        mut request: axum::extract::Request,
        path_and_query: &str,
    ) -> Result<axum::response::Response, SwapError> {
        let (process, guard) = self.acquire(model_name).await?;

        let target = reqwest::Url::parse(&process.model.proxy).map_err(|e| SwapError::ProxyUpstreamError {
            model: model_name.to_string(),
            source: anyhow::Error::new(e),
        })?;
        let host = target
            .host_str()
            .ok_or_else(|| SwapError::ProxyUpstreamError {
                model: model_name.to_string(),
                source: anyhow::anyhow!("proxy url has no host"),
            })?
            .to_string();
        let port = target.port_or_known_default().unwrap_or(80);

        let mut upstream = tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| SwapError::ProxyUpstreamError {
                model: model_name.to_string(),
                source: anyhow::Error::new(e),
            })?;

        let mut handshake = format!(
            "GET {path_and_query} HTTP/1.1\r\nHost: {host}\r\n"
        );
        for (name, value) in request.headers().iter() {
            if name == axum::http::header::HOST {
                continue;
            }
            if let Ok(v) = value.to_str() {
                handshake.push_str(&format!("{}: {}\r\n", name.as_str(), v));
            }
        }
        handshake.push_str("\r\n");

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        upstream
            .write_all(handshake.as_bytes())
            .await
            .map_err(|e| SwapError::ProxyUpstreamError {
                model: model_name.to_string(),
                source: anyhow::Error::new(e),
            })?;

        let (status, response_headers) = read_http_response_head(&mut upstream)
            .await
            .map_err(|e| SwapError::ProxyUpstreamError {
                model: model_name.to_string(),
                source: e,
            })?;

        if status != 101 {
            return Err(SwapError::ProxyUpstreamError {
                model: model_name.to_string(),
                source: anyhow::anyhow!("upstream refused the upgrade with status {status}"),
            });
        }

        let model_name_owned = model_name.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            match hyper::upgrade::on(&mut request).await {
                Ok(client_upgraded) => {
                    let mut client_io = hyper_util::rt::TokioIo::new(client_upgraded);
                    if let Err(err) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
                        tracing::debug!(model = %model_name_owned, error = %err, "websocket bridge closed");
                    }
                }
                Err(err) => {
                    tracing::warn!(model = %model_name_owned, error = %err, "client upgrade failed");
                }
            }
        });

        let mut response = axum::response::Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

async fn read_http_response_head(
    stream: &mut tokio::net::TcpStream,
) -> anyhow::Result<(u16, HeaderMap)> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    // The handshake response is small; reading it line-by-line off a
    // `BufReader` wrapping the live socket is fine because the remaining
    // bytes (none, for a 101) stay in the reader's buffer — but since we
    // hand the raw `TcpStream` off to the bidirectional copy afterwards, we
    // read directly off the stream a line at a time instead, so no bytes
    // are buffered past the blank line that terminates the head.
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed status line: {status_line:?}"))?;

    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }
    Ok((status, headers))
}

struct GuardedStream<S> {
    inner: S,
    _guard: InFlightGuard,
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(err))) => {
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Rewrite `/upstream/<model>/<rest>` into `(model, "/<rest>")`. Everything
/// past the model segment is forwarded byte-for-byte, including the query
/// string, which the caller re-attaches.
pub fn split_upstream_path(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim_start_matches('/');
    let (model, path) = rest.split_once('/')?;
    Some((model, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_model_and_forwarded_path() {
        assert_eq!(
            split_upstream_path("llama3/v1/chat/completions"),
            Some(("llama3", "v1/chat/completions"))
        );
    }

    #[test]
    fn rejects_path_with_no_forwarded_segment() {
        assert_eq!(split_upstream_path("llama3"), None);
    }
}
