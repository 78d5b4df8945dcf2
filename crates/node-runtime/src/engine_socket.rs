//! Raw access to the engine's streaming endpoints.
//!
//! Log and exec output is requested over the control socket with a hyper
//! client. The response body is the multiplexed frame stream; each body
//! frame is pushed into a [`FrameDecoder`] as it arrives.

use crate::demux::{DemuxedOutput, FrameDecoder};
use crate::{Result, RuntimeError};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

type EngineClient = Client<UnixConnector, Full<Bytes>>;

/// Upper bound on an error body we keep for the error message.
const MAX_ERROR_BODY: usize = 64 * 1024;

const EXEC_START_BODY: &str = r#"{"Detach":false,"Tty":false}"#;

#[derive(Clone)]
pub struct EngineSocket {
    client: EngineClient,
    socket_path: PathBuf,
    stream_timeout: Duration,
}

impl EngineSocket {
    pub fn new(socket_path: impl Into<PathBuf>, stream_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
            stream_timeout,
        }
    }

    /// Full stdout/stderr history of a container.
    pub async fn container_logs(&self, container: &str) -> Result<DemuxedOutput> {
        let endpoint = format!("/containers/{container}/logs?stdout=1&stderr=1");
        self.stream("logs", container, Method::GET, &endpoint, None)
            .await
    }

    /// Starts a previously created exec session attached to stdout/stderr and
    /// drains it until the process exits.
    pub async fn start_exec(&self, exec_id: &str) -> Result<DemuxedOutput> {
        let endpoint = format!("/exec/{exec_id}/start");
        self.stream("exec start", exec_id, Method::POST, &endpoint, Some(EXEC_START_BODY))
            .await
    }

    async fn stream(
        &self,
        operation: &'static str,
        target: &str,
        method: Method,
        endpoint: &str,
        body: Option<&'static str>,
    ) -> Result<DemuxedOutput> {
        match timeout(
            self.stream_timeout,
            self.stream_inner(operation, target, method, endpoint, body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // Dropping the response body closes the connection; the engine sees EOF.
                warn!(%target, operation, "Engine stream cancelled after {:?}", self.stream_timeout);
                Err(RuntimeError::StreamTimeout {
                    target: target.to_string(),
                    after: self.stream_timeout,
                })
            }
        }
    }

    async fn stream_inner(
        &self,
        operation: &'static str,
        target: &str,
        method: Method,
        endpoint: &str,
        body: Option<&'static str>,
    ) -> Result<DemuxedOutput> {
        debug!(socket = %self.socket_path.display(), %method, %endpoint, "Opening engine stream");
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from_static(json.as_bytes()))),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(RuntimeError::transport(operation, target))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(RuntimeError::transport(operation, target))?;
        let status = response.status();
        let mut body = response.into_body();

        if !status.is_success() {
            let message = read_error_body(&mut body).await;
            return Err(RuntimeError::EngineRejected {
                operation,
                target: target.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let mut decoder = FrameDecoder::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(RuntimeError::transport(operation, target))?;
            if let Some(chunk) = frame.data_ref() {
                decoder.feed(chunk)?;
            }
        }
        debug!(%target, frames = decoder.frames(), "Engine stream drained");
        decoder.finish()
    }
}

/// Best-effort read of a rejection body, capped at [`MAX_ERROR_BODY`].
async fn read_error_body(body: &mut Incoming) -> String {
    let mut message = Vec::new();
    while message.len() < MAX_ERROR_BODY {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(chunk) = frame.data_ref() {
                    message.extend_from_slice(chunk);
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "Error body cut short");
                break;
            }
            None => break,
        }
    }
    message.truncate(MAX_ERROR_BODY);
    String::from_utf8_lossy(&message).trim().to_string()
}
