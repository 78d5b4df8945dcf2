use node_runtime::demux::{encode_frame, StreamTarget};
use node_runtime::engine_socket::EngineSocket;
use node_runtime::RuntimeError;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// Serves exactly one connection: records the request head, then writes
/// `response` in `chunk`-sized pieces and closes.
fn fake_engine(
    dir: &tempfile::TempDir,
    response: Vec<u8>,
    chunk: usize,
) -> (PathBuf, JoinHandle<String>) {
    let path = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let handle = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 256];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        for piece in response.chunks(chunk) {
            conn.write_all(piece).await.unwrap();
            conn.flush().await.unwrap();
            tokio::task::yield_now().await;
        }
        conn.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    });
    (path, handle)
}

fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut response =
        b"HTTP/1.0 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\n".to_vec();
    response.extend_from_slice(body);
    response
}

#[tokio::test]
async fn test_logs_are_demultiplexed_across_small_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut body = encode_frame(StreamTarget::Stdout, b"xray started\n");
    body.extend(encode_frame(StreamTarget::Stderr, b"warning: weak cipher\n"));
    body.extend(encode_frame(StreamTarget::Stdout, "listening on 8443 ✓\n".as_bytes()));

    let (path, server) = fake_engine(&dir, ok_response(&body), 3);
    let socket = EngineSocket::new(&path, Duration::from_secs(5));

    let output = socket.container_logs("xray-node-1").await.unwrap();
    assert_eq!(output.stdout_text(), "xray started\nlistening on 8443 ✓\n");
    assert_eq!(output.stderr_text(), "warning: weak cipher\n");
    assert_eq!(
        output.combined_logs(),
        "xray started\nlistening on 8443 ✓\n\n---stderr---\nwarning: weak cipher\n"
    );

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /containers/xray-node-1/logs?stdout=1&stderr=1 HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_exec_start_posts_attach_body() {
    let dir = tempfile::tempdir().unwrap();
    let body = encode_frame(StreamTarget::Stdout, b"{\"in\": 1, \"out\": 2}");
    let (path, server) = fake_engine(&dir, ok_response(&body), 64);
    let socket = EngineSocket::new(&path, Duration::from_secs(5));

    let output = socket.start_exec("exec-42").await.unwrap();
    assert_eq!(output.stdout_text(), "{\"in\": 1, \"out\": 2}");
    assert!(output.stderr.is_empty());

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /exec/exec-42/start HTTP/1.1\r\n"));
    assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
}

#[tokio::test]
async fn test_missing_container_is_rejected_with_status() {
    let dir = tempfile::tempdir().unwrap();
    let response =
        b"HTTP/1.0 404 Not Found\r\nContent-Type: application/json\r\n\r\n{\"message\":\"No such container: nope\"}"
            .to_vec();
    let (path, _server) = fake_engine(&dir, response, 16);
    let socket = EngineSocket::new(&path, Duration::from_secs(5));

    let err = socket.container_logs("nope").await.unwrap_err();
    match &err {
        RuntimeError::EngineRejected {
            status, message, ..
        } => {
            assert_eq!(*status, 404);
            assert!(message.contains("No such container"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_truncated_stream_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut body = encode_frame(StreamTarget::Stdout, b"complete frame");
    let partial = encode_frame(StreamTarget::Stdout, b"cut short");
    body.extend_from_slice(&partial[..partial.len() - 3]);

    let (path, _server) = fake_engine(&dir, ok_response(&body), 7);
    let socket = EngineSocket::new(&path, Duration::from_secs(5));

    let err = socket.container_logs("xray-node-2").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Framing(_)), "got {err:?}");
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let _server = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
        // Never sends a frame and never closes.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(conn);
    });

    let socket = EngineSocket::new(&path, Duration::from_millis(100));
    let err = socket.container_logs("xray-node-3").await.unwrap_err();
    assert!(matches!(err, RuntimeError::StreamTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_chunked_body_is_demultiplexed() {
    let dir = tempfile::tempdir().unwrap();
    let mut frames = encode_frame(StreamTarget::Stdout, b"inbound ready\n");
    frames.extend(encode_frame(StreamTarget::Stderr, b"tls: handshake timeout\n"));

    // Chunk boundaries deliberately fall inside frame headers.
    let mut response =
        b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.multiplexed-stream\r\nTransfer-Encoding: chunked\r\n\r\n"
            .to_vec();
    for piece in frames.chunks(5) {
        response.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
        response.extend_from_slice(piece);
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"0\r\n\r\n");

    let (path, _server) = fake_engine(&dir, response, 11);
    let socket = EngineSocket::new(&path, Duration::from_secs(5));

    let output = socket.container_logs("xray-node-5").await.unwrap();
    assert_eq!(output.stdout_text(), "inbound ready\n");
    assert_eq!(output.stderr_text(), "tls: handshake timeout\n");
}
