//! Atelier Worker
//!
//! Reference worker process. Speaks the frame protocol over stdio: requests
//! arrive on stdin, responses and log lines leave on stdout. Tracing output
//! goes to stderr so it never corrupts the frame stream.
//!
//! Usage: `atelier-worker [SEARCH_PATH...]`

mod catalog;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use atelier_protocol::wire::{error_codes, ReadyMessage};
use atelier_protocol::{FrameReader, FrameWriter, MessageType, Request, Response};

use catalog::Catalog;

fn main() -> Result<()> {
    // stdout is for frames
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let search_paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    info!("Worker starting with {} search path(s)", search_paths.len());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        Catalog::new(search_paths),
    ))
}

/// Answer requests until `Stop` or EOF
async fn serve<R, W>(reader: R, writer: W, mut catalog: Catalog) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    let ready = ReadyMessage {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
    };
    writer.send_json(MessageType::Ready, &ready).await?;

    loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Host closed connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping bad frame: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match frame.msg_type {
            MessageType::Request => {
                let response = match frame.parse_json::<Request>() {
                    Ok(request) => catalog.handle(request).await,
                    Err(e) => match request_id(&frame.payload) {
                        Some(id) => Response::err(id, error_codes::INVALID_PARAMS, e.to_string()),
                        None => {
                            warn!("Dropping request without an id: {}", e);
                            continue;
                        }
                    },
                };
                writer.send_json(MessageType::Response, &response).await?;
                for note in catalog.drain_notes() {
                    writer.send_json(MessageType::Log, &note).await?;
                }
            }
            MessageType::Stop => {
                info!("Received Stop");
                break;
            }
            other => warn!("Unexpected message type from host: {:?}", other),
        }
    }

    writer.close().await.ok();
    Ok(())
}

/// Id of a request whose body otherwise failed to parse
fn request_id(payload: &[u8]) -> Option<u64> {
    serde_json::from_slice::<Value>(payload)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_protocol::wire::{LogMessage, PingResult};
    use atelier_protocol::{methods, Frame, MANIFEST_FILE_NAME};
    use serde_json::json;

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("tts");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        std::fs::write(&manifest_path, r#"{"id": "tts_kokoro"}"#).unwrap();

        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let task = tokio::spawn(serve(
            worker_read,
            worker_write,
            Catalog::new(vec![root.path().to_path_buf()]),
        ));

        let (host_read, host_write) = tokio::io::split(host);
        let mut reader = FrameReader::new(host_read);
        let mut writer = FrameWriter::new(host_write);

        let ready = reader.recv().await.unwrap().unwrap();
        assert_eq!(ready.msg_type, MessageType::Ready);

        writer
            .send_json(MessageType::Request, &Request::new(1, methods::PING, Value::Null))
            .await
            .unwrap();
        let response: Response = reader.recv().await.unwrap().unwrap().parse_json().unwrap();
        assert_eq!(response.id, 1);
        let pong: PingResult = serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert_eq!(pong.version, env!("CARGO_PKG_VERSION"));

        let load = Request::new(
            2,
            methods::LOAD,
            json!({"plugin_id": "tts_kokoro", "path": manifest_path}),
        );
        writer.send_json(MessageType::Request, &load).await.unwrap();
        let response: Response = reader.recv().await.unwrap().unwrap().parse_json().unwrap();
        assert_eq!(response.id, 2);
        assert!(response.error.is_none());
        let log = reader.recv().await.unwrap().unwrap();
        assert_eq!(log.msg_type, MessageType::Log);
        let log: LogMessage = log.parse_json().unwrap();
        assert!(log.message.contains("tts_kokoro"));

        // Garbage body with a readable id still gets an answer
        writer
            .send(&Frame::new(MessageType::Request, br#"{"id": 3, "method": 7}"#.to_vec()))
            .await
            .unwrap();
        let response: Response = reader.recv().await.unwrap().unwrap().parse_json().unwrap();
        assert_eq!(response.id, 3);
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);

        writer.send(&Frame::empty(MessageType::Stop)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_ends_session() {
        let (host, worker) = tokio::io::duplex(1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let task = tokio::spawn(serve(worker_read, worker_write, Catalog::new(Vec::new())));

        let mut reader = FrameReader::new(host);
        let ready = reader.recv().await.unwrap().unwrap();
        assert_eq!(ready.msg_type, MessageType::Ready);
        drop(reader);
        task.await.unwrap().unwrap();
    }
}
