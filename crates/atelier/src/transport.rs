//! Transport Channel
//!
//! Frames and correlates request/response traffic with the worker. Each
//! request gets a fresh correlation id and a pending slot; a background
//! reader task matches responses to slots by id, so responses may arrive in
//! any order. Late responses for expired ids are discarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use atelier_protocol::wire::{LogMessage, ReadyMessage};
use atelier_protocol::{Frame, FrameReader, FrameWriter, MessageType, Request, Response};

use crate::error::{HostError, Result};
use crate::types::whole_millis;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cumulative request counters, shared across worker sessions
#[derive(Debug, Default)]
pub struct RequestStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_latency_us: AtomicU64,
}

/// Copy of [`RequestStats`] at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_response_time_ms: f64,
}

impl RequestStats {
    pub fn record(&self, success: bool, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let avg_response_time_ms = if total == 0 {
            0.0
        } else {
            latency_us as f64 / total as f64 / 1000.0
        };
        StatsSnapshot {
            total,
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_response_time_ms,
        }
    }
}

/// Reported at most once, when the stream to the worker becomes unusable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub reason: String,
}

/// Transport tuning
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub default_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_frame_bytes: atelier_protocol::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// State shared between callers and the reader task
struct Shared {
    pending: DashMap<u64, PendingRequest>,
    closed: AtomicBool,
    close_reason: parking_lot::Mutex<Option<HostError>>,
    fault_tx: parking_lot::Mutex<Option<oneshot::Sender<TransportFault>>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_error(&self) -> HostError {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or(HostError::ShuttingDown)
    }

    /// Close the channel and fail every pending request with `reason`.
    /// Returns false if it was already closed.
    fn close(&self, reason: HostError) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.close_reason.lock() = Some(reason.clone());

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(reason.clone()));
            }
        }
        true
    }

    /// Close because the stream broke, and tell the supervisor
    fn fault(&self, reason: String) {
        if !self.close(HostError::Process(reason.clone())) {
            return;
        }
        warn!(reason = %reason, "Worker channel faulted");
        if let Some(tx) = self.fault_tx.lock().take() {
            let _ = tx.send(TransportFault { reason });
        }
    }

    fn complete(&self, id: u64, outcome: impl FnOnce(&str) -> Result<Value>) {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                let result = outcome(&pending.method);
                let _ = pending.tx.send(result);
            }
            None => {
                debug!(correlation_id = id, "Discarding response for unknown or expired request");
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.msg_type {
            MessageType::Response => match frame.parse_json::<Response>() {
                Ok(response) => {
                    let id = response.id;
                    self.complete(id, |method| {
                        response
                            .into_result()
                            .map_err(|e| HostError::remote(method, e))
                    });
                }
                Err(e) => {
                    // Salvage the correlation id if the envelope is at least JSON
                    let id = serde_json::from_slice::<Value>(&frame.payload)
                        .ok()
                        .and_then(|v| v.get("id").and_then(Value::as_u64));
                    match id {
                        Some(id) => self.complete(id, |method| {
                            Err(HostError::Protocol(format!(
                                "malformed response to `{}`: {}",
                                method, e
                            )))
                        }),
                        None => warn!(error = %e, "Dropping undecodable response frame"),
                    }
                }
            },
            MessageType::Log => {
                if let Ok(log) = frame.parse_json::<LogMessage>() {
                    match log.level.as_str() {
                        "trace" => tracing::trace!(target: "worker", "{}", log.message),
                        "debug" => tracing::debug!(target: "worker", "{}", log.message),
                        "warn" => tracing::warn!(target: "worker", "{}", log.message),
                        "error" => tracing::error!(target: "worker", "{}", log.message),
                        _ => tracing::info!(target: "worker", "{}", log.message),
                    }
                }
            }
            MessageType::Ready => match frame.parse_json::<ReadyMessage>() {
                Ok(ready) => info!(version = %ready.version, pid = ready.pid, "Worker announced ready"),
                Err(_) => info!("Worker announced ready"),
            },
            other => {
                warn!("Unexpected message type from worker: {:?}", other);
            }
        }
    }
}

/// Removes the pending slot if the caller stops waiting (timeout or drop)
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// Correlating request/response channel to one worker session
pub struct Transport {
    writer: Mutex<FrameWriter<BoxedWriter>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    options: TransportOptions,
    stats: Arc<RequestStats>,
    reader_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Wrap a duplex byte stream and spawn the background reader.
    ///
    /// The returned receiver fires once if the stream fails; it is dropped
    /// silently on an orderly [`Transport::shutdown`].
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        options: TransportOptions,
        stats: Arc<RequestStats>,
    ) -> (Self, oneshot::Receiver<TransportFault>) {
        let (fault_tx, fault_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            close_reason: parking_lot::Mutex::new(None),
            fault_tx: parking_lot::Mutex::new(Some(fault_tx)),
        });

        let reader = FrameReader::with_max_len(reader, options.max_frame_bytes);
        let handle = tokio::spawn(reader_loop(reader, Arc::clone(&shared)));

        let transport = Self {
            writer: Mutex::new(FrameWriter::with_max_len(writer, options.max_frame_bytes)),
            shared,
            next_id: AtomicU64::new(1),
            options,
            stats,
            reader_handle: parking_lot::Mutex::new(Some(handle)),
        };
        (transport, fault_rx)
    }

    pub fn default_timeout(&self) -> Duration {
        self.options.default_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Send a request and wait for its response.
    ///
    /// Uses the default timeout when `timeout` is `None`. Safe to call
    /// concurrently.
    pub async fn send(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.options.default_timeout);
        let started = Instant::now();
        let outcome = self.send_inner(method, params, timeout).await;
        self.stats.record(outcome.is_ok(), started.elapsed());
        outcome
    }

    async fn send_inner(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        // One deadline covers the writer lock, the write and the reply
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || HostError::Timeout {
            method: method.to_string(),
            timeout_ms: whole_millis(timeout),
        };

        if self.shared.is_closed() {
            return Err(self.shared.close_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::json(MessageType::Request, &Request::new(id, method, params))?;
        // Oversized requests fail alone and never touch the stream
        frame.check_len(self.options.max_frame_bytes)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        // close() may have drained the map before our insert landed
        if self.shared.is_closed() {
            return Err(self.shared.close_error());
        }

        let mut writing = false;
        let written = tokio::time::timeout_at(deadline, async {
            let mut writer = self.writer.lock().await;
            writing = true;
            writer.send(&frame).await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = HostError::from(e);
                self.shared.fault(format!("write to worker failed: {}", err));
                return Err(err);
            }
            Err(_) => {
                if writing {
                    // A partial frame may be sitting in the pipe
                    self.shared
                        .fault(format!("write of `{}` stalled past its deadline", method));
                }
                debug!(method, correlation_id = id, "Request timed out before it was written");
                return Err(timed_out());
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.close_error()),
            Err(_) => {
                debug!(method, correlation_id = id, "Request timed out");
                Err(timed_out())
            }
        }
    }

    /// Dispatch every request, then wait for all of them.
    ///
    /// Results are in request order whatever order the responses arrive in,
    /// each paired with the time that member took.
    pub async fn send_batch(
        &self,
        requests: Vec<(String, Value)>,
        timeout: Option<Duration>,
    ) -> Vec<(Result<Value>, Duration)> {
        let calls = requests.into_iter().map(|(method, params)| async move {
            let started = Instant::now();
            let outcome = self.send(&method, params, timeout).await;
            (outcome, started.elapsed())
        });
        join_all(calls).await
    }

    /// Fail every pending request with `ShuttingDown` and refuse new ones
    pub fn shutdown(&self) {
        if self.shared.close(HostError::ShuttingDown) {
            // Orderly close: nobody should hear about a fault
            self.shared.fault_tx.lock().take();
            debug!("Transport shut down");
        }
    }

    /// Ask the worker to exit, then close our end of its input
    pub async fn send_stop(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(&Frame::empty(MessageType::Stop)).await?;
        writer.close().await?;
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
    }
}

async fn reader_loop(mut reader: FrameReader<BoxedReader>, shared: Arc<Shared>) {
    let reason = loop {
        match reader.recv().await {
            Ok(Some(frame)) => shared.dispatch(frame),
            Ok(None) => break "worker closed its output".to_string(),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Skipping undecodable frame from worker");
            }
            Err(e) => break format!("unrecoverable stream error: {}", e),
        }
    };

    if shared.is_closed() {
        debug!(reason = %reason, "Reader finished after shutdown");
        return;
    }
    shared.fault(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_protocol::methods;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type WorkerReader = FrameReader<ReadHalf<DuplexStream>>;
    type WorkerWriter = FrameWriter<WriteHalf<DuplexStream>>;

    type Pair = (
        Transport,
        oneshot::Receiver<TransportFault>,
        WorkerReader,
        WorkerWriter,
        Arc<RequestStats>,
    );

    fn pair(default_timeout: Duration) -> Pair {
        pair_with(
            64 * 1024,
            TransportOptions {
                default_timeout,
                ..Default::default()
            },
        )
    }

    fn pair_with(pipe_bytes: usize, options: TransportOptions) -> Pair {
        let (host, worker) = tokio::io::duplex(pipe_bytes);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let stats = Arc::new(RequestStats::default());
        let (transport, fault_rx) = Transport::new(
            Box::new(host_read),
            Box::new(host_write),
            options,
            Arc::clone(&stats),
        );
        (
            transport,
            fault_rx,
            FrameReader::new(worker_read),
            FrameWriter::new(worker_write),
            stats,
        )
    }

    async fn next_request(reader: &mut WorkerReader) -> Request {
        let frame = reader.recv().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Request);
        frame.parse_json().unwrap()
    }

    async fn reply(writer: &mut WorkerWriter, response: Response) {
        writer
            .send_json(MessageType::Response, &response)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched_by_id() {
        let (transport, _fault, mut reader, mut writer, _) = pair(Duration::from_secs(5));
        let transport = Arc::new(transport);

        let worker = tokio::spawn(async move {
            let first = next_request(&mut reader).await;
            let second = next_request(&mut reader).await;
            // Answer in reverse order
            for req in [second, first] {
                let echo = req.params["n"].clone();
                reply(&mut writer, Response::ok(req.id, echo)).await;
            }
            (reader, writer)
        });

        let a = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.send("echo", json!({"n": 1}), None).await })
        };
        let b = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.send("echo", json!({"n": 2}), None).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a, json!(1));
        assert_eq!(b, json!(2));
        assert_eq!(transport.pending_count(), 0);
        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_slot_and_late_response_is_discarded() {
        let (transport, _fault, mut reader, mut writer, stats) = pair(Duration::from_secs(5));

        let err = transport
            .send("slow", Value::Null, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HostError::Timeout {
                method: "slow".into(),
                timeout_ms: 30
            }
        );
        assert_eq!(transport.pending_count(), 0);

        // The worker answers after the deadline; nobody is waiting any more
        let late = next_request(&mut reader).await;
        reply(&mut writer, Response::ok(late.id, json!("too late"))).await;

        let worker = tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            reply(&mut writer, Response::ok(req.id, json!("pong"))).await;
            (reader, writer)
        });
        let result = transport.send("ping", Value::Null, None).await.unwrap();
        assert_eq!(result, json!("pong"));
        let _ = worker.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.successful, 1);
    }

    #[tokio::test]
    async fn test_remote_error_is_typed() {
        let (transport, _fault, mut reader, mut writer, _) = pair(Duration::from_secs(5));
        let worker = tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            reply(&mut writer, Response::err(req.id, "not_found", "no plugin x")).await;
            (reader, writer)
        });

        let err = transport.send("plugin.load", json!({}), None).await.unwrap_err();
        assert_eq!(
            err,
            HostError::Remote {
                method: "plugin.load".into(),
                code: "not_found".into(),
                message: "no plugin x".into()
            }
        );
        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_response_fails_only_its_request() {
        let (transport, _fault, mut reader, mut writer, _) = pair(Duration::from_secs(5));
        let worker = tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            // `error` must be an object; the id is still readable
            let bad = json!({"id": req.id, "error": "oops"});
            writer.send_json(MessageType::Response, &bad).await.unwrap();
            // Garbage without any id is dropped
            writer
                .send(&Frame::new(MessageType::Response, b"not json".to_vec()))
                .await
                .unwrap();
            let req = next_request(&mut reader).await;
            reply(&mut writer, Response::ok(req.id, json!(true))).await;
            (reader, writer)
        });

        let err = transport.send("first", Value::Null, None).await.unwrap_err();
        assert!(matches!(err, HostError::Protocol(_)));
        assert!(!transport.is_closed());

        let ok = transport.send("second", Value::Null, None).await.unwrap();
        assert_eq!(ok, json!(true));
        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_fails_pending_and_reports_fault() {
        let (transport, fault_rx, mut reader, writer, _) = pair(Duration::from_secs(5));
        let transport = Arc::new(transport);

        let pending = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.send("hang", Value::Null, None).await })
        };
        let _ = next_request(&mut reader).await;
        drop(writer);
        drop(reader);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, HostError::Process(_)));

        let fault = fault_rx.await.unwrap();
        assert!(fault.reason.contains("closed its output"));

        // Fail fast afterwards
        let err = transport.send("ping", Value::Null, None).await.unwrap_err();
        assert!(matches!(err, HostError::Process(_)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_without_fault() {
        let (transport, fault_rx, mut reader, _writer, _) = pair(Duration::from_secs(5));
        let transport = Arc::new(transport);

        let pending = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.send("hang", Value::Null, None).await })
        };
        let _ = next_request(&mut reader).await;

        transport.shutdown();
        assert_eq!(pending.await.unwrap().unwrap_err(), HostError::ShuttingDown);
        assert_eq!(
            transport.send("ping", Value::Null, None).await.unwrap_err(),
            HostError::ShuttingDown
        );
        assert!(fault_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_faults() {
        // The worker never drains its input, so the pipe fills mid-frame
        let (transport, mut fault_rx, _reader, _writer, _) =
            pair_with(1024, TransportOptions::default());
        let transport = Arc::new(transport);

        let queued = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                t.send(methods::PING, Value::Null, Some(Duration::from_millis(100)))
                    .await
            })
        };
        let big = json!({ "text": "x".repeat(8 * 1024) });
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send("plugin.call", big, Some(Duration::from_millis(100))),
        )
        .await
        .expect("send must honour its own timeout");
        assert!(matches!(outcome, Err(HostError::Timeout { timeout_ms: 100, .. })));

        // Requests queued behind the stuck write get their own deadline
        let queued = tokio::time::timeout(Duration::from_secs(2), queued)
            .await
            .expect("queued send must not hang")
            .unwrap();
        assert!(queued.is_err());

        assert!(transport.is_closed());
        let fault = fault_rx.try_recv().unwrap();
        assert!(fault.reason.contains("stalled"));
    }

    #[tokio::test]
    async fn test_oversized_request_fails_alone() {
        let (transport, mut fault_rx, mut reader, mut writer, _) = pair_with(
            64 * 1024,
            TransportOptions {
                default_timeout: Duration::from_secs(5),
                max_frame_bytes: 1024,
            },
        );

        let big = json!({ "text": "x".repeat(4 * 1024) });
        let err = transport.send("plugin.call", big, None).await.unwrap_err();
        assert!(matches!(err, HostError::Protocol(_)));
        assert!(!transport.is_closed());
        assert!(fault_rx.try_recv().is_err());

        let worker = tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            assert_eq!(req.method, methods::PING);
            reply(&mut writer, Response::ok(req.id, json!("pong"))).await;
            (reader, writer)
        });
        let pong = transport.send(methods::PING, Value::Null, None).await.unwrap();
        assert_eq!(pong, json!("pong"));
        let _ = worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_preserves_request_order() {
        let (transport, _fault, mut reader, mut writer, _) = pair(Duration::from_secs(5));
        let worker = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..4 {
                requests.push(next_request(&mut reader).await);
            }
            requests.reverse();
            for req in requests {
                let response = if req.method == "fail" {
                    Response::err(req.id, "internal", "boom")
                } else {
                    Response::ok(req.id, req.params.clone())
                };
                reply(&mut writer, response).await;
            }
            (reader, writer)
        });

        let results = transport
            .send_batch(
                vec![
                    ("echo".into(), json!(0)),
                    ("echo".into(), json!(1)),
                    ("fail".into(), json!(2)),
                    ("echo".into(), json!(3)),
                ],
                None,
            )
            .await;

        let results: Vec<Result<Value>> = results.into_iter().map(|(result, _)| result).collect();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap(), &json!(0));
        assert_eq!(results[1].as_ref().unwrap(), &json!(1));
        assert!(matches!(results[2], Err(HostError::Remote { .. })));
        assert_eq!(results[3].as_ref().unwrap(), &json!(3));
        let _ = worker.await.unwrap();
    }
}
