//! In-process fakes for the transport, timer and API seams.

use crate::api::{ApiError, MemoryApi};
use crate::transport::{Channel, Connector, Sleeper, TransportError};
use memview_core::wire::{
    AllocateAck, AllocateRequest, DeallocateAck, SuggestResponse, STATUS_FAILED, STATUS_SUCCESS,
};
use memview_core::{parse_blocks, LogEntry, ParseReport};
use std::collections::VecDeque;
use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) struct FakeChannel {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
    reject_sends: Arc<AtomicBool>,
}

/// Test side of a [`FakeChannel`]: push frames, drop to close.
pub(crate) struct ChannelFeed {
    pub tx: mpsc::UnboundedSender<Result<String, TransportError>>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicUsize>,
    /// While set, every send fails.
    pub reject_sends: Arc<AtomicBool>,
}

pub(crate) fn fake_channel() -> (FakeChannel, ChannelFeed) {
    let (tx, inbound) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicUsize::new(0));
    let reject_sends = Arc::new(AtomicBool::new(false));
    (
        FakeChannel {
            inbound,
            sent: sent.clone(),
            closed: closed.clone(),
            reject_sends: reject_sends.clone(),
        },
        ChannelFeed {
            tx,
            sent,
            closed,
            reject_sends,
        },
    )
}

impl Channel for FakeChannel {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("broken pipe".to_string()));
        }
        self.sent.lock().expect("sent lock").push(text.to_string());
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out scripted channels in order; fails once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    pub script: Mutex<VecDeque<FakeChannel>>,
    pub attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn with_channels(channels: Vec<FakeChannel>) -> Self {
        Self {
            script: Mutex::new(channels.into()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for Arc<ScriptedConnector> {
    type Channel = FakeChannel;

    async fn connect(&self) -> Result<FakeChannel, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script lock").pop_front();
        next.ok_or_else(|| TransportError::Connect("connection refused".to_string()))
    }
}

/// Records every requested delay and returns at once.
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    pub delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays_ms(&self) -> Vec<u64> {
        self.delays
            .lock()
            .expect("delays lock")
            .iter()
            .map(|delay| delay.as_millis() as u64)
            .collect()
    }
}

impl Sleeper for Arc<RecordingSleeper> {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().expect("delays lock").push(delay);
        tokio::task::yield_now().await;
    }
}

/// A timer that never fires.
pub(crate) struct StalledSleeper;

impl Sleeper for StalledSleeper {
    async fn sleep(&self, _delay: Duration) {
        pending::<()>().await;
    }
}

/// Scripted backend. `None` in an ack slot means the request fails at the
/// network level.
pub(crate) struct FakeApi {
    pub memory: Mutex<Vec<String>>,
    pub allocate_ack: Mutex<Option<AllocateAck>>,
    pub deallocate_ack: Mutex<Option<DeallocateAck>>,
    pub suggestion: Mutex<Option<String>>,
    pub snapshot_available: Mutex<bool>,
    pub log_script: Mutex<VecDeque<Result<Vec<LogEntry>, String>>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn with_memory(records: &[&str]) -> Self {
        Self {
            memory: Mutex::new(records.iter().map(|record| record.to_string()).collect()),
            allocate_ack: Mutex::new(None),
            deallocate_ack: Mutex::new(None),
            suggestion: Mutex::new(None),
            snapshot_available: Mutex::new(true),
            log_script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn ack(status: &str, error: Option<&str>) -> AllocateAck {
        AllocateAck {
            status: Some(status.to_string()),
            memory: None,
            error: error.map(str::to_string),
            reason: None,
        }
    }

    pub fn deallocate_ok() -> DeallocateAck {
        DeallocateAck {
            status: Some(STATUS_SUCCESS.to_string()),
            reason: None,
            memory: None,
        }
    }

    pub fn deallocate_failed(reason: &str) -> DeallocateAck {
        DeallocateAck {
            status: Some(STATUS_FAILED.to_string()),
            reason: Some(reason.to_string()),
            memory: None,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn offline(path: &str) -> ApiError {
        ApiError::Request {
            path: path.to_string(),
            message: "connection refused".to_string(),
        }
    }
}

impl MemoryApi for FakeApi {
    async fn allocate(&self, request: &AllocateRequest) -> Result<AllocateAck, ApiError> {
        self.record(format!("allocate {} {} {}", request.pid, request.size, request.strategy));
        self.allocate_ack
            .lock()
            .expect("ack lock")
            .clone()
            .ok_or_else(|| Self::offline("/allocate"))
    }

    async fn deallocate(&self, pid: &str) -> Result<DeallocateAck, ApiError> {
        self.record(format!("deallocate {pid}"));
        self.deallocate_ack
            .lock()
            .expect("ack lock")
            .clone()
            .ok_or_else(|| Self::offline("/deallocate"))
    }

    async fn suggest_strategy(&self, size: u64) -> Result<SuggestResponse, ApiError> {
        self.record(format!("suggest {size}"));
        self.suggestion
            .lock()
            .expect("suggestion lock")
            .clone()
            .map(|suggested_strategy| SuggestResponse { suggested_strategy })
            .ok_or_else(|| Self::offline("/suggest-strategy"))
    }

    async fn fetch_snapshot(&self) -> Result<ParseReport, ApiError> {
        self.record("fetch_snapshot".to_string());
        if !*self.snapshot_available.lock().expect("snapshot lock") {
            return Err(Self::offline("/memory"));
        }
        let memory = self.memory.lock().expect("memory lock").clone();
        Ok(parse_blocks(memory))
    }

    async fn fetch_process_log(&self, pid: &str) -> Result<Vec<LogEntry>, ApiError> {
        self.record(format!("fetch_process_log {pid}"));
        let next = self.log_script.lock().expect("log lock").pop_front();
        match next {
            Some(Ok(entries)) => Ok(entries),
            Some(Err(message)) => Err(ApiError::Status {
                path: "/process-log".to_string(),
                status: 500,
                body: message,
            }),
            None => Err(Self::offline("/process-log")),
        }
    }
}
