use crate::api::MemoryApi;
use crate::transport::Sleeper;
use chrono::{DateTime, Utc};
use memview_core::LogEntry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Latest successfully fetched history of one process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogView {
    pub pid: String,
    pub entries: Vec<LogEntry>,
    /// Bumped on every successful fetch; 0 until the first one lands.
    pub generation: u64,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Polls a process history while it is being viewed.
///
/// Fetches run one after another, so a slow response can never overwrite a
/// newer one. Failed fetches keep the previous entries.
pub struct LogPoller {
    rx: watch::Receiver<Arc<LogView>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LogPoller {
    pub fn start<A: MemoryApi, S: Sleeper>(
        api: Arc<A>,
        sleeper: S,
        pid: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let pid = pid.into();
        let (tx, rx) = watch::channel(Arc::new(LogView {
            pid: pid.clone(),
            entries: Vec::new(),
            generation: 0,
            fetched_at: None,
        }));
        let (stop_tx, stop_rx) = oneshot::channel();
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        info!(event = "log_poll_start", pid = %pid, interval_ms = interval.as_millis() as u64);
        let task = tokio::spawn(poll_loop(api, sleeper, pid, interval, tx, stop_rx));
        Self {
            rx,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn current(&self) -> Arc<LogView> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<LogView>> {
        self.rx.clone()
    }

    /// Cancels the poll timer. A fetch already in flight runs to completion
    /// and its result is discarded.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(event = "log_poller_join_failed", error = %err);
            }
        }
    }
}

async fn poll_loop<A: MemoryApi, S: Sleeper>(
    api: Arc<A>,
    sleeper: S,
    pid: String,
    interval: Duration,
    tx: watch::Sender<Arc<LogView>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut generation = 0u64;
    loop {
        let fetched = api.fetch_process_log(&pid).await;
        if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            debug!(event = "log_poll_discarded", pid = %pid);
            break;
        }
        match fetched {
            Ok(entries) => {
                generation += 1;
                debug!(
                    event = "log_poll_updated",
                    pid = %pid,
                    generation,
                    entries = entries.len()
                );
                tx.send_replace(Arc::new(LogView {
                    pid: pid.clone(),
                    entries,
                    generation,
                    fetched_at: Some(Utc::now()),
                }));
            }
            Err(err) => debug!(event = "log_poll_failed", pid = %pid, error = %err),
        }

        tokio::select! {
            _ = &mut stop_rx => break,
            _ = sleeper.sleep(interval) => {}
        }
    }
    info!(event = "log_poll_stop", pid = %pid, generation);
}
