use crate::api::MemoryApi;
use crate::transport::{Channel, Connector, Sleeper};
use crate::view::{SharedView, ViewReader, ViewSource};
use memview_core::wire::{parse_snapshot_message, HANDSHAKE};
use memview_core::{
    transition, BackoffPolicy, ConnectionState, LinkAction, LinkEvent, LinkState, ParseReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REFRESH_QUEUE_CAPACITY: usize = 4;

/// Asks the connection owner to re-fetch the authoritative snapshot.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(REFRESH_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Returns false once the connection owner is gone. A full queue already
    /// guarantees a pending refresh, so the request coalesces.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Owns the single live channel and the single reconnect timer.
///
/// Nothing runs until [`connect`](Self::connect). Further `connect` calls on
/// the same instance are no-ops, including after the link exhausted its
/// retries; recovery from `Exhausted` means building a new manager.
pub struct ConnectionManager<C: Connector, S: Sleeper, A: MemoryApi> {
    connector: Arc<C>,
    sleeper: Arc<S>,
    api: Arc<A>,
    policy: BackoffPolicy,
    view: Option<SharedView>,
    reader: ViewReader,
    state_tx: Option<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    refresh: RefreshHandle,
    refresh_rx: Option<mpsc::Receiver<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<C: Connector, S: Sleeper, A: MemoryApi> ConnectionManager<C, S, A> {
    pub fn new(connector: C, sleeper: S, api: Arc<A>, policy: BackoffPolicy) -> Self {
        let (view, reader) = SharedView::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (refresh, refresh_rx) = RefreshHandle::channel();
        Self {
            connector: Arc::new(connector),
            sleeper: Arc::new(sleeper),
            api,
            policy,
            view: Some(view),
            reader,
            state_tx: Some(state_tx),
            state_rx,
            refresh,
            refresh_rx: Some(refresh_rx),
            shutdown_tx: None,
            task: None,
        }
    }

    /// Starts the link. Returns false when this instance was already started.
    pub fn connect(&mut self) -> bool {
        if self.task.is_some() {
            debug!(event = "connect_ignored", state = %self.state());
            return false;
        }
        let (Some(view), Some(state_tx), Some(refresh_rx)) = (
            self.view.take(),
            self.state_tx.take(),
            self.refresh_rx.take(),
        ) else {
            return false;
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = LinkDriver {
            connector: self.connector.clone(),
            sleeper: self.sleeper.clone(),
            api: self.api.clone(),
            policy: self.policy,
            view,
            state_tx,
            refresh_rx,
            shutdown_rx,
            link: LinkState::default(),
            channel: None,
            pending_delay: None,
        };
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(tokio::spawn(driver.run()));
        true
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn view(&self) -> ViewReader {
        self.reader.clone()
    }

    pub fn refresh_handle(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    /// Cancels any pending reconnect timer, closes any open channel and waits
    /// for the driver to exit. Dropping the manager has the same effect
    /// without the wait.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(event = "link_driver_join_failed", error = %err);
            }
        }
    }
}

struct LinkDriver<C: Connector, S: Sleeper, A: MemoryApi> {
    connector: Arc<C>,
    sleeper: Arc<S>,
    api: Arc<A>,
    policy: BackoffPolicy,
    view: SharedView,
    state_tx: watch::Sender<ConnectionState>,
    refresh_rx: mpsc::Receiver<()>,
    shutdown_rx: oneshot::Receiver<()>,
    link: LinkState,
    channel: Option<C::Channel>,
    pending_delay: Option<Duration>,
}

impl<C: Connector, S: Sleeper, A: MemoryApi> LinkDriver<C, S, A> {
    async fn run(mut self) {
        let mut next = Some(LinkEvent::ConnectRequested);
        while let Some(event) = next.take() {
            next = self.apply(event).await;
            if next.is_none() {
                next = self.wait().await;
            }
        }
        debug!(event = "link_driver_exit", state = %self.link.phase);
    }

    /// Runs one transition and performs its actions. Returns a follow-up
    /// event when an action itself failed.
    async fn apply(&mut self, event: LinkEvent) -> Option<LinkEvent> {
        let step = transition(self.link, event, &self.policy);
        if step.next.phase != self.link.phase {
            info!(
                event = "connection_state",
                from = %self.link.phase,
                to = %step.next.phase,
                trigger = ?event
            );
        }
        self.link = step.next;
        self.state_tx.send_replace(self.link.phase);

        for action in step.actions {
            match action {
                // Performed by `wait` while the link is in `Connecting`.
                LinkAction::OpenChannel => {}
                LinkAction::SendHandshake => {
                    let Some(channel) = self.channel.as_mut() else {
                        continue;
                    };
                    if let Err(err) = channel.send_text(HANDSHAKE).await {
                        warn!(event = "handshake_failed", error = %err);
                        return Some(LinkEvent::Closed);
                    }
                }
                LinkAction::FetchSnapshot => self.refresh().await,
                LinkAction::ScheduleReconnect { attempt, delay } => {
                    info!(
                        event = "reconnect_scheduled",
                        attempt,
                        delay_ms = delay.as_millis() as u64
                    );
                    self.pending_delay = Some(delay);
                }
                LinkAction::CancelTimer => {
                    self.pending_delay = None;
                }
                LinkAction::CloseChannel => {
                    if let Some(mut channel) = self.channel.take() {
                        channel.close().await;
                    }
                }
                LinkAction::GiveUp { failures } => {
                    error!(event = "reconnect_exhausted", failures);
                }
            }
        }
        None
    }

    async fn wait(&mut self) -> Option<LinkEvent> {
        match self.link.phase {
            ConnectionState::Connecting => self.open().await,
            ConnectionState::Connected => self.pump().await,
            ConnectionState::Disconnected => {
                let delay = self.pending_delay.take()?;
                self.backoff(delay).await
            }
            ConnectionState::Exhausted => None,
        }
    }

    async fn open(&mut self) -> Option<LinkEvent> {
        debug!(event = "channel_connecting", attempt = self.link.attempt);
        tokio::select! {
            _ = &mut self.shutdown_rx => Some(LinkEvent::Shutdown),
            result = self.connector.connect() => match result {
                Ok(channel) => {
                    self.channel = Some(channel);
                    Some(LinkEvent::Opened)
                }
                Err(err) => {
                    warn!(event = "channel_connect_error", error = %err);
                    Some(LinkEvent::Closed)
                }
            },
        }
    }

    async fn pump(&mut self) -> Option<LinkEvent> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return Some(LinkEvent::Closed);
            };
            tokio::select! {
                _ = &mut self.shutdown_rx => return Some(LinkEvent::Shutdown),
                message = channel.next_text() => match message {
                    Some(Ok(text)) => self.ingest(&text),
                    Some(Err(err)) => {
                        warn!(event = "channel_error", error = %err);
                        return Some(LinkEvent::Closed);
                    }
                    None => {
                        info!(event = "channel_closed");
                        return Some(LinkEvent::Closed);
                    }
                },
                Some(()) = self.refresh_rx.recv() => self.refresh().await,
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Option<LinkEvent> {
        let sleeper = self.sleeper.clone();
        let timer = sleeper.sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => return Some(LinkEvent::Shutdown),
                _ = &mut timer => return Some(LinkEvent::TimerFired),
                Some(()) = self.refresh_rx.recv() => self.refresh().await,
            }
        }
    }

    fn ingest(&self, text: &str) {
        match parse_snapshot_message(text) {
            Ok(report) => self.publish(report, ViewSource::Channel),
            Err(err) => warn!(event = "snapshot_message_dropped", error = %err),
        }
    }

    async fn refresh(&self) {
        match self.api.fetch_snapshot().await {
            Ok(report) => self.publish(report, ViewSource::Fetch),
            Err(err) => warn!(event = "snapshot_fetch_failed", error = %err),
        }
    }

    fn publish(&self, report: ParseReport, source: ViewSource) {
        for record in &report.errors {
            warn!(
                event = "malformed_record",
                index = record.index,
                error = %record.error
            );
        }
        let snapshot = self.view.publish(report.blocks, source);
        debug!(
            event = "snapshot_published",
            revision = snapshot.revision,
            source = ?source,
            blocks = snapshot.blocks.len(),
            dropped = report.errors.len()
        );
    }
}
