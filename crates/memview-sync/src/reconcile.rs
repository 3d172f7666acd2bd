use crate::api::{ApiError, MemoryApi};
use crate::connection::RefreshHandle;
use memview_core::wire::{AllocateRequest, NO_SUGGESTION};
use memview_core::Strategy;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Allocate,
    Deallocate,
    SuggestStrategy,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::Allocate => "allocation",
            CommandKind::Deallocate => "deallocation",
            CommandKind::SuggestStrategy => "strategy suggestion",
        })
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// Rejected locally; nothing was sent.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{command} request failed: {source}")]
    Request {
        command: CommandKind,
        #[source]
        source: ApiError,
    },
}

impl CommandError {
    fn request(command: CommandKind) -> impl FnOnce(ApiError) -> Self {
        move |source| CommandError::Request { command, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// Acknowledgement and observed state disagreed; the observed state won.
    SuccessWithWarning,
    Failure,
}

/// Effect a finished command has on the rest of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", content = "value", rename_all = "snake_case")]
pub enum FlowSignal {
    NavigateToProcess(String),
    ClearAllocation(String),
    StrategySelected(Strategy),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub command: CommandKind,
    pub kind: OutcomeKind,
    pub acknowledged: bool,
    /// Only set for commands that cross-check the snapshot.
    pub observed_present: Option<bool>,
    pub message: String,
    pub signal: Option<FlowSignal>,
}

impl CommandOutcome {
    fn failure(command: CommandKind, message: String) -> Self {
        Self {
            command,
            kind: OutcomeKind::Failure,
            acknowledged: false,
            observed_present: None,
            message,
            signal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind != OutcomeKind::Failure
    }

    pub fn navigate_to(&self) -> Option<&str> {
        match &self.signal {
            Some(FlowSignal::NavigateToProcess(pid)) => Some(pid),
            _ => None,
        }
    }
}

/// Final outcome of an allocate from its acknowledgement and what the
/// authoritative snapshot showed. The snapshot decides whenever the two
/// disagree.
pub fn decide_allocation(
    pid: &str,
    acknowledged: bool,
    observed_present: bool,
    failure_text: Option<&str>,
) -> CommandOutcome {
    let (kind, message, signal) = match (acknowledged, observed_present) {
        (true, true) => (
            OutcomeKind::Success,
            format!("Process {pid} allocated"),
            Some(FlowSignal::NavigateToProcess(pid.to_string())),
        ),
        (false, true) => (
            OutcomeKind::SuccessWithWarning,
            format!(
                "Backend reported a failure for {pid}, \
                 but its allocation is present in memory"
            ),
            Some(FlowSignal::NavigateToProcess(pid.to_string())),
        ),
        (_, false) => (
            OutcomeKind::Failure,
            failure_text
                .map(str::to_string)
                .unwrap_or_else(|| format!("Allocation of {pid} failed")),
            None,
        ),
    };
    CommandOutcome {
        command: CommandKind::Allocate,
        kind,
        acknowledged,
        observed_present: Some(observed_present),
        message,
        signal,
    }
}

/// The client's currently selected placement strategy.
#[derive(Debug, Clone)]
pub struct StrategyPreference {
    tx: Arc<watch::Sender<Strategy>>,
}

impl Default for StrategyPreference {
    fn default() -> Self {
        Self::new(Strategy::default())
    }
}

impl StrategyPreference {
    pub fn new(initial: Strategy) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Strategy {
        *self.tx.borrow()
    }

    pub fn set(&self, strategy: Strategy) {
        self.tx.send_replace(strategy);
    }

    pub fn subscribe(&self) -> watch::Receiver<Strategy> {
        self.tx.subscribe()
    }
}

/// Runs mutating commands and decides what the operator is told.
///
/// The coordinator never writes the shared view. After a successful mutation
/// it asks the connection owner for a refresh, when one was attached.
pub struct ReconciliationCoordinator<A: MemoryApi> {
    api: Arc<A>,
    preference: StrategyPreference,
    refresh: Option<RefreshHandle>,
}

impl<A: MemoryApi> ReconciliationCoordinator<A> {
    pub fn new(api: Arc<A>, preference: StrategyPreference) -> Self {
        Self {
            api,
            preference,
            refresh: None,
        }
    }

    pub fn with_refresh(mut self, refresh: RefreshHandle) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn preference(&self) -> &StrategyPreference {
        &self.preference
    }

    /// Allocates `size` units for `pid`, then cross-checks the fresh snapshot.
    /// `None` uses the selected strategy preference.
    ///
    /// Network failures come back as [`CommandError::Request`] and are never
    /// retried.
    pub async fn allocate(
        &self,
        pid: &str,
        size: u64,
        strategy: Option<Strategy>,
    ) -> Result<CommandOutcome, CommandError> {
        let pid = validate_pid(pid)?;
        if size == 0 {
            return Err(CommandError::Validation(
                "size must be a positive integer".to_string(),
            ));
        }
        let strategy = strategy.unwrap_or_else(|| self.preference.get());

        let request = AllocateRequest::new(pid, size, strategy);
        let ack = self
            .api
            .allocate(&request)
            .await
            .map_err(CommandError::request(CommandKind::Allocate))?;
        let acknowledged = ack.is_success();
        debug!(
            event = "command_acknowledged",
            command = %CommandKind::Allocate,
            pid,
            size,
            strategy = %strategy,
            acknowledged
        );

        let report = self
            .api
            .fetch_snapshot()
            .await
            .map_err(CommandError::request(CommandKind::Allocate))?;
        for record in &report.errors {
            warn!(event = "malformed_record", index = record.index, error = %record.error);
        }
        let observed_present = report
            .blocks
            .iter()
            .any(|block| block.occupant_pid() == Some(pid));

        let outcome = decide_allocation(pid, acknowledged, observed_present, ack.failure_text());
        if acknowledged != observed_present {
            warn!(
                event = "reconciliation_discrepancy",
                pid,
                acknowledged,
                observed_present,
                outcome = ?outcome.kind
            );
        }
        if outcome.is_success() {
            self.request_refresh();
        }
        Ok(outcome)
    }

    /// Single round trip; the acknowledgement alone decides.
    pub async fn deallocate(&self, pid: &str) -> Result<CommandOutcome, CommandError> {
        let pid = validate_pid(pid)?;
        let ack = self
            .api
            .deallocate(pid)
            .await
            .map_err(CommandError::request(CommandKind::Deallocate))?;
        let acknowledged = ack.is_success();
        debug!(
            event = "command_acknowledged",
            command = %CommandKind::Deallocate,
            pid,
            acknowledged
        );

        if !acknowledged {
            let message = ack
                .failure_text()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Deallocation of {pid} failed"));
            return Ok(CommandOutcome::failure(CommandKind::Deallocate, message));
        }
        self.request_refresh();
        Ok(CommandOutcome {
            command: CommandKind::Deallocate,
            kind: OutcomeKind::Success,
            acknowledged,
            observed_present: None,
            message: format!("Process {pid} deallocated"),
            signal: Some(FlowSignal::ClearAllocation(pid.to_string())),
        })
    }

    /// Asks the backend for a strategy and selects it on success.
    pub async fn suggest_strategy(&self, size: u64) -> Result<CommandOutcome, CommandError> {
        if size == 0 {
            return Err(CommandError::Validation(
                "size must be a positive integer".to_string(),
            ));
        }
        let response = self
            .api
            .suggest_strategy(size)
            .await
            .map_err(CommandError::request(CommandKind::SuggestStrategy))?;
        let suggested = response.suggested_strategy.trim();
        debug!(
            event = "command_acknowledged",
            command = %CommandKind::SuggestStrategy,
            size,
            suggested
        );

        if suggested.eq_ignore_ascii_case(NO_SUGGESTION) {
            return Ok(CommandOutcome::failure(
                CommandKind::SuggestStrategy,
                format!("No free block can hold {size} units"),
            ));
        }
        let strategy: Strategy = match suggested.parse() {
            Ok(strategy) => strategy,
            Err(err) => {
                warn!(event = "unknown_suggestion", suggested, error = %err);
                return Ok(CommandOutcome::failure(
                    CommandKind::SuggestStrategy,
                    format!("Backend suggested an unknown strategy: {suggested}"),
                ));
            }
        };
        self.preference.set(strategy);
        Ok(CommandOutcome {
            command: CommandKind::SuggestStrategy,
            kind: OutcomeKind::Success,
            acknowledged: true,
            observed_present: None,
            message: format!("Suggested strategy for {size} units: {strategy}"),
            signal: Some(FlowSignal::StrategySelected(strategy)),
        })
    }

    fn request_refresh(&self) {
        if let Some(refresh) = &self.refresh {
            if !refresh.request() {
                debug!(event = "refresh_unavailable");
            }
        }
    }
}

fn validate_pid(pid: &str) -> Result<&str, CommandError> {
    let trimmed = pid.trim();
    if trimmed.is_empty() {
        return Err(CommandError::Validation(
            "process id must not be blank".to_string(),
        ));
    }
    Ok(trimmed)
}
