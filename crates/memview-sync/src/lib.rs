//! Runtime side of the memory viewer: the live channel with bounded
//! reconnection, the shared view, backend commands with reconciliation and
//! process log polling.

pub mod api;
pub mod connection;
pub mod log_poller;
pub mod reconcile;
pub mod transport;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, HttpApi, MemoryApi, DEFAULT_TIMEOUT};
pub use connection::{ConnectionManager, RefreshHandle};
pub use log_poller::{LogPoller, LogView, DEFAULT_POLL_INTERVAL};
pub use reconcile::{
    decide_allocation, CommandError, CommandKind, CommandOutcome, FlowSignal, OutcomeKind,
    ReconciliationCoordinator, StrategyPreference,
};
pub use transport::{
    Channel, Connector, Sleeper, TokioSleeper, TransportError, WsChannel, WsConnector,
};
pub use view::{ViewReader, ViewSnapshot, ViewSource};
