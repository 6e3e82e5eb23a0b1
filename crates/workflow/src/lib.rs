//! The cross-service order workflow.
//!
//! An order moves through three stages connected by the durable message
//! channel:
//!
//! ```text
//! client ─► AcceptStage ─► order.accepted ─► ProcessStage ─► order.processed ─► NotifyStage ─► push
//! ```
//!
//! - [`AcceptStage`] mints the correlation id, records the session mapping and
//!   initial state, then publishes. It never waits for the later stages.
//! - [`ProcessStage`] persists the order idempotently and records `Completed`.
//! - [`NotifyStage`] resolves the owning session and fans the status out over
//!   a [`PushChannel`].
//!
//! Every stage takes the correlation id explicitly, from the request or the
//! message, and carries it on its tracing span.

pub mod accept;
pub mod error;
pub mod notify;
pub mod process;
pub mod push;
pub mod status;

pub use accept::AcceptStage;
pub use error::{Dependency, Result, WorkflowError};
pub use notify::NotifyStage;
pub use process::ProcessStage;
pub use push::{
    Backplane, BackplaneMessage, BackplanePushChannel, BroadcastBackplane, ConnectionHub,
    LocalDelivery, PostgresBackplane, PushChannel, PushError, StatusNotification, run_relay,
};
pub use status::{ReportedStatus, StatusQuery, StatusReport};
