//! Events delivered to user callbacks.

use spacetimedb_client_api_messages::energy::EnergyQuanta;
use spacetimedb_client_api_messages::websocket::UpdateStatus;
use spacetimedb_sats::{ConnectionId, Identity, ProductValue, Timestamp};

/// Why a batch of row callbacks is firing.
#[derive(Clone, Debug)]
pub enum Event {
    /// A reducer ran and the connection knows which one.
    Reducer(ReducerEvent),
    /// A subscription's initial rows were applied.
    SubscribeApplied,
    /// A subscription ended and its rows were removed.
    UnsubscribeApplied,
    /// The server reported a subscription failure.
    SubscriptionError(Box<str>),
    /// Rows changed under a transaction the connection cannot attribute:
    /// light-mode updates, unknown reducers, or undecodable reducer args.
    UnknownTransaction,
}

/// A reducer run reported by the server.
#[derive(Clone, Debug)]
pub struct ReducerEvent {
    /// The time when the reducer started running.
    pub timestamp: Timestamp,
    /// Whether the reducer committed, was aborted due to insufficient energy,
    /// or failed with an error message.
    pub status: Status,
    /// The identity of the caller.
    pub caller_identity: Identity,
    /// The connection id of the caller, or `None` for scheduled reducers
    /// and HTTP calls made without one.
    pub caller_connection_id: Option<ConnectionId>,
    /// The amount of energy consumed by the reducer run.
    pub energy_consumed: EnergyQuanta,
    /// The reducer that ran and its decoded arguments.
    pub reducer: ReducerCall,
}

#[derive(Clone, Debug)]
pub struct ReducerCall {
    pub reducer_name: Box<str>,
    /// Positional arguments, decoded against the reducer's argument schema.
    pub args: ProductValue,
}

/// The termination status of a reducer run.
#[derive(Clone, Debug)]
pub enum Status {
    Committed,
    Failed(Box<str>),
    OutOfEnergy,
}

impl Status {
    pub(crate) fn from_update_status(status: &UpdateStatus) -> Self {
        match status {
            UpdateStatus::Committed(_) => Status::Committed,
            UpdateStatus::Failed(message) => Status::Failed(message.clone()),
            UpdateStatus::OutOfEnergy => Status::OutOfEnergy,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Status::Committed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Status::Failed(_))
    }

    /// The error message, if the reducer failed.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Status::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// Passed to every callback: the event being dispatched and a handle to the
/// connection that produced it, so callbacks can read tables or call
/// reducers.
#[derive(Clone)]
pub struct EventContext {
    pub db: crate::db_connection::DbConnection,
    pub event: Event,
}
