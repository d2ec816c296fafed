#![forbid(unsafe_code)]

pub mod coalesce;
pub mod error;
pub mod key;
pub mod metrics;
pub mod serial;

pub use coalesce::{Coalesced, Coalescer, CoalescerBuilder, Pending, Registry};
pub use error::{CoalesceError, KeyError};
pub use key::{ArgNode, ArgValue, CallKey, Json, KeyArg, KeyEncoder, derive_key};
pub use metrics::CoalesceMetrics;
pub use serial::{
    DrainEvent, DrainListener, DrainSubscription, ListenerId, SerialGate, SerialGuard, Serialized,
};
