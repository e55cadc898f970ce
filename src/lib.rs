pub mod client;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod queue;
pub mod routes;
pub mod snapshot;
pub mod state;
pub mod store;

pub use client::{FlagClient, FlagClientBuilder};
pub use error::{ApiError, ClientError, ConsumerError, StoreError};
pub use evaluation::{evaluate, EvaluationContext, EvaluationDetail, Flag, Reason, Segment};
pub use snapshot::Snapshot;
