//! Saga state machines.
//!
//! A saga is a long-running process keyed by a correlation id. Each inbound
//! event is routed to the instance it correlates with, handled according to
//! the instance's current state, and the instance is saved (or deleted once
//! it completes) before any message the handler produced is released.
//!
//! ```text
//!   envelope ─► correlation id ─► lock(id) ─► load ─► behavior ─► save / delete ─► unlock ─► publish
//! ```

mod behavior;
mod builder;
mod lock;
mod machine;
mod registration;
mod repository;
mod state;

pub use behavior::{Behavior, Outgoing, SagaContext, SagaHandler};
pub use builder::{During, StateMachineBuilder};
pub use lock::{KeyedLock, KeyedLockGuard};
pub use machine::{SagaOutcome, StateMachine, UnmatchedEventPolicy};
pub use registration::SagaRegistration;
pub use repository::{InMemorySagaRepository, SagaInstance, SagaRepository};
pub use state::State;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Data a saga instance carries between events.
///
/// New instances start from `Default`.
pub trait SagaData: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}

impl<T> SagaData for T where T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}
