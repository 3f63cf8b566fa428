use std::sync::Arc;

use async_trait::async_trait;

use super::repository::SagaInstance;
use super::state::State;
use super::SagaData;
use crate::address::EndpointAddress;
use crate::consumer::ReceiveScope;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::id::CorrelationId;
use crate::message::Message;

/// A message produced by a saga handler, held until the instance is persisted.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Publish(MessageEnvelope),
    Send(EndpointAddress, MessageEnvelope),
}

/// What a saga handler sees: the event, the instance and a buffered outbox.
pub struct SagaContext<D, M> {
    message: Arc<M>,
    envelope: MessageEnvelope,
    instance: SagaInstance<D>,
    scope: ReceiveScope,
    outgoing: Vec<Outgoing>,
    completed: bool,
}

impl<D: SagaData, M: Message> SagaContext<D, M> {
    pub fn new(message: Arc<M>, envelope: MessageEnvelope, instance: SagaInstance<D>, scope: ReceiveScope) -> Self {
        Self {
            message,
            envelope,
            instance,
            scope,
            outgoing: Vec::new(),
            completed: false,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.instance.correlation_id
    }

    pub fn instance(&self) -> &SagaInstance<D> {
        &self.instance
    }

    pub fn data(&self) -> &D {
        &self.instance.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.instance.data
    }

    pub fn current_state(&self) -> State {
        self.instance.state()
    }

    pub fn transition_to(&mut self, state: impl Into<State>) {
        self.instance.current_state = state.into().name().to_string();
    }

    /// Remove the instance once this event has been handled.
    pub fn set_complete(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed || self.instance.state().is_final()
    }

    /// Publish once the instance has been persisted.
    pub fn publish<T: Message>(&mut self, message: &T) -> BusResult<()> {
        let envelope = self.scope.follow_up(&self.envelope, message)?;
        self.outgoing.push(Outgoing::Publish(envelope));
        Ok(())
    }

    /// Send to `address` once the instance has been persisted.
    pub fn send<T: Message>(&mut self, address: &EndpointAddress, message: &T) -> BusResult<()> {
        let envelope = self.scope.follow_up(&self.envelope, message)?;
        self.outgoing.push(Outgoing::Send(address.clone(), envelope));
        Ok(())
    }

    pub fn outgoing(&self) -> &[Outgoing] {
        &self.outgoing
    }

    pub(crate) fn into_parts(self) -> (SagaInstance<D>, Vec<Outgoing>, bool) {
        let completed = self.is_completed();
        (self.instance, self.outgoing, completed)
    }
}

/// Async step of a [`Behavior`].
#[async_trait]
pub trait SagaHandler<D, M>: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut SagaContext<D, M>) -> anyhow::Result<()>;
}

type SyncActivity<D, M> = Arc<dyn Fn(&mut SagaContext<D, M>) -> anyhow::Result<()> + Send + Sync>;

enum Activity<D, M> {
    Then(SyncActivity<D, M>),
    Handle(Arc<dyn SagaHandler<D, M>>),
    TransitionTo(State),
    Finalize,
}

impl<D, M> Clone for Activity<D, M> {
    fn clone(&self) -> Self {
        match self {
            Activity::Then(f) => Activity::Then(f.clone()),
            Activity::Handle(h) => Activity::Handle(h.clone()),
            Activity::TransitionTo(state) => Activity::TransitionTo(state.clone()),
            Activity::Finalize => Activity::Finalize,
        }
    }
}

/// Ordered activities run when an event is accepted.
///
/// # Example
///
/// ```ignore
/// Behavior::new()
///     .then(|ctx| { ctx.data_mut().total = ctx.message().total; Ok(()) })
///     .handle(ReserveInventory)
///     .transition_to(AWAITING_PAYMENT)
/// ```
pub struct Behavior<D, M> {
    activities: Vec<Activity<D, M>>,
}

impl<D, M> Clone for Behavior<D, M> {
    fn clone(&self) -> Self {
        Self {
            activities: self.activities.clone(),
        }
    }
}

impl<D: SagaData, M: Message> Default for Behavior<D, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: SagaData, M: Message> Behavior<D, M> {
    pub fn new() -> Self {
        Self {
            activities: Vec::new(),
        }
    }

    pub fn then<F>(mut self, activity: F) -> Self
    where
        F: Fn(&mut SagaContext<D, M>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.activities.push(Activity::Then(Arc::new(activity)));
        self
    }

    pub fn handle<H: SagaHandler<D, M>>(mut self, handler: H) -> Self {
        self.activities.push(Activity::Handle(Arc::new(handler)));
        self
    }

    pub fn transition_to(mut self, state: impl Into<State>) -> Self {
        self.activities.push(Activity::TransitionTo(state.into()));
        self
    }

    pub fn finalize(mut self) -> Self {
        self.activities.push(Activity::Finalize);
        self
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// States this behavior transitions to.
    pub(crate) fn target_states(&self) -> Vec<State> {
        self.activities
            .iter()
            .filter_map(|activity| match activity {
                Activity::TransitionTo(state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Run every activity in order, stopping at the first failure.
    pub async fn execute(&self, ctx: &mut SagaContext<D, M>) -> BusResult<()> {
        for activity in &self.activities {
            match activity {
                Activity::Then(f) => f(ctx).map_err(BusError::from_anyhow)?,
                Activity::Handle(handler) => handler.handle(ctx).await.map_err(BusError::from_anyhow)?,
                Activity::TransitionTo(state) => ctx.transition_to(state.clone()),
                Activity::Finalize => ctx.transition_to(State::final_state()),
            }
        }
        Ok(())
    }
}
