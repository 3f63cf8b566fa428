use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::behavior::{Behavior, Outgoing, SagaContext};
use super::lock::KeyedLock;
use super::repository::{SagaInstance, SagaRepository};
use super::state::State;
use super::SagaData;
use crate::consumer::{route_skipped, ReceiveScope};
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::id::CorrelationId;
use crate::message::{Message, MessageType};
use crate::serialization;

/// What to do with an event that has no handler in the instance's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedEventPolicy {
    /// Log and acknowledge
    Ignore,
    /// Fail with `SagaEventUnmatched`
    #[default]
    Error,
    /// Move the message to the endpoint's skipped queue
    DeadLetter,
}

/// Result of dispatching one event to a saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    Created { correlation_id: CorrelationId, state: State },
    Updated { correlation_id: CorrelationId, state: State },
    Completed { correlation_id: CorrelationId },
    Ignored { correlation_id: CorrelationId, state: State },
    DeadLettered { correlation_id: CorrelationId, state: State },
}

impl SagaOutcome {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            SagaOutcome::Created { correlation_id, .. }
            | SagaOutcome::Updated { correlation_id, .. }
            | SagaOutcome::Completed { correlation_id }
            | SagaOutcome::Ignored { correlation_id, .. }
            | SagaOutcome::DeadLettered { correlation_id, .. } => *correlation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActiveIn {
    /// The machine's initial state
    Initial,
    /// Listed states; an empty list matches any state
    States(Vec<State>),
    Any,
}

impl ActiveIn {
    fn contains(&self, state: &State, initial: &State) -> bool {
        match self {
            ActiveIn::Initial => state == initial,
            ActiveIn::States(states) => states.is_empty() || states.contains(state),
            ActiveIn::Any => true,
        }
    }

    fn states(&self) -> &[State] {
        match self {
            ActiveIn::States(states) => states,
            _ => &[],
        }
    }
}

pub(crate) struct EventHandler<D, M> {
    pub(crate) behavior: Behavior<D, M>,
    pub(crate) active_in: ActiveIn,
    pub(crate) can_initiate: bool,
}

type MessageCorrelation<M> = Arc<dyn Fn(&M) -> CorrelationId + Send + Sync>;

pub(crate) enum Correlation<M> {
    Message(MessageCorrelation<M>),
    Envelope,
}

/// Handlers and correlation for one message type.
pub(crate) struct EventBinding<D, M> {
    pub(crate) correlation: Option<Correlation<M>>,
    pub(crate) handlers: Vec<EventHandler<D, M>>,
}

impl<D, M> EventBinding<D, M> {
    pub(crate) fn new() -> Self {
        Self {
            correlation: None,
            handlers: Vec::new(),
        }
    }
}

/// Type-erased [`EventBinding`].
#[async_trait]
pub(crate) trait EventSlot<D>: Send + Sync {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn message_type(&self) -> MessageType;

    /// States named by active-in sets and transitions.
    fn referenced_states(&self) -> Vec<State>;

    async fn dispatch(
        &self,
        machine: &StateMachine<D>,
        envelope: &MessageEnvelope,
        scope: &ReceiveScope,
        repository: &dyn SagaRepository<D>,
    ) -> BusResult<SagaOutcome>;
}

#[async_trait]
impl<D: SagaData, M: Message> EventSlot<D> for EventBinding<D, M> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn message_type(&self) -> MessageType {
        M::message_type()
    }

    fn referenced_states(&self) -> Vec<State> {
        self.handlers
            .iter()
            .flat_map(|handler| {
                handler
                    .active_in
                    .states()
                    .iter()
                    .cloned()
                    .chain(handler.behavior.target_states())
            })
            .collect()
    }

    async fn dispatch(
        &self,
        machine: &StateMachine<D>,
        envelope: &MessageEnvelope,
        scope: &ReceiveScope,
        repository: &dyn SagaRepository<D>,
    ) -> BusResult<SagaOutcome> {
        let correlation = self.correlation.as_ref().ok_or_else(|| BusError::MissingCorrelation {
            message_type: M::MESSAGE_TYPE.to_string(),
        })?;
        let message: M = serialization::deserialize(scope.serializer(), envelope.body(), M::MESSAGE_TYPE)?;
        let correlation_id = match correlation {
            Correlation::Message(extract) => extract(&message),
            Correlation::Envelope => envelope.correlation_id(),
        };

        let guard = machine.locks.lock(correlation_id).await;

        let (instance, handler) = match repository.load(correlation_id).await? {
            Some(instance) => {
                let state = instance.state();
                match self
                    .handlers
                    .iter()
                    .find(|handler| handler.active_in.contains(&state, &machine.initial))
                {
                    Some(handler) => (instance, handler),
                    None => {
                        drop(guard);
                        return machine
                            .unmatched(envelope, scope, correlation_id, state, M::MESSAGE_TYPE)
                            .await;
                    }
                }
            }
            None => match self.handlers.iter().find(|handler| handler.can_initiate) {
                Some(handler) => (
                    SagaInstance::new(correlation_id, &machine.initial, D::default()),
                    handler,
                ),
                None => return Err(BusError::SagaNotFound { correlation_id }),
            },
        };

        let created = instance.is_new();
        let mut ctx = SagaContext::new(Arc::new(message), envelope.clone(), instance, scope.clone());
        handler.behavior.execute(&mut ctx).await?;
        let (mut instance, outgoing, completed) = ctx.into_parts();

        let outcome = if completed {
            if !created {
                repository.delete(correlation_id).await?;
            }
            SagaOutcome::Completed { correlation_id }
        } else {
            repository.save(&mut instance).await?;
            let state = instance.state();
            if created {
                SagaOutcome::Created { correlation_id, state }
            } else {
                SagaOutcome::Updated { correlation_id, state }
            }
        };
        drop(guard);

        debug!(
            saga = %machine.name,
            correlation_id = %correlation_id,
            state = %instance.current_state,
            outgoing = outgoing.len(),
            "Saga event handled"
        );
        release(scope, outgoing).await?;
        Ok(outcome)
    }
}

async fn release(scope: &ReceiveScope, outgoing: Vec<Outgoing>) -> BusResult<()> {
    let producer = scope.producer();
    for message in outgoing {
        match message {
            Outgoing::Publish(envelope) => producer.publish_envelope(envelope, scope.cancellation()).await?,
            Outgoing::Send(address, envelope) => {
                producer
                    .send_envelope(&address, envelope, scope.cancellation())
                    .await?
            }
        }
    }
    Ok(())
}

/// An immutable saga definition produced by
/// [`StateMachineBuilder`](super::StateMachineBuilder).
///
/// Dispatch serializes work per correlation id: load, handle and save for
/// one instance never overlap, while different instances proceed in
/// parallel.
pub struct StateMachine<D> {
    pub(crate) name: String,
    pub(crate) states: Vec<State>,
    pub(crate) initial: State,
    pub(crate) events: HashMap<MessageType, Box<dyn EventSlot<D>>>,
    pub(crate) order: Vec<MessageType>,
    pub(crate) unmatched: UnmatchedEventPolicy,
    pub(crate) locks: KeyedLock<CorrelationId>,
}

impl<D: SagaData> StateMachine<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defined states, sentinels first.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn initial_state(&self) -> &State {
        &self.initial
    }

    pub fn unmatched_policy(&self) -> UnmatchedEventPolicy {
        self.unmatched
    }

    /// Event types in registration order.
    pub fn message_types(&self) -> &[MessageType] {
        &self.order
    }

    /// Route `envelope` to the handler for its message type.
    ///
    /// The first of the envelope's types known to this machine wins.
    /// Nothing is persisted or released when the handler fails.
    pub async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        scope: &ReceiveScope,
        repository: &dyn SagaRepository<D>,
    ) -> BusResult<SagaOutcome> {
        let slot = envelope
            .message_types()
            .iter()
            .find_map(|message_type| self.events.get(message_type))
            .ok_or_else(|| BusError::UnknownMessageType {
                message_types: envelope
                    .message_types()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })?;
        slot.dispatch(self, envelope, scope, repository).await
    }

    async fn unmatched(
        &self,
        envelope: &MessageEnvelope,
        scope: &ReceiveScope,
        correlation_id: CorrelationId,
        state: State,
        message_type: &str,
    ) -> BusResult<SagaOutcome> {
        let error = BusError::SagaEventUnmatched {
            correlation_id,
            state: state.name().to_string(),
            message_type: message_type.to_string(),
        };
        match self.unmatched {
            UnmatchedEventPolicy::Ignore => {
                warn!(saga = %self.name, correlation_id = %correlation_id, %state, %message_type, "Unmatched saga event ignored");
                Ok(SagaOutcome::Ignored { correlation_id, state })
            }
            UnmatchedEventPolicy::Error => Err(error),
            UnmatchedEventPolicy::DeadLetter => {
                route_skipped(scope, envelope, &error).await?;
                Ok(SagaOutcome::DeadLettered { correlation_id, state })
            }
        }
    }
}

impl<D> std::fmt::Debug for StateMachine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.states)
            .field("initial", &self.initial)
            .field("events", &self.order)
            .field("unmatched", &self.unmatched)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::consumer::TelemetryContext;
    use crate::headers::Headers;
    use crate::producer::Producer;
    use crate::saga::{InMemorySagaRepository, StateMachineBuilder};
    use crate::serialization::JsonSerializer;
    use crate::transport::in_memory::InMemoryTransport;
    use crate::transport::Transport;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Opened {
        ticket: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Closed {
        ticket: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Reopened {
        ticket: Uuid,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Escalated {
        ticket: Uuid,
    }

    crate::impl_message!(Opened, "support:Opened");
    crate::impl_message!(Closed, "support:Closed");
    crate::impl_message!(Reopened, "support:Reopened");
    crate::impl_message!(Escalated, "support:Escalated");

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Ticket {
        touches: u32,
    }

    const OPEN: State = State::from_static("Open");

    fn machine(policy: UnmatchedEventPolicy) -> StateMachine<Ticket> {
        StateMachineBuilder::new("TicketSaga")
            .define_state(OPEN)
            .correlate_by::<Opened>(|m| m.ticket.into())
            .correlate_by::<Closed>(|m| m.ticket.into())
            .correlate_by::<Reopened>(|m| m.ticket.into())
            .initially(
                Behavior::<Ticket, Opened>::new()
                    .then(|ctx| {
                        ctx.data_mut().touches += 1;
                        let ticket = ctx.message().ticket;
                        ctx.publish(&Escalated { ticket })?;
                        Ok(())
                    })
                    .transition_to(OPEN),
            )
            .during([OPEN])
            .finalize::<Closed>()
            .end()
            .unmatched(policy)
            .build()
            .unwrap()
    }

    struct Harness {
        transport: InMemoryTransport,
        scope: ReceiveScope,
        producer: Producer,
    }

    fn harness() -> Harness {
        let transport = InMemoryTransport::new();
        let producer = Producer::new(Arc::new(transport.clone()), Arc::new(JsonSerializer));
        let scope = ReceiveScope::new(
            transport.address("ticket-saga").unwrap(),
            producer.clone(),
            CancellationToken::new(),
            TelemetryContext::from_headers(&Headers::new()),
        );
        Harness {
            transport,
            scope,
            producer,
        }
    }

    #[tokio::test]
    async fn test_initiate_then_finalize_removes_instance() {
        let h = harness();
        let escalations = h.transport.broker().queue("escalations");
        h.transport
            .broker()
            .bind(&Escalated::message_type(), escalations.clone());
        let machine = machine(UnmatchedEventPolicy::Error);
        let repository = InMemorySagaRepository::<Ticket>::new();
        let ticket = Uuid::new_v4();

        let opened = h.producer.envelope(&Opened { ticket }, None).unwrap();
        let outcome = machine.dispatch(&opened, &h.scope, &repository).await.unwrap();
        assert_eq!(
            outcome,
            SagaOutcome::Created {
                correlation_id: ticket.into(),
                state: OPEN,
            }
        );
        let stored = repository.load(ticket.into()).await.unwrap().unwrap();
        assert_eq!(stored.data.touches, 1);
        assert_eq!(stored.version, 1);
        assert_eq!(escalations.depth(), 1, "published after save");

        let closed = h.producer.envelope(&Closed { ticket }, None).unwrap();
        let outcome = machine.dispatch(&closed, &h.scope, &repository).await.unwrap();
        assert_eq!(outcome, SagaOutcome::Completed { correlation_id: ticket.into() });
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn test_non_initiating_event_for_unknown_saga_fails() {
        let h = harness();
        let machine = machine(UnmatchedEventPolicy::Error);
        let repository = InMemorySagaRepository::<Ticket>::new();
        let ticket = Uuid::new_v4();

        let closed = h.producer.envelope(&Closed { ticket }, None).unwrap();
        let err = machine.dispatch(&closed, &h.scope, &repository).await.unwrap_err();
        assert_eq!(err, BusError::SagaNotFound { correlation_id: ticket.into() });
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_policies() {
        let h = harness();
        let ticket = Uuid::new_v4();
        let opened = h.producer.envelope(&Opened { ticket }, None).unwrap();
        let reopened = h.producer.envelope(&Reopened { ticket }, None).unwrap();

        let strict = machine(UnmatchedEventPolicy::Error);
        let repository = InMemorySagaRepository::<Ticket>::new();
        strict.dispatch(&opened, &h.scope, &repository).await.unwrap();
        let err = strict.dispatch(&reopened, &h.scope, &repository).await.unwrap_err();
        assert!(matches!(err, BusError::SagaEventUnmatched { ref state, .. } if state == "Open"));

        let lenient = machine(UnmatchedEventPolicy::Ignore);
        let outcome = lenient.dispatch(&reopened, &h.scope, &repository).await.unwrap();
        assert!(matches!(outcome, SagaOutcome::Ignored { .. }));

        let dead_letter = machine(UnmatchedEventPolicy::DeadLetter);
        dead_letter.dispatch(&reopened, &h.scope, &repository).await.unwrap();
        let skipped = h.transport.broker().queue("ticket-saga_skipped");
        assert_eq!(skipped.depth(), 1);
        assert_eq!(repository.load(ticket.into()).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_failed_handler_persists_and_publishes_nothing() {
        let h = harness();
        let escalations = h.transport.broker().queue("escalations");
        h.transport
            .broker()
            .bind(&Escalated::message_type(), escalations.clone());
        let machine = StateMachineBuilder::<Ticket>::new("Flaky")
            .correlate_by::<Opened>(|m| m.ticket.into())
            .initially(
                Behavior::<Ticket, Opened>::new()
                    .then(|ctx| {
                        let ticket = ctx.message().ticket;
                        ctx.publish(&Escalated { ticket })?;
                        Ok(())
                    })
                    .then(|_| anyhow::bail!("crm unavailable")),
            )
            .build()
            .unwrap();
        let repository = InMemorySagaRepository::<Ticket>::new();

        let opened = h.producer.envelope(&Opened { ticket: Uuid::new_v4() }, None).unwrap();
        let err = machine.dispatch(&opened, &h.scope, &repository).await.unwrap_err();
        assert_eq!(err.code(), "consumer.exception");
        assert!(repository.is_empty());
        assert_eq!(escalations.depth(), 0);
    }

    #[tokio::test]
    async fn test_missing_correlation_is_reported() {
        let h = harness();
        let machine = StateMachineBuilder::<Ticket>::new("Uncorrelated")
            .initially(Behavior::<Ticket, Opened>::new())
            .build()
            .unwrap();
        let opened = h.producer.envelope(&Opened { ticket: Uuid::new_v4() }, None).unwrap();
        let err = machine
            .dispatch(&opened, &h.scope, &InMemorySagaRepository::<Ticket>::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BusError::MissingCorrelation {
                message_type: "support:Opened".into()
            }
        );
    }
}
