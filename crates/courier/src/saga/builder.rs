use std::collections::HashMap;
use std::sync::Arc;

use super::behavior::Behavior;
use super::lock::KeyedLock;
use super::machine::{
    ActiveIn, Correlation, EventBinding, EventHandler, EventSlot, StateMachine, UnmatchedEventPolicy,
};
use super::state::State;
use super::SagaData;
use crate::error::{BusError, BusResult};
use crate::id::CorrelationId;
use crate::message::{Message, MessageType};

/// Fluent definition of a [`StateMachine`].
///
/// # Example
///
/// ```ignore
/// const AWAITING_PAYMENT: State = State::from_static("AwaitingPayment");
///
/// let machine = StateMachineBuilder::<OrderState>::new("OrderSaga")
///     .define_state(AWAITING_PAYMENT)
///     .correlate_by::<OrderPlaced>(|m| m.order_id.into())
///     .correlate_by::<PaymentReceived>(|m| m.order_id.into())
///     .initially(Behavior::new().transition_to(AWAITING_PAYMENT))
///     .during([AWAITING_PAYMENT])
///     .finalize::<PaymentReceived>()
///     .build()?;
/// ```
pub struct StateMachineBuilder<D> {
    name: String,
    states: Vec<State>,
    initial: State,
    events: HashMap<MessageType, Box<dyn EventSlot<D>>>,
    order: Vec<MessageType>,
    unmatched: UnmatchedEventPolicy,
    errors: Vec<String>,
}

impl<D: SagaData> StateMachineBuilder<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: vec![State::initial(), State::final_state()],
            initial: State::initial(),
            events: HashMap::new(),
            order: Vec::new(),
            unmatched: UnmatchedEventPolicy::default(),
            errors: Vec::new(),
        }
    }

    pub fn define_state(mut self, state: impl Into<State>) -> Self {
        let state = state.into();
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    /// State new instances start in; `Initial` unless overridden.
    pub fn initially_in(mut self, state: impl Into<State>) -> Self {
        self.initial = state.into();
        self
    }

    /// How to find the instance a message of type `M` belongs to.
    pub fn correlate_by<M: Message>(mut self, extract: impl Fn(&M) -> CorrelationId + Send + Sync + 'static) -> Self {
        if let Some(binding) = self.binding::<M>() {
            binding.correlation = Some(Correlation::Message(Arc::new(extract)));
        }
        self
    }

    /// Correlate `M` by its envelope's correlation id.
    pub fn correlate_by_envelope<M: Message>(mut self) -> Self {
        if let Some(binding) = self.binding::<M>() {
            binding.correlation = Some(Correlation::Envelope);
        }
        self
    }

    /// Handler that creates an instance when `M` arrives for an unseen id.
    pub fn initially<M: Message>(self, behavior: Behavior<D, M>) -> Self {
        self.add_handler(behavior, ActiveIn::Initial, true)
    }

    pub fn during<S: Into<State>>(self, states: impl IntoIterator<Item = S>) -> During<D> {
        During {
            builder: self,
            states: states.into_iter().map(Into::into).collect(),
        }
    }

    /// Handler for `M` in every state.
    pub fn during_any<M: Message>(self, behavior: Behavior<D, M>) -> Self {
        self.add_handler(behavior, ActiveIn::Any, false)
    }

    pub fn unmatched(mut self, policy: UnmatchedEventPolicy) -> Self {
        self.unmatched = policy;
        self
    }

    /// Validate and freeze the definition.
    ///
    /// Fails with `InvalidStateMachine` when a referenced state was never
    /// defined or one message type was bound to two Rust types.
    pub fn build(mut self) -> BusResult<StateMachine<D>> {
        if !self.states.contains(&self.initial) {
            self.errors
                .push(format!("initial state {} is not defined", self.initial));
        }
        for message_type in &self.order {
            let Some(slot) = self.events.get(message_type) else {
                continue;
            };
            for state in slot.referenced_states() {
                if !self.states.contains(&state) {
                    self.errors.push(format!(
                        "state {state} used by {message_type} is not defined"
                    ));
                }
            }
        }
        if !self.errors.is_empty() {
            self.errors.dedup();
            return Err(BusError::InvalidStateMachine {
                machine: self.name,
                reason: self.errors.join("; "),
            });
        }

        Ok(StateMachine {
            name: self.name,
            states: self.states,
            initial: self.initial,
            events: self.events,
            order: self.order,
            unmatched: self.unmatched,
            locks: KeyedLock::new(),
        })
    }

    fn add_handler<M: Message>(mut self, behavior: Behavior<D, M>, active_in: ActiveIn, can_initiate: bool) -> Self {
        if let Some(binding) = self.binding::<M>() {
            binding.handlers.push(EventHandler {
                behavior,
                active_in,
                can_initiate,
            });
        }
        self
    }

    fn binding<M: Message>(&mut self) -> Option<&mut EventBinding<D, M>> {
        let message_type = M::message_type();
        if !self.events.contains_key(&message_type) {
            self.order.push(message_type.clone());
        }
        let slot = self
            .events
            .entry(message_type.clone())
            .or_insert_with(|| Box::new(EventBinding::<D, M>::new()));
        match slot.as_any_mut().downcast_mut::<EventBinding<D, M>>() {
            Some(binding) => Some(binding),
            None => {
                self.errors.push(format!(
                    "message type {message_type} is bound to more than one Rust type"
                ));
                None
            }
        }
    }
}

/// Handlers active in a set of states; see [`StateMachineBuilder::during`].
pub struct During<D> {
    builder: StateMachineBuilder<D>,
    states: Vec<State>,
}

impl<D: SagaData> During<D> {
    pub fn when<M: Message>(mut self, behavior: Behavior<D, M>) -> Self {
        let active_in = ActiveIn::States(self.states.clone());
        self.builder = self.builder.add_handler(behavior, active_in, false);
        self
    }

    pub fn transition_to<M: Message>(self, state: impl Into<State>) -> Self {
        self.when(Behavior::<D, M>::new().transition_to(state))
    }

    pub fn finalize<M: Message>(self) -> Self {
        self.when(Behavior::<D, M>::new().finalize())
    }

    /// Start another state group.
    pub fn during<S: Into<State>>(self, states: impl IntoIterator<Item = S>) -> During<D> {
        self.builder.during(states)
    }

    pub fn during_any<M: Message>(self, behavior: Behavior<D, M>) -> StateMachineBuilder<D> {
        self.builder.during_any(behavior)
    }

    /// Back to the machine builder.
    pub fn end(self) -> StateMachineBuilder<D> {
        self.builder
    }

    pub fn build(self) -> BusResult<StateMachine<D>> {
        self.builder.build()
    }
}
