use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use super::context::ReceiveScope;
use super::registration::ConsumerRegistration;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::message::MessageType;

/// Message-type dispatch table for one endpoint.
#[derive(Default, Clone)]
pub struct Dispatcher {
    registrations: Vec<Arc<dyn ConsumerRegistration>>,
    table: HashMap<MessageType, Vec<usize>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, registration: Arc<dyn ConsumerRegistration>) {
        let index = self.registrations.len();
        for message_type in registration.message_types() {
            let slots = self.table.entry(message_type.clone()).or_default();
            if !slots.contains(&index) {
                slots.push(index);
            }
        }
        self.registrations.push(registration);
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn registrations(&self) -> &[Arc<dyn ConsumerRegistration>] {
        &self.registrations
    }

    /// Every subscribed message type, in registration order.
    pub fn subscriptions(&self) -> Vec<MessageType> {
        let mut types: Vec<MessageType> = Vec::new();
        for registration in &self.registrations {
            for message_type in registration.message_types() {
                if !types.contains(message_type) {
                    types.push(message_type.clone());
                }
            }
        }
        types
    }

    /// Registrations subscribed to any of the envelope's types, each once.
    pub fn matching(&self, envelope: &MessageEnvelope) -> Vec<&Arc<dyn ConsumerRegistration>> {
        let mut indices: Vec<usize> = envelope
            .message_types()
            .iter()
            .filter_map(|message_type| self.table.get(message_type))
            .flatten()
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| &self.registrations[i]).collect()
    }

    /// Invoke every matching registration once.
    ///
    /// A failing registration does not prevent the others from running; all
    /// failures are returned together. No match is `UnknownMessageType`.
    pub async fn dispatch(&self, envelope: &MessageEnvelope, scope: &ReceiveScope) -> Result<usize, DispatchFailure> {
        let matching = self.matching(envelope);
        if matching.is_empty() {
            return Err(DispatchFailure::Unmatched(BusError::UnknownMessageType {
                message_types: envelope.message_types().iter().map(ToString::to_string).collect(),
            }));
        }

        let results = join_all(
            matching
                .iter()
                .map(|registration| async move { (*registration, registration.consume(envelope, scope).await) }),
        )
        .await;

        let invoked = results.len();
        let failures: Vec<(Arc<dyn ConsumerRegistration>, BusError)> = results
            .into_iter()
            .filter_map(|(registration, result)| result.err().map(|e| (registration.clone(), e)))
            .collect();
        if failures.is_empty() {
            Ok(invoked)
        } else {
            Err(DispatchFailure::Consumers(failures))
        }
    }
}

/// Why an envelope was not fully consumed.
pub enum DispatchFailure {
    /// No registration subscribes to the envelope's types
    Unmatched(BusError),
    /// These registrations failed
    Consumers(Vec<(Arc<dyn ConsumerRegistration>, BusError)>),
}

impl DispatchFailure {
    /// The failure as a single error.
    pub fn into_error(self) -> BusError {
        match self {
            DispatchFailure::Unmatched(error) => error,
            DispatchFailure::Consumers(mut failures) if failures.len() == 1 => {
                failures.remove(0).1
            }
            DispatchFailure::Consumers(failures) => BusError::ConsumerFailed {
                consumer: failures
                    .iter()
                    .map(|(registration, _)| registration.name())
                    .collect::<Vec<_>>()
                    .join(", "),
                errors: failures.into_iter().map(|(_, error)| error).collect(),
            },
        }
    }
}

impl std::fmt::Debug for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchFailure::Unmatched(error) => f.debug_tuple("Unmatched").field(error).finish(),
            DispatchFailure::Consumers(failures) => f
                .debug_list()
                .entries(failures.iter().map(|(r, e)| (r.name(), e)))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::consumer::context::TelemetryContext;
    use crate::headers::Headers;
    use crate::producer::Producer;
    use crate::serialization::JsonSerializer;
    use crate::transport::in_memory::InMemoryTransport;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use smallvec::smallvec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Probe {
        name: &'static str,
        types: Vec<MessageType>,
        fail: bool,
        calls: AtomicU32,
    }

    impl Probe {
        fn new(name: &'static str, types: &[&'static str], fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                types: types.iter().map(|t| MessageType::from(*t)).collect(),
                fail,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ConsumerRegistration for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn message_types(&self) -> &[MessageType] {
            &self.types
        }

        fn use_error_queue(&self) -> bool {
            true
        }

        async fn consume(&self, _envelope: &MessageEnvelope, _scope: &ReceiveScope) -> BusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BusError::failure("probe.failed", self.name))
            } else {
                Ok(())
            }
        }
    }

    fn scope() -> ReceiveScope {
        let transport = InMemoryTransport::new();
        ReceiveScope::new(
            transport.address("probe").unwrap(),
            Producer::new(Arc::new(transport), Arc::new(JsonSerializer)),
            CancellationToken::new(),
            TelemetryContext::from_headers(&Headers::new()),
        )
    }

    fn envelope(types: &[&'static str]) -> MessageEnvelope {
        MessageEnvelope::create(types.iter().map(|t| MessageType::from(*t)).collect(), Vec::new(), None)
    }

    #[tokio::test]
    async fn test_polymorphic_match_invokes_each_registration_once() {
        let specific = Probe::new("specific", &["orders:OrderPlaced"], false);
        let general = Probe::new("general", &["orders:OrderEvent", "orders:OrderPlaced"], false);
        let unrelated = Probe::new("unrelated", &["billing:Charge"], false);
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(specific.clone());
        dispatcher.add(general.clone());
        dispatcher.add(unrelated.clone());

        let invoked = dispatcher
            .dispatch(&envelope(&["orders:OrderPlaced", "orders:OrderEvent"]), &scope())
            .await
            .unwrap();
        assert_eq!(invoked, 2);
        assert_eq!(specific.calls.load(Ordering::SeqCst), 1);
        assert_eq!(general.calls.load(Ordering::SeqCst), 1);
        assert_eq!(unrelated.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let failing = Probe::new("failing", &["a:A"], true);
        let healthy = Probe::new("healthy", &["a:A"], false);
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(failing.clone());
        dispatcher.add(healthy.clone());

        let failure = dispatcher.dispatch(&envelope(&["a:A"]), &scope()).await.unwrap_err();
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        match failure.into_error() {
            BusError::Failure { code, .. } => assert_eq!(code, "probe.failed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let dispatcher = Dispatcher::new();
        let smallvec_envelope = MessageEnvelope::create(smallvec![MessageType::from("x:Y")], Vec::new(), None);
        let failure = dispatcher.dispatch(&smallvec_envelope, &scope()).await.unwrap_err();
        assert!(matches!(
            failure,
            DispatchFailure::Unmatched(BusError::UnknownMessageType { .. })
        ));
    }
}
