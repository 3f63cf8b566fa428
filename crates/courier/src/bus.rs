//! Composition root.
//!
//! [`BusBuilder`] collects consumers and sagas into receive endpoints;
//! [`Bus`] starts them and is the application's entry point for publishing
//! and sending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::address::EndpointAddress;
use crate::cancel::CancellationToken;
use crate::config::{BusConfig, EndpointConfig, EndpointSettings};
use crate::consumer::{
    kebab_case, Consumer, ConsumerRegistration, Dispatcher, ReceivePipeline, TypedConsumerRegistration,
};
use crate::envelope::MessageEnvelope;
use crate::error::BusResult;
use crate::headers::{self, Headers};
use crate::id::{ConversationId, CorrelationId, MessageId};
use crate::message::Message;
use crate::producer::{Producer, ScheduledMessage};
use crate::saga::{SagaData, SagaRegistration, SagaRepository, StateMachine};
use crate::serialization::{JsonSerializer, Serializer};
use crate::transport::in_memory::InMemoryTransport;
use crate::transport::{ReceiveEndpoint, Transport};

type RegistrationFactory =
    Box<dyn FnOnce(&EndpointSettings, &BusConfig) -> Arc<dyn ConsumerRegistration> + Send>;

/// Registrations and settings collected for one endpoint.
///
/// `sizing` holds the queue and worker settings taken from the first
/// consumer definition. `settings` are explicit `receive_endpoint` overrides
/// and apply to the endpoint and to every registration on it.
struct EndpointPlan {
    name: String,
    sizing: EndpointSettings,
    settings: EndpointSettings,
    registrations: Vec<RegistrationFactory>,
}

impl EndpointPlan {
    fn new(name: &str, sizing: EndpointSettings) -> Self {
        Self {
            name: name.to_string(),
            sizing: sizing.endpoint_wide(),
            settings: EndpointSettings::default(),
            registrations: Vec::new(),
        }
    }

    fn endpoint_settings(&self) -> EndpointSettings {
        self.sizing.merge(&self.settings)
    }

    fn add_consumer<M: Message, C: Consumer<M>>(&mut self, consumer: C) {
        let definition = consumer.definition();
        self.registrations.push(Box::new(move |endpoint, defaults| {
            let config = definition.endpoint_settings().merge(endpoint).resolve(defaults);
            Arc::new(TypedConsumerRegistration::<M, C>::new(consumer, &definition, &config))
        }));
    }

    fn add_saga<D: SagaData>(&mut self, machine: Arc<StateMachine<D>>, repository: Arc<dyn SagaRepository<D>>) {
        self.registrations.push(Box::new(move |endpoint, defaults| {
            Arc::new(SagaRegistration::new(machine, repository, &endpoint.resolve(defaults)))
        }));
    }
}

/// Configures one explicitly named endpoint; see [`BusBuilder::receive_endpoint`].
pub struct ReceiveEndpointConfigurator<'a> {
    plan: &'a mut EndpointPlan,
}

impl ReceiveEndpointConfigurator<'_> {
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn consumer<M: Message, C: Consumer<M>>(&mut self, consumer: C) -> &mut Self {
        self.plan.add_consumer::<M, C>(consumer);
        self
    }

    pub fn saga<D: SagaData>(
        &mut self,
        machine: Arc<StateMachine<D>>,
        repository: Arc<dyn SagaRepository<D>>,
    ) -> &mut Self {
        self.plan.add_saga(machine, repository);
        self
    }

    /// Layer more settings on this endpoint.
    pub fn settings(&mut self, settings: &EndpointSettings) -> &mut Self {
        self.plan.settings = self.plan.settings.merge(settings);
        self
    }
}

/// Builder for [`Bus`].
///
/// # Example
///
/// ```ignore
/// let bus = BusBuilder::new()
///     .config(BusConfig::from_env())
///     .add_consumer::<OrderPlaced, _>(OrderPlacedConsumer)
///     .add_saga(Arc::new(order_saga), Arc::new(InMemorySagaRepository::new()))
///     .build()?;
/// bus.start().await?;
/// ```
pub struct BusBuilder {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    plans: Vec<EndpointPlan>,
    index: HashMap<String, usize>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self {
            config: BusConfig::default(),
            transport: None,
            serializer: None,
            plans: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Bus-wide defaults every endpoint inherits.
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker binding; the in-memory transport if unset.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Body codec; JSON if unset.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Register `consumer` on the endpoint named by its definition.
    ///
    /// Consumers sharing an endpoint name share one queue and worker pool.
    pub fn add_consumer<M: Message, C: Consumer<M>>(mut self, consumer: C) -> Self {
        let definition = consumer.definition();
        self.plan(definition.endpoint_name(), || definition.endpoint_settings())
            .add_consumer::<M, C>(consumer);
        self
    }

    /// Register a saga on the endpoint named after the machine (kebab-case).
    pub fn add_saga<D: SagaData>(
        mut self,
        machine: Arc<StateMachine<D>>,
        repository: Arc<dyn SagaRepository<D>>,
    ) -> Self {
        let name = kebab_case(machine.name());
        self.plan(&name, EndpointSettings::default).add_saga(machine, repository);
        self
    }

    /// Configure an endpoint by name; `settings` override bus defaults.
    pub fn receive_endpoint(
        mut self,
        name: &str,
        settings: EndpointSettings,
        configure: impl FnOnce(&mut ReceiveEndpointConfigurator<'_>),
    ) -> Self {
        let plan = self.plan(name, EndpointSettings::default);
        plan.settings = plan.settings.merge(&settings);
        configure(&mut ReceiveEndpointConfigurator { plan });
        self
    }

    /// Resolve configuration and endpoint addresses.
    ///
    /// Fails when an endpoint name is not a valid address on the transport.
    pub fn build(self) -> BusResult<Bus> {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()));
        let serializer = self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer));
        let producer = Producer::new(transport.clone(), serializer);

        let mut endpoints = Vec::with_capacity(self.plans.len());
        for plan in self.plans {
            let address = transport.address(&plan.name)?;
            let config = plan.endpoint_settings().resolve(&self.config);
            let mut dispatcher = Dispatcher::new();
            for factory in plan.registrations {
                dispatcher.add(factory(&plan.settings, &self.config));
            }
            // Each registration resolved its own error-queue setting
            let use_error_queue = dispatcher
                .registrations()
                .iter()
                .any(|registration| registration.use_error_queue());
            let pipeline = ReceivePipeline::new(address.clone(), dispatcher, producer.clone(), use_error_queue);
            endpoints.push(EndpointSpec {
                address,
                config,
                pipeline: Arc::new(pipeline),
            });
        }

        Ok(Bus {
            config: self.config,
            transport,
            producer,
            specs: endpoints,
            running: Mutex::new(Vec::new()),
        })
    }

    fn plan(&mut self, name: &str, settings: impl FnOnce() -> EndpointSettings) -> &mut EndpointPlan {
        let index = match self.index.get(name) {
            Some(index) => *index,
            None => {
                self.plans.push(EndpointPlan::new(name, settings()));
                self.index.insert(name.to_string(), self.plans.len() - 1);
                self.plans.len() - 1
            }
        };
        &mut self.plans[index]
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct EndpointSpec {
    address: EndpointAddress,
    config: EndpointConfig,
    pipeline: Arc<ReceivePipeline>,
}

/// Envelope options for [`Bus::publish_with`] and [`Bus::send_with`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: Option<ConversationId>,
    pub tenant_id: Option<String>,
    pub headers: Headers,
    pub time_to_live: Option<Duration>,
    pub response_address: Option<EndpointAddress>,
    pub fault_address: Option<EndpointAddress>,
    /// Publish after this delay instead of immediately
    pub delay: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn conversation_id(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn response_address(mut self, address: EndpointAddress) -> Self {
        self.response_address = Some(address);
        self
    }

    pub fn fault_address(mut self, address: EndpointAddress) -> Self {
        self.fault_address = Some(address);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn apply(self, mut envelope: MessageEnvelope) -> MessageEnvelope {
        envelope = envelope.with_headers(&self.headers);
        if let Some(tenant_id) = self.tenant_id {
            envelope = envelope.with_header(headers::TENANT_ID, tenant_id);
        }
        if let Some(conversation_id) = self.conversation_id {
            envelope = envelope.with_conversation_id(conversation_id);
        }
        if let Some(ttl) = self.time_to_live {
            envelope = envelope.with_time_to_live(ttl);
        }
        if let Some(address) = self.response_address {
            envelope = envelope.with_response_address(address);
        }
        if let Some(address) = self.fault_address {
            envelope = envelope.with_fault_address(address);
        }
        envelope
    }
}

/// A configured message bus.
pub struct Bus {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    producer: Producer,
    specs: Vec<EndpointSpec>,
    running: Mutex<Vec<Arc<dyn ReceiveEndpoint>>>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Address of a named queue on this bus's transport.
    pub fn address(&self, name: &str) -> BusResult<EndpointAddress> {
        self.transport.address(name)
    }

    /// Addresses of the configured receive endpoints.
    pub fn endpoint_addresses(&self) -> Vec<&EndpointAddress> {
        self.specs.iter().map(|spec| &spec.address).collect()
    }

    pub async fn is_running(&self) -> bool {
        !self.running.lock().await.is_empty()
    }

    /// Create and start every receive endpoint.
    ///
    /// If any endpoint fails to start, the ones already started are stopped
    /// and the error is returned. Starting a running bus does nothing.
    pub async fn start(&self) -> BusResult<()> {
        let mut running = self.running.lock().await;
        if !running.is_empty() {
            warn!("Bus already started");
            return Ok(());
        }

        for spec in &self.specs {
            let started = async {
                let endpoint = self
                    .transport
                    .create_receive_endpoint(spec.address.clone(), spec.config.clone(), spec.pipeline.clone())
                    .await?;
                endpoint.start().await?;
                BusResult::Ok(endpoint)
            }
            .await;

            match started {
                Ok(endpoint) => running.push(endpoint),
                Err(e) => {
                    error!(address = %spec.address, error = %e, "Endpoint failed to start");
                    stop_all(running.drain(..).rev().collect()).await;
                    return Err(e);
                }
            }
        }

        info!(endpoints = running.len(), scheme = %self.transport.scheme(), "Bus started");
        Ok(())
    }

    /// Stop every endpoint, waiting for in-flight messages, and drop
    /// scheduled publications.
    pub async fn stop(&self) -> BusResult<()> {
        self.producer.cancel_scheduled();
        let endpoints: Vec<_> = self.running.lock().await.drain(..).collect();
        let count = endpoints.len();
        let result = stop_all(endpoints).await;
        info!(endpoints = count, "Bus stopped");
        result
    }

    /// Publish `message` to every subscribed endpoint.
    pub async fn publish<M: Message>(&self, message: &M) -> BusResult<MessageId> {
        self.publish_with(message, PublishOptions::default()).await
    }

    pub async fn publish_with<M: Message>(&self, message: &M, options: PublishOptions) -> BusResult<MessageId> {
        let delay = options.delay;
        let envelope = self.producer.envelope(message, options.correlation_id)?;
        let envelope = options.apply(envelope);
        let message_id = envelope.message_id();
        match delay {
            Some(delay) => {
                let ScheduledMessage { message_id, .. } = self.producer.schedule_publish(envelope, delay);
                Ok(message_id)
            }
            None => {
                self.producer
                    .publish_envelope(envelope, &CancellationToken::new())
                    .await?;
                Ok(message_id)
            }
        }
    }

    /// Send `message` to one endpoint.
    pub async fn send<M: Message>(&self, address: &EndpointAddress, message: &M) -> BusResult<MessageId> {
        self.send_with(address, message, PublishOptions::default()).await
    }

    /// Send with envelope options; `delay` is ignored for sends.
    pub async fn send_with<M: Message>(
        &self,
        address: &EndpointAddress,
        message: &M,
        options: PublishOptions,
    ) -> BusResult<MessageId> {
        let envelope = self.producer.envelope(message, options.correlation_id)?;
        let envelope = options.apply(envelope);
        let message_id = envelope.message_id();
        self.producer
            .send_envelope(address, envelope, &CancellationToken::new())
            .await?;
        Ok(message_id)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("scheme", &self.transport.scheme())
            .field("endpoints", &self.endpoint_addresses())
            .finish()
    }
}

/// Stop `endpoints` in order, returning the first failure.
async fn stop_all(endpoints: Vec<Arc<dyn ReceiveEndpoint>>) -> BusResult<()> {
    let mut first_error = None;
    for endpoint in endpoints {
        if let Err(e) = endpoint.stop().await {
            error!(address = %endpoint.address(), error = %e, "Endpoint failed to stop");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
