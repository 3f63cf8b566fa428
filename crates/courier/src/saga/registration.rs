use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::machine::StateMachine;
use super::repository::SagaRepository;
use super::SagaData;
use crate::config::EndpointConfig;
use crate::consumer::{delivery_pipe, ConsumerRegistration, DeliveryContext, ReceiveScope};
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::message::MessageType;
use crate::pipeline::{Pipe, Terminal};

/// A state machine and its repository bound to an endpoint.
pub struct SagaRegistration<D> {
    machine: Arc<StateMachine<D>>,
    repository: Arc<dyn SagaRepository<D>>,
    message_types: Vec<MessageType>,
    pipe: Pipe<DeliveryContext>,
    use_error_queue: bool,
}

impl<D: SagaData> SagaRegistration<D> {
    pub fn new(
        machine: Arc<StateMachine<D>>,
        repository: Arc<dyn SagaRepository<D>>,
        config: &EndpointConfig,
    ) -> Self {
        Self {
            message_types: machine.message_types().to_vec(),
            pipe: delivery_pipe(machine.name(), config),
            machine,
            repository,
            use_error_queue: config.use_error_queue,
        }
    }

    pub fn machine(&self) -> &Arc<StateMachine<D>> {
        &self.machine
    }
}

#[async_trait]
impl<D: SagaData> ConsumerRegistration for SagaRegistration<D> {
    fn name(&self) -> &str {
        self.machine.name()
    }

    fn message_types(&self) -> &[MessageType] {
        &self.message_types
    }

    fn use_error_queue(&self) -> bool {
        self.use_error_queue
    }

    async fn consume(&self, envelope: &MessageEnvelope, scope: &ReceiveScope) -> BusResult<()> {
        let terminal = SagaTerminal {
            machine: &self.machine,
            repository: self.repository.as_ref(),
        };
        let mut ctx = DeliveryContext::new(envelope.clone(), scope.clone());
        self.pipe
            .send(&mut ctx, &terminal)
            .await
            .map_err(|error| BusError::ConsumerFailed {
                consumer: self.machine.name().to_string(),
                errors: vec![error],
            })
    }
}

struct SagaTerminal<'a, D> {
    machine: &'a StateMachine<D>,
    repository: &'a dyn SagaRepository<D>,
}

#[async_trait]
impl<'a, D: SagaData> Terminal<DeliveryContext> for SagaTerminal<'a, D> {
    async fn call(&self, ctx: &mut DeliveryContext) -> BusResult<()> {
        let outcome = self
            .machine
            .dispatch(ctx.envelope(), &ctx.scope(), self.repository)
            .await?;
        debug!(saga = %self.machine.name(), ?outcome, "Saga dispatch finished");
        Ok(())
    }
}
