use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::state::State;
use crate::error::{BusError, BusResult};
use crate::id::CorrelationId;

/// Persisted state of one saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance<D> {
    pub correlation_id: CorrelationId,
    pub current_state: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Optimistic concurrency counter; 0 until first saved
    pub version: u64,
    pub data: D,
}

impl<D> SagaInstance<D> {
    pub fn new(correlation_id: CorrelationId, state: &State, data: D) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            current_state: state.name().to_string(),
            created_at: now,
            modified_at: now,
            version: 0,
            data,
        }
    }

    pub fn state(&self) -> State {
        State::from(self.current_state.clone())
    }

    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// Storage for saga instances.
#[async_trait]
pub trait SagaRepository<D>: Send + Sync {
    async fn load(&self, correlation_id: CorrelationId) -> BusResult<Option<SagaInstance<D>>>;

    /// Insert or update `instance`.
    ///
    /// The stored version must equal `instance.version` (0 for an instance
    /// that was never saved), otherwise the save fails with
    /// `SagaConcurrencyConflict`. On success the version is incremented.
    async fn save(&self, instance: &mut SagaInstance<D>) -> BusResult<()>;

    async fn delete(&self, correlation_id: CorrelationId) -> BusResult<()>;
}

/// Process-local saga storage.
#[derive(Debug)]
pub struct InMemorySagaRepository<D> {
    instances: DashMap<CorrelationId, SagaInstance<D>>,
}

impl<D> InMemorySagaRepository<D> {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.instances.contains_key(&correlation_id)
    }
}

impl<D> Default for InMemorySagaRepository<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D> SagaRepository<D> for InMemorySagaRepository<D>
where
    D: Clone + Send + Sync + 'static,
{
    async fn load(&self, correlation_id: CorrelationId) -> BusResult<Option<SagaInstance<D>>> {
        Ok(self
            .instances
            .get(&correlation_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, instance: &mut SagaInstance<D>) -> BusResult<()> {
        let conflict = |actual: u64, instance: &SagaInstance<D>| BusError::SagaConcurrencyConflict {
            correlation_id: instance.correlation_id,
            expected: instance.version,
            actual,
        };
        match self.instances.entry(instance.correlation_id) {
            Entry::Occupied(mut stored) => {
                let actual = stored.get().version;
                if actual != instance.version {
                    return Err(conflict(actual, &*instance));
                }
                instance.version += 1;
                instance.modified_at = Utc::now();
                stored.insert(instance.clone());
            }
            Entry::Vacant(slot) => {
                if instance.version != 0 {
                    return Err(conflict(0, &*instance));
                }
                instance.version = 1;
                instance.modified_at = Utc::now();
                slot.insert(instance.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, correlation_id: CorrelationId) -> BusResult<()> {
        self.instances.remove(&correlation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_increments_version() {
        let repository = InMemorySagaRepository::new();
        let mut instance = SagaInstance::new(CorrelationId::new(), &State::initial(), 5u32);

        repository.save(&mut instance).await.unwrap();
        assert_eq!(instance.version, 1);
        instance.data = 6;
        repository.save(&mut instance).await.unwrap();
        assert_eq!(instance.version, 2);

        let loaded = repository.load(instance.correlation_id).await.unwrap().unwrap();
        assert_eq!(loaded.data, 6);
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let repository = InMemorySagaRepository::new();
        let mut first = SagaInstance::new(CorrelationId::new(), &State::initial(), 0u32);
        repository.save(&mut first).await.unwrap();

        let mut a = repository.load(first.correlation_id).await.unwrap().unwrap();
        let mut b = a.clone();
        repository.save(&mut a).await.unwrap();

        let err = repository.save(&mut b).await.unwrap_err();
        assert_eq!(
            err,
            BusError::SagaConcurrencyConflict {
                correlation_id: first.correlation_id,
                expected: 1,
                actual: 2,
            }
        );
        assert_eq!(b.version, 1, "failed save leaves the version alone");
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let repository = InMemorySagaRepository::new();
        let id = CorrelationId::new();
        repository
            .save(&mut SagaInstance::new(id, &State::initial(), 1u32))
            .await
            .unwrap();
        let err = repository
            .save(&mut SagaInstance::new(id, &State::initial(), 2u32))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SagaConcurrencyConflict { expected: 0, actual: 1, .. }));

        repository.delete(id).await.unwrap();
        assert!(repository.load(id).await.unwrap().is_none());
    }
}
