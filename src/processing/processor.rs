use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

use crate::messaging::source::StreamableMessageSource;
use crate::processing::coordinator::{Coordinator, InitialTokenFactory, WorkPackageFactory};
use crate::processing::status::{SegmentStatusRecord, StatusRegistry, TrackerStatus};
use crate::processing::worker::{
    BatchProcessor, EventValidator, WorkPackage, WorkPackageConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_CLAIM_EXTENSION_THRESHOLD, DEFAULT_INBOX_CAPACITY,
};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::sync::Completion;
use crate::storage::store::{TokenStore, TokenStoreError};
use crate::storage::transaction::{in_transaction, TransactionManager};

pub const DEFAULT_INITIAL_SEGMENT_COUNT: u32 = 32;

const UNKNOWN_STORAGE_IDENTIFIER: &str = "--unknown--";

/// Error raised when the processor builder is missing or rejects a field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("the {field} is a hard requirement and should be provided")]
    Missing { field: &'static str },
    #[error("the {field} should be higher than zero")]
    NotStrictlyPositive { field: &'static str },
}

/// Pooled, segmented event processor.
///
/// Consumes a totally ordered event stream and dispatches events in parallel
/// to the configured handler, one work package per claimed segment. Progress
/// persists per segment in the shared token store so that instances across a
/// cluster can cooperate through its claim discipline.
pub struct PooledEventProcessor {
    name: Arc<str>,
    coordinator: Arc<Coordinator>,
    status_registry: StatusRegistry,
    message_source: Arc<dyn StreamableMessageSource>,
    token_store: Arc<dyn TokenStore>,
    transaction_manager: Arc<dyn TransactionManager>,
    initial_segment_count: u32,
    initial_token: InitialTokenFactory,
    claim_extension_threshold: Duration,
    storage_identifier: Mutex<Option<String>>,
}

impl PooledEventProcessor {
    pub fn builder() -> PooledEventProcessorBuilder {
        PooledEventProcessorBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bootstraps token segments when none exist yet and starts the
    /// coordinator. Only the first call has an effect.
    pub fn start(&self) -> Result<(), TokenStoreError> {
        info!(processor = %self.name, "processor starting");
        let name = &*self.name;
        in_transaction(self.transaction_manager.as_ref(), || {
            let segments = self.token_store.fetch_segments(name)?;
            if segments.is_empty() {
                info!(
                    processor = name,
                    segments = self.initial_segment_count,
                    "initializing token segments"
                );
                let initial = (self.initial_token)(self.message_source.as_ref());
                self.token_store.initialize_token_segments(
                    name,
                    self.initial_segment_count,
                    initial,
                )?;
            }
            Ok(())
        })?;
        self.coordinator.start();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    pub fn is_error(&self) -> bool {
        self.coordinator.is_error()
    }

    /// Initiates orderly shutdown; the handle resolves once every work
    /// package aborted and all claims were released.
    pub fn shutdown(&self) -> Completion<()> {
        self.coordinator.stop()
    }

    /// Blocks until shutdown completes.
    pub fn shutdown_and_wait(&self) {
        self.shutdown().wait();
    }

    /// Releases a segment for twice the claim extension threshold, giving
    /// other instances a window to pick it up.
    pub fn release_segment(&self, segment_id: u32) {
        self.release_segment_for(segment_id, 2 * self.claim_extension_threshold);
    }

    /// Releases a segment and blocks reclaiming it for `duration`.
    pub fn release_segment_for(&self, segment_id: u32, duration: Duration) {
        self.coordinator
            .release_until(segment_id, Instant::now() + duration);
    }

    /// Immutable per-segment status snapshot.
    pub fn processing_status(&self) -> BTreeMap<u32, TrackerStatus> {
        self.status_registry.snapshot()
    }

    /// Serializable status rows for monitors.
    pub fn status_records(&self) -> Vec<SegmentStatusRecord> {
        self.status_registry.records()
    }

    /// JSON export of the current status rows.
    pub fn status_json(&self) -> Result<String, serde_json::Error> {
        self.status_registry.to_json()
    }

    /// Identifier of the backing token storage, fetched once in a
    /// transaction and cached.
    pub fn token_store_identifier(&self) -> String {
        let mut cached = self.storage_identifier.lock().unwrap();
        if let Some(identifier) = cached.as_ref() {
            return identifier.clone();
        }
        let identifier = match in_transaction(self.transaction_manager.as_ref(), || {
            self.token_store.retrieve_storage_identifier()
        }) {
            Ok(Some(identifier)) => identifier,
            _ => UNKNOWN_STORAGE_IDENTIFIER.to_string(),
        };
        *cached = Some(identifier.clone());
        identifier
    }
}

/// Builder assembling a [`PooledEventProcessor`].
///
/// The name, event validator, batch processor, message source, token store,
/// transaction manager and both executors are hard requirements; everything
/// else is defaulted.
pub struct PooledEventProcessorBuilder {
    name: Option<String>,
    event_validator: Option<Arc<dyn EventValidator>>,
    batch_processor: Option<Arc<dyn BatchProcessor>>,
    message_source: Option<Arc<dyn StreamableMessageSource>>,
    token_store: Option<Arc<dyn TokenStore>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    coordinator_executor: Option<TaskExecutor>,
    worker_executor: Option<TaskExecutor>,
    initial_segment_count: u32,
    initial_token: InitialTokenFactory,
    claim_extension_threshold: Duration,
    batch_size: usize,
    inbox_capacity: usize,
}

impl Default for PooledEventProcessorBuilder {
    fn default() -> Self {
        Self {
            name: None,
            event_validator: None,
            batch_processor: None,
            message_source: None,
            token_store: None,
            transaction_manager: None,
            coordinator_executor: None,
            worker_executor: None,
            initial_segment_count: DEFAULT_INITIAL_SEGMENT_COUNT,
            initial_token: Arc::new(|source| source.create_tail_token()),
            claim_extension_threshold: DEFAULT_CLAIM_EXTENSION_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

impl PooledEventProcessorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn event_validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.event_validator = Some(validator);
        self
    }

    pub fn batch_processor(mut self, batch_processor: Arc<dyn BatchProcessor>) -> Self {
        self.batch_processor = Some(batch_processor);
        self
    }

    pub fn message_source(mut self, message_source: Arc<dyn StreamableMessageSource>) -> Self {
        self.message_source = Some(message_source);
        self
    }

    pub fn token_store(mut self, token_store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(token_store);
        self
    }

    pub fn transaction_manager(
        mut self,
        transaction_manager: Arc<dyn TransactionManager>,
    ) -> Self {
        self.transaction_manager = Some(transaction_manager);
        self
    }

    pub fn coordinator_executor(mut self, executor: TaskExecutor) -> Self {
        self.coordinator_executor = Some(executor);
        self
    }

    pub fn worker_executor(mut self, executor: TaskExecutor) -> Self {
        self.worker_executor = Some(executor);
        self
    }

    /// Segment count used for the one-time bootstrap of the token store.
    pub fn initial_segment_count(mut self, count: u32) -> Self {
        self.initial_segment_count = count;
        self
    }

    /// Function producing the bootstrap token; defaults to the source's tail.
    pub fn initial_token(mut self, initial_token: InitialTokenFactory) -> Self {
        self.initial_token = initial_token;
        self
    }

    /// Idle interval after which a work package renews its claim.
    pub fn claim_extension_threshold(mut self, threshold: Duration) -> Self {
        self.claim_extension_threshold = threshold;
        self
    }

    /// Events drained per work package pass.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Advisory bound on each work package inbox.
    pub fn inbox_capacity(mut self, inbox_capacity: usize) -> Self {
        self.inbox_capacity = inbox_capacity;
        self
    }

    pub fn build(self) -> Result<PooledEventProcessor, ConfigurationError> {
        let name = self
            .name
            .filter(|name| !name.is_empty())
            .ok_or(ConfigurationError::Missing { field: "name" })?;
        let event_validator = self
            .event_validator
            .ok_or(ConfigurationError::Missing { field: "event validator" })?;
        let batch_processor = self
            .batch_processor
            .ok_or(ConfigurationError::Missing { field: "batch processor" })?;
        let message_source = self
            .message_source
            .ok_or(ConfigurationError::Missing { field: "message source" })?;
        let token_store = self
            .token_store
            .ok_or(ConfigurationError::Missing { field: "token store" })?;
        let transaction_manager = self
            .transaction_manager
            .ok_or(ConfigurationError::Missing { field: "transaction manager" })?;
        let coordinator_executor = self.coordinator_executor.ok_or(ConfigurationError::Missing {
            field: "coordinator executor",
        })?;
        let worker_executor = self
            .worker_executor
            .ok_or(ConfigurationError::Missing { field: "worker executor" })?;
        if self.initial_segment_count == 0 {
            return Err(ConfigurationError::NotStrictlyPositive {
                field: "initial segment count",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::NotStrictlyPositive { field: "batch size" });
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigurationError::NotStrictlyPositive {
                field: "inbox capacity",
            });
        }
        if self.claim_extension_threshold.is_zero() {
            return Err(ConfigurationError::NotStrictlyPositive {
                field: "claim extension threshold",
            });
        }

        let status_registry = StatusRegistry::new();
        let factory: WorkPackageFactory = {
            let registry = status_registry.clone();
            let factory_name = name.clone();
            let token_store = Arc::clone(&token_store);
            let transaction_manager = Arc::clone(&transaction_manager);
            let worker_executor = worker_executor.clone();
            let validator = Arc::clone(&event_validator);
            let batch_processor = Arc::clone(&batch_processor);
            let claim_extension_threshold = self.claim_extension_threshold;
            let batch_size = self.batch_size;
            let inbox_capacity = self.inbox_capacity;
            Arc::new(move |segment, token| {
                registry.insert_if_absent(segment.segment_id(), TrackerStatus::new(segment, token));
                let config = WorkPackageConfig::new(factory_name.clone(), segment, token)
                    .with_claim_extension_threshold(claim_extension_threshold)
                    .with_batch_size(batch_size)
                    .with_inbox_capacity(inbox_capacity);
                WorkPackage::new(
                    config,
                    Arc::clone(&token_store),
                    Arc::clone(&transaction_manager),
                    worker_executor.clone(),
                    Arc::clone(&validator),
                    Arc::clone(&batch_processor),
                    registry.updater_for(segment.segment_id()),
                )
            })
        };

        let coordinator = Coordinator::new(
            name.clone(),
            Arc::clone(&message_source),
            Arc::clone(&token_store),
            Arc::clone(&transaction_manager),
            factory,
            coordinator_executor,
            self.initial_segment_count,
            Arc::clone(&self.initial_token),
        );

        Ok(PooledEventProcessor {
            name: Arc::from(name),
            coordinator,
            status_registry,
            message_source,
            token_store,
            transaction_manager,
            initial_segment_count: self.initial_segment_count,
            initial_token: self.initial_token,
            claim_extension_threshold: self.claim_extension_threshold,
            storage_identifier: Mutex::new(None),
        })
    }
}
