//! Pooled, segmented event processor with cooperative token claims.
//!
//! Events from a durable, totally ordered message source are fanned out to
//! per-segment work packages running on a shared worker executor. Each work
//! package holds an exclusive claim on its segment in the token store and
//! advances the segment's token as batches commit, so multiple processor
//! instances can cooperate across a cluster.

pub mod errors;

pub mod messaging {
    pub mod event;
    pub mod segment;
    pub mod source;

    pub use event::*;
    pub use segment::*;
    pub use source::*;
}

pub mod processing {
    pub mod coordinator;
    pub mod processor;
    pub mod status;
    pub mod worker;

    pub use coordinator::*;
    pub use processor::*;
    pub use status::*;
    pub use worker::*;
}

pub mod runtime {
    pub mod executor;
    pub mod sync;

    pub use executor::*;
    pub use sync::*;
}

pub mod storage {
    pub mod store;
    pub mod transaction;

    pub use store::*;
    pub use transaction::*;
}

pub use errors::{HandlerError, ProcessingError};
pub use messaging::event::{TrackedEvent, TrackingToken};
pub use messaging::segment::{hash_routing_key, Segment};
pub use messaging::source::{
    EventStream, InMemoryMessageSource, SourceError, StreamableMessageSource,
};
pub use processing::coordinator::{Coordinator, InitialTokenFactory, WorkPackageFactory};
pub use processing::processor::{
    ConfigurationError, PooledEventProcessor, PooledEventProcessorBuilder,
    DEFAULT_INITIAL_SEGMENT_COUNT,
};
pub use processing::status::{
    SegmentStatusRecord, StatusRegistry, StatusUpdate, StatusUpdater, TrackerStatus,
};
pub use processing::worker::{
    BatchProcessor, EventValidator, WorkPackage, WorkPackageConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_CLAIM_EXTENSION_THRESHOLD, DEFAULT_INBOX_CAPACITY,
};
pub use runtime::executor::{ExecutorError, TaskExecutor};
pub use runtime::sync::Completion;
pub use storage::store::{
    InMemoryTokenStore, TokenStore, TokenStoreError, DEFAULT_CLAIM_TIMEOUT,
};
pub use storage::transaction::{
    in_transaction, NoTransaction, Transaction, TransactionManager, UnitOfWork, UnitOfWorkState,
};
