//! sluice-core - run coordination for the Sluice document pipeline
//!
//! Sluice pulls records from heterogeneous sources, routes each one
//! through an ordered chain of stateless transformation stages, and
//! delivers the enriched documents to a search backend. This crate is the
//! coordination core: the choreography between the publisher (which
//! originates document ids), the worker pool (which executes pipeline
//! stages), and the indexer (which batches documents toward a backend),
//! plus the messenger substrate carrying documents and completion events
//! between them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐    ┌───────────┐   source   ┌─────────┐   dest   ┌─────────┐
//! │ Connector │───▶│ Publisher │───[queue]──▶│ Workers │──[queue]─▶│ Indexer │──▶ backend
//! └───────────┘    └───────────┘            └─────────┘          └─────────┘
//!                        ▲                       │    events          │
//!                        └───────────────────────┴──────[stream]──────┘
//! ```
//!
//! A **run** executes connectors sequentially under one run id; all work a
//! connector generates, including child documents fanned out by stages,
//! must be indexed or failed before the next connector begins. The
//! publisher tracks outstanding work in a ledger fed by CREATE, FINISH,
//! and FAIL events, guaranteeing at-most-once indexing per document and a
//! deterministic end of run.
//!
//! The messenger substrate is pluggable: in-memory queues for
//! single-process runs, or a Kafka-compatible broker (cargo feature
//! `kafka`) for distributed ones.

pub mod config;
pub mod connector;
pub mod document;
pub mod error;
pub mod event;
pub mod index;
pub mod indexer;
pub mod messenger;
pub mod metrics;
pub mod pipeline;
pub mod publisher;
pub mod runner;
pub mod stage;
pub mod worker;

pub use config::{
    ConnectorConfig, IndexerConfig, KafkaConfig, PipelineConfig, RunnerConfig, SluiceConfig,
    StageConfig, StageKind, VersionType, WorkerConfig,
};
pub use connector::Connector;
pub use document::{
    Document, FieldValue, SourceOffset, UpdateMode, CHILDREN_FIELD, ERRORS_FIELD, ID_FIELD,
    RESERVED_FIELDS, RUN_ID_FIELD,
};
pub use error::{
    BackendError, CompletionError, ConfigError, ConnectorError, DocumentError, MessengerError,
    PipelineError, RunError, StageError,
};
pub use event::{Event, EventStatus, EventType};
pub use index::{
    DeleteByTerm, IndexBackend, IndexDoc, IndexRequest, IndexResponse, ItemFailure, MemoryBackend,
};
pub use indexer::{Indexer, IndexerSettings};
pub use messenger::{
    LocalMessenger, Messenger, MessengerFactory, RecordingMessenger, SharedMessengerFactory,
};
pub use metrics::PipelineMetrics;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use publisher::Publisher;
pub use runner::{ConnectorOutcome, ConnectorRun, ExecutionMode, RunSummary, Runner};
pub use stage::{
    ConditionOperator, FieldLength, SetStaticValues, Stage, StageCondition,
};
pub use worker::{Worker, WorkerPool};

#[cfg(feature = "kafka")]
pub use messenger::{KafkaMessenger, KafkaMessengerFactory};
