//! Orchestrates one run: a sequential execution of connectors.
//!
//! For each connector in declared order the runner builds the messenger
//! substrate, starts the worker pool and indexer when in-process execution
//! is requested, constructs a publisher bound to the connector's pipeline,
//! and drives the connector on a dedicated task until its work is fully
//! accounted or the per-connector timeout elapses. A connector failure
//! aborts the run; subsequent connectors are skipped.
//!
//! A single-process run uses four kinds of concurrent tasks: the connector
//! task, the worker pool, the indexer task, and the calling task driving
//! the publisher's completion wait. In broker mode the workers and indexer
//! may instead live in separate processes that stay subscribed across
//! runs; the runner then only publishes and waits.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SluiceConfig;
use crate::connector::Connector;
use crate::error::{CompletionError, ConfigError, RunError};
use crate::index::IndexBackend;
use crate::indexer::{Indexer, IndexerSettings};
use crate::messenger::{Messenger, MessengerFactory, SharedMessengerFactory};
use crate::messenger::LocalMessenger;
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;
use crate::publisher::Publisher;
use crate::worker::WorkerPool;

/// Where the substrate lives and which components this process hosts.
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// Everything in this process, queues in memory.
    Local,
    /// Message traffic through a broker.
    #[cfg(feature = "kafka")]
    Kafka {
        /// Also host the worker pool and indexer in this process. When
        /// false they are assumed to run as separate processes.
        start_workers: bool,
    },
}

/// Outcome of one connector within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorOutcome {
    /// All work generated by the connector was accounted for.
    Completed,
    /// The connector or its pipeline failed.
    Failed,
    /// The per-connector timeout elapsed.
    TimedOut,
    /// A previous connector aborted the run.
    Skipped,
}

/// Per-connector record in a run summary.
#[derive(Debug, Clone)]
pub struct ConnectorRun {
    /// Connector name.
    pub name: String,
    /// How the connector ended.
    pub outcome: ConnectorOutcome,
    /// Failure description, when there is one.
    pub message: Option<String>,
    /// Wall time spent on this connector.
    pub elapsed: Duration,
}

/// What happened during a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// The run id all documents were stamped with.
    pub run_id: String,
    /// Per-connector outcomes, in execution order.
    pub connectors: Vec<ConnectorRun>,
    /// Total wall time.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Whether every connector completed.
    pub fn succeeded(&self) -> bool {
        self.connectors
            .iter()
            .all(|c| c.outcome == ConnectorOutcome::Completed)
    }
}

/// Everything a connector needs running around it.
struct ConnectorRuntime {
    publisher_messenger: Arc<dyn Messenger>,
    pipeline: Option<Arc<Pipeline>>,
    pool: Option<WorkerPool>,
    indexer_shutdown: Option<broadcast::Sender<()>>,
    indexer_handle: Option<tokio::task::JoinHandle<()>>,
}

/// Drives one run. Not meant to be shared across runs; create a new
/// instance, with a fresh run id, for each.
pub struct Runner {
    run_id: String,
    config: SluiceConfig,
    backend: Arc<dyn IndexBackend>,
    mode: ExecutionMode,
}

impl Runner {
    /// A runner for an in-process run.
    pub fn new(config: SluiceConfig, backend: Arc<dyn IndexBackend>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config,
            backend,
            mode: ExecutionMode::Local,
        }
    }

    /// Select the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// The id documents of this run are stamped with.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute the connectors in declared order. The first failure or
    /// timeout aborts the run and the remaining connectors are skipped.
    pub async fn run(&self, connectors: Vec<Arc<dyn Connector>>) -> RunSummary {
        info!(run_id = self.run_id.as_str(), "starting run");
        let started = Instant::now();
        let mut runs = Vec::with_capacity(connectors.len());
        let mut aborted = false;

        for connector in connectors {
            let name = connector.name().to_string();
            if aborted {
                info!(connector = name.as_str(), "skipped: run already aborted");
                runs.push(ConnectorRun {
                    name,
                    outcome: ConnectorOutcome::Skipped,
                    message: None,
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            let connector_started = Instant::now();
            let result = self.run_connector(connector).await;
            let elapsed = connector_started.elapsed();
            PipelineMetrics::record_connector_seconds(elapsed.as_secs_f64());

            match result {
                Ok(()) => {
                    info!(
                        connector = name.as_str(),
                        "connector complete in {:.2}s",
                        elapsed.as_secs_f64()
                    );
                    runs.push(ConnectorRun {
                        name,
                        outcome: ConnectorOutcome::Completed,
                        message: None,
                        elapsed,
                    });
                }
                Err(e) => {
                    error!(connector = name.as_str(), "connector aborted the run: {e}");
                    aborted = true;
                    let outcome = match &e {
                        RunError::Timeout { .. } => ConnectorOutcome::TimedOut,
                        _ => ConnectorOutcome::Failed,
                    };
                    runs.push(ConnectorRun {
                        name,
                        outcome,
                        message: Some(e.to_string()),
                        elapsed,
                    });
                }
            }
        }

        let elapsed = started.elapsed();
        PipelineMetrics::record_run_seconds(elapsed.as_secs_f64());
        info!(
            run_id = self.run_id.as_str(),
            "entire run took {:.2}s",
            elapsed.as_secs_f64()
        );
        RunSummary {
            run_id: self.run_id.clone(),
            connectors: runs,
            elapsed,
        }
    }

    async fn run_connector(&self, connector: Arc<dyn Connector>) -> Result<(), RunError> {
        let name = connector.name().to_string();
        let pipeline_name = connector
            .pipeline()
            .ok_or_else(|| {
                ConfigError::invalid(format!("connector '{name}' names no pipeline"))
            })?
            .to_string();
        info!(
            connector = name.as_str(),
            pipeline = pipeline_name.as_str(),
            "running connector"
        );

        let runtime = self.start_runtime(&pipeline_name).await?;
        let publisher = Publisher::new(
            runtime.publisher_messenger.clone(),
            self.run_id.clone(),
            pipeline_name.clone(),
        );

        let result = self
            .drive_connector(&connector, &name, publisher.clone())
            .await;

        publisher.close().await;
        if let Some(pool) = runtime.pool {
            pool.stop().await;
        }
        if let Some(shutdown) = runtime.indexer_shutdown {
            let _ = shutdown.send(());
        }
        if let Some(handle) = runtime.indexer_handle {
            let _ = handle.await;
        }
        if let Some(pipeline) = runtime.pipeline {
            // All workers have drained, so the pipeline is ours again.
            match Arc::try_unwrap(pipeline) {
                Ok(mut pipeline) => pipeline.stop().await,
                Err(_) => warn!("pipeline still shared at teardown, skipping stage stop"),
            }
        }
        if let Err(e) = connector.close().await {
            warn!(connector = name.as_str(), "connector close failed: {e}");
        }

        result
    }

    async fn drive_connector(
        &self,
        connector: &Arc<dyn Connector>,
        name: &str,
        publisher: Publisher,
    ) -> Result<(), RunError> {
        connector
            .pre_execute(&self.run_id)
            .await
            .map_err(|e| RunError::ConnectorFailed {
                name: name.to_string(),
                message: format!("pre-execution failed: {e}"),
            })?;

        let task_connector = connector.clone();
        let task_publisher = publisher.clone();
        let handle =
            tokio::spawn(async move { task_connector.execute(task_publisher).await });

        let timeout = Duration::from_millis(self.config.runner.connector_timeout_ms);
        publisher
            .wait_for_completion(handle, timeout)
            .await
            .map_err(|e| match e {
                CompletionError::TimedOut { timeout_ms } => RunError::Timeout {
                    name: name.to_string(),
                    timeout_ms,
                },
                other => RunError::ConnectorFailed {
                    name: name.to_string(),
                    message: other.to_string(),
                },
            })?;

        connector
            .post_execute(&self.run_id)
            .await
            .map_err(|e| RunError::ConnectorFailed {
                name: name.to_string(),
                message: format!("post-execution failed: {e}"),
            })?;

        Ok(())
    }

    /// Build the messenger substrate and start the worker pool and indexer
    /// for one connector, per the execution mode.
    async fn start_runtime(&self, pipeline_name: &str) -> Result<ConnectorRuntime, RunError> {
        let pipeline_config = self.config.pipeline(pipeline_name).ok_or_else(|| {
            ConfigError::invalid(format!("pipeline '{pipeline_name}' is not defined"))
        })?;

        match &self.mode {
            ExecutionMode::Local => {
                let messenger: Arc<dyn Messenger> =
                    Arc::new(LocalMessenger::from_config(&self.config.worker));
                let factory = SharedMessengerFactory::new(messenger.clone());
                let (pipeline, pool, indexer_shutdown, indexer_handle) = self
                    .start_workers_and_indexer(pipeline_config, &factory, messenger.clone())
                    .await?;
                Ok(ConnectorRuntime {
                    publisher_messenger: messenger,
                    pipeline: Some(pipeline),
                    pool: Some(pool),
                    indexer_shutdown: Some(indexer_shutdown),
                    indexer_handle: Some(indexer_handle),
                })
            }
            #[cfg(feature = "kafka")]
            ExecutionMode::Kafka { start_workers } => {
                use crate::messenger::{KafkaMessenger, KafkaMessengerFactory};

                let kafka_config = self.config.kafka.clone().ok_or_else(|| {
                    ConfigError::invalid("broker mode requires a kafka section")
                })?;
                let publisher_messenger: Arc<dyn Messenger> = Arc::new(
                    KafkaMessenger::for_publisher(&kafka_config, pipeline_name, &self.run_id)?,
                );
                if !start_workers {
                    return Ok(ConnectorRuntime {
                        publisher_messenger,
                        pipeline: None,
                        pool: None,
                        indexer_shutdown: None,
                        indexer_handle: None,
                    });
                }
                let factory =
                    KafkaMessengerFactory::new(kafka_config.clone(), pipeline_name, &self.run_id);
                let indexer_messenger: Arc<dyn Messenger> = Arc::new(KafkaMessenger::for_indexer(
                    &kafka_config,
                    pipeline_name,
                    &self.run_id,
                )?);
                let (pipeline, pool, indexer_shutdown, indexer_handle) = self
                    .start_workers_and_indexer(pipeline_config, &factory, indexer_messenger)
                    .await?;
                Ok(ConnectorRuntime {
                    publisher_messenger,
                    pipeline: Some(pipeline),
                    pool: Some(pool),
                    indexer_shutdown: Some(indexer_shutdown),
                    indexer_handle: Some(indexer_handle),
                })
            }
        }
    }

    async fn start_workers_and_indexer(
        &self,
        pipeline_config: &crate::config::PipelineConfig,
        factory: &dyn MessengerFactory,
        indexer_messenger: Arc<dyn Messenger>,
    ) -> Result<
        (
            Arc<Pipeline>,
            WorkerPool,
            broadcast::Sender<()>,
            tokio::task::JoinHandle<()>,
        ),
        RunError,
    > {
        let mut pipeline = Pipeline::from_config(pipeline_config)?;
        pipeline
            .start()
            .await
            .map_err(|e| RunError::StageStartup(e.to_string()))?;
        let pipeline = Arc::new(pipeline);

        let pool =
            WorkerPool::start(pipeline.clone(), factory, self.config.worker.threads).await?;

        let (indexer_shutdown, indexer_rx) = broadcast::channel(1);
        let indexer = Indexer::new(
            indexer_messenger,
            self.backend.clone(),
            IndexerSettings::from_config(&self.config.indexer),
        );
        let indexer_handle = indexer.spawn(indexer_rx);

        Ok((pipeline, pool, indexer_shutdown, indexer_handle))
    }
}
