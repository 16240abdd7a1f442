//! End-to-end runs over the in-memory substrate: publisher, worker pool,
//! and indexer as concurrent tasks in one process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::{
    Connector, ConnectorError, ConnectorOutcome, Document, Event, EventType, IndexerConfig,
    IndexerSettings, Indexer, MemoryBackend, Messenger, Pipeline, Publisher, RecordingMessenger,
    Runner, SharedMessengerFactory, SluiceConfig, Stage, StageError, WorkerPool,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Emits one child per value of the `split` field.
struct SplitStage;

#[async_trait]
impl Stage for SplitStage {
    fn name(&self) -> &str {
        "split"
    }

    async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
        let Some(parts) = doc.get_string_list("split") else {
            return Ok(None);
        };
        doc.remove_field("split");
        let mut children = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let mut child = Document::new(format!("{}-c{}", doc.id(), i + 1))
                .map_err(|e| StageError::processing(e.to_string()))?;
            child.set_field("part", part.as_str());
            children.push(child);
        }
        Ok(Some(children))
    }
}

/// Fails every document whose id is "bad".
struct PickyStage;

#[async_trait]
impl Stage for PickyStage {
    fn name(&self) -> &str {
        "picky"
    }

    async fn process(&self, doc: &mut Document) -> Result<Option<Vec<Document>>, StageError> {
        if doc.id() == "bad" {
            return Err(StageError::processing("refusing document"));
        }
        Ok(None)
    }
}

/// Connector that publishes a fixed list of documents.
struct ListConnector {
    name: String,
    pipeline: String,
    docs: Mutex<Vec<Document>>,
}

impl ListConnector {
    fn new(pipeline: &str, docs: Vec<Document>) -> Self {
        Self {
            name: "list".to_string(),
            pipeline: pipeline.to_string(),
            docs: Mutex::new(docs),
        }
    }
}

#[async_trait]
impl Connector for ListConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipeline(&self) -> Option<&str> {
        Some(&self.pipeline)
    }

    async fn execute(&self, publisher: Publisher) -> Result<(), ConnectorError> {
        let docs = std::mem::take(&mut *self.docs.lock());
        for doc in docs {
            publisher.publish(doc).await?;
        }
        Ok(())
    }
}

/// Connector that always fails.
struct BrokenConnector;

#[async_trait]
impl Connector for BrokenConnector {
    fn name(&self) -> &str {
        "broken"
    }

    fn pipeline(&self) -> Option<&str> {
        Some("enrich")
    }

    async fn execute(&self, _publisher: Publisher) -> Result<(), ConnectorError> {
        Err(ConnectorError::source("feed unreachable"))
    }
}

/// The manually wired counterpart of a local run: shared recording
/// messenger, one worker pool, one indexer, one publisher.
struct Harness {
    messenger: Arc<RecordingMessenger>,
    backend: Arc<MemoryBackend>,
    publisher: Publisher,
    pool: WorkerPool,
    indexer_shutdown: broadcast::Sender<()>,
    indexer_handle: JoinHandle<()>,
}

impl Harness {
    async fn start(pipeline: Pipeline, indexer_config: IndexerConfig) -> Self {
        let messenger = Arc::new(RecordingMessenger::new());
        let backend = Arc::new(MemoryBackend::new());
        let shared: Arc<dyn Messenger> = messenger.clone();
        let factory = SharedMessengerFactory::new(shared.clone());

        let pool = WorkerPool::start(Arc::new(pipeline), &factory, 1)
            .await
            .unwrap();

        let (indexer_shutdown, indexer_rx) = broadcast::channel(1);
        let indexer = Indexer::new(
            shared.clone(),
            backend.clone(),
            IndexerSettings::from_config(&indexer_config),
        );
        let indexer_handle = indexer.spawn(indexer_rx);

        let publisher = Publisher::new(shared, "run-1", "enrich");
        Self {
            messenger,
            backend,
            publisher,
            pool,
            indexer_shutdown,
            indexer_handle,
        }
    }

    fn spawn_connector(&self, docs: Vec<Document>) -> JoinHandle<Result<(), ConnectorError>> {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            for doc in docs {
                publisher.publish(doc).await?;
            }
            Ok(())
        })
    }

    async fn shutdown(self) -> (Arc<RecordingMessenger>, Arc<MemoryBackend>) {
        self.pool.stop().await;
        let _ = self.indexer_shutdown.send(());
        let _ = self.indexer_handle.await;
        (self.messenger, self.backend)
    }
}

fn indexer_config() -> IndexerConfig {
    IndexerConfig {
        batch_timeout_ms: 50,
        ..IndexerConfig::default()
    }
}

fn doc(id: &str) -> Document {
    Document::new(id).unwrap()
}

#[tokio::test]
async fn simple_pass_through_indexes_one_document() {
    let harness = Harness::start(Pipeline::builder("enrich").build(), indexer_config()).await;
    let connector = harness.spawn_connector(vec![doc("d1")]);
    harness
        .publisher
        .wait_for_completion(connector, WAIT)
        .await
        .unwrap();
    assert_eq!(harness.publisher.outstanding(), 0);

    let (messenger, backend) = harness.shutdown().await;
    assert_eq!(backend.stored_ids(), vec!["d1"]);

    let events = messenger.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], Event::finish("d1", "run-1"));
}

#[tokio::test]
async fn fan_out_accounts_children_before_their_terminal_events() {
    let pipeline = Pipeline::builder("enrich").stage(SplitStage).build();
    let harness = Harness::start(pipeline, indexer_config()).await;

    let mut parent = doc("d1");
    parent.add_to_field("split", "x");
    parent.add_to_field("split", "y");
    let connector = harness.spawn_connector(vec![parent]);
    harness
        .publisher
        .wait_for_completion(connector, WAIT)
        .await
        .unwrap();
    assert_eq!(harness.publisher.outstanding(), 0);

    let (messenger, backend) = harness.shutdown().await;
    let mut stored = backend.stored_ids();
    stored.sort();
    assert_eq!(stored, vec!["d1", "d1-c1", "d1-c2"]);

    let events = messenger.events();
    // One CREATE per child, one terminal event per document.
    let creates: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::Create)
        .collect();
    assert_eq!(creates.len(), 2);
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 3);

    // The CREATE for a child arrives before any terminal event for it.
    for child in ["d1-c1", "d1-c2"] {
        let create_at = events
            .iter()
            .position(|e| e.event_type == EventType::Create && e.document_id == child)
            .unwrap();
        let terminal_at = events
            .iter()
            .position(|e| e.is_terminal() && e.document_id == child)
            .unwrap();
        assert!(create_at < terminal_at, "{child}: CREATE after terminal");
    }
}

#[tokio::test]
async fn delete_then_upsert_leaves_the_document_in_the_index() {
    let config = IndexerConfig {
        deletion_marker_field: Some("is_deleted".to_string()),
        deletion_marker_field_value: Some("true".to_string()),
        ..indexer_config()
    };
    let harness = Harness::start(Pipeline::builder("enrich").build(), config).await;

    let mut deletion = doc("x");
    deletion.set_field("is_deleted", "true");
    let connector = harness.spawn_connector(vec![deletion, doc("x")]);
    harness
        .publisher
        .wait_for_completion(connector, WAIT)
        .await
        .unwrap();

    let (messenger, backend) = harness.shutdown().await;
    assert_eq!(backend.stored_ids(), vec!["x"]);
    // Both consumed documents reached a terminal state.
    let terminals = messenger.events().iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 2);
}

#[tokio::test]
async fn upsert_then_delete_removes_the_document() {
    let config = IndexerConfig {
        deletion_marker_field: Some("is_deleted".to_string()),
        deletion_marker_field_value: Some("true".to_string()),
        ..indexer_config()
    };
    let harness = Harness::start(Pipeline::builder("enrich").build(), config).await;

    let mut deletion = doc("x");
    deletion.set_field("is_deleted", "true");
    let connector = harness.spawn_connector(vec![doc("x"), deletion]);
    harness
        .publisher
        .wait_for_completion(connector, WAIT)
        .await
        .unwrap();

    let (_messenger, backend) = harness.shutdown().await;
    assert!(backend.stored_ids().is_empty());
}

#[tokio::test]
async fn stage_failure_fails_one_document_and_spares_the_rest() {
    let pipeline = Pipeline::builder("enrich").stage(PickyStage).build();
    let harness = Harness::start(pipeline, indexer_config()).await;

    let connector = harness.spawn_connector(vec![doc("good"), doc("bad"), doc("fine")]);
    harness
        .publisher
        .wait_for_completion(connector, WAIT)
        .await
        .unwrap();

    let (messenger, backend) = harness.shutdown().await;
    let mut stored = backend.stored_ids();
    stored.sort();
    assert_eq!(stored, vec!["fine", "good"]);

    let events = messenger.events();
    let fail = events
        .iter()
        .find(|e| e.event_type == EventType::Fail)
        .unwrap();
    assert_eq!(fail.document_id, "bad");
    assert!(fail
        .message
        .as_deref()
        .unwrap()
        .contains("refusing document"));
}

#[tokio::test]
async fn completion_times_out_when_no_worker_is_running() {
    let messenger = Arc::new(RecordingMessenger::new());
    let publisher = Publisher::new(messenger, "run-1", "enrich");
    publisher.publish(doc("stuck")).await.unwrap();

    let connector: JoinHandle<Result<(), ConnectorError>> = tokio::spawn(async { Ok(()) });
    let result = publisher
        .wait_for_completion(connector, Duration::from_millis(150))
        .await;
    assert!(result.is_err());
    assert_eq!(publisher.outstanding(), 1);
}

#[tokio::test]
async fn runner_executes_configured_connectors_end_to_end() {
    let config = SluiceConfig::from_yaml(
        r#"
indexer:
  batch_timeout_ms: 50
pipelines:
  - name: enrich
    stages:
      - type: set_static_values
        fields:
          origin: catalog
connectors:
  - name: list
    connector: list
    pipeline: enrich
"#,
    )
    .unwrap();
    config.validate().unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let runner = Runner::new(config, backend.clone());
    let connector = Arc::new(ListConnector::new("enrich", vec![doc("a"), doc("b")]));

    let summary = runner.run(vec![connector]).await;
    assert!(summary.succeeded());
    assert_eq!(summary.connectors.len(), 1);
    assert_eq!(summary.connectors[0].outcome, ConnectorOutcome::Completed);

    let stored = backend.stored();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored["a"]["origin"], serde_json::json!("catalog"));
    assert_eq!(stored["a"]["run_id"], serde_json::json!(runner.run_id()));
}

#[tokio::test]
async fn runner_aborts_on_connector_failure_and_skips_the_rest() {
    let config = SluiceConfig::from_yaml(
        r#"
indexer:
  batch_timeout_ms: 50
pipelines:
  - name: enrich
    stages: []
"#,
    )
    .unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let runner = Runner::new(config, backend);
    let summary = runner
        .run(vec![
            Arc::new(BrokenConnector),
            Arc::new(ListConnector::new("enrich", vec![doc("later")])),
        ])
        .await;

    assert!(!summary.succeeded());
    assert_eq!(summary.connectors[0].outcome, ConnectorOutcome::Failed);
    assert!(summary.connectors[0]
        .message
        .as_deref()
        .unwrap()
        .contains("feed unreachable"));
    assert_eq!(summary.connectors[1].outcome, ConnectorOutcome::Skipped);
}
