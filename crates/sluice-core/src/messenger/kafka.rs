//! Kafka-backed messenger for distributed runs.
//!
//! Topic layout per pipeline and run:
//!
//! ```text
//! <prefix>.source.<pipeline>   documents awaiting processing (partitioned)
//! <prefix>.dest.<pipeline>     processed documents awaiting indexing
//! <prefix>.events.<run_id>     lifecycle events (single partition)
//! ```
//!
//! Each worker messenger subscribes to the source topic as an independent
//! consumer with a unique client id inside a shared consumer group. Freshly
//! polled documents pass through a [`DeduplicationQueue`] so a record
//! redelivered during a rebalance is not processed twice. Source offsets
//! are committed synchronously once the [`OffsetLedger`] has seen terminal
//! events for the polled document and all of its children; the worker
//! messenger observes those events through its own subscription to the
//! run's event topic.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::{DeduplicationQueue, Messenger, MessengerFactory, OffsetLedger};
use crate::config::KafkaConfig;
use crate::document::{Document, SourceOffset};
use crate::error::MessengerError;
use crate::event::Event;

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(30);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

fn transport(e: impl std::fmt::Display) -> MessengerError {
    MessengerError::transport(e.to_string())
}

/// Messenger backed by a Kafka-compatible broker.
///
/// Constructed per component role: a worker messenger carries the source
/// consumer, dedup queue, and offset ledger; an indexer messenger carries
/// the destination consumer; a publisher messenger carries the event
/// consumer. All roles share the producer for their outbound channels.
pub struct KafkaMessenger {
    config: KafkaConfig,
    pipeline: String,
    run_id: String,
    producer: FutureProducer,
    source_consumer: Option<StreamConsumer>,
    dest_consumer: Option<StreamConsumer>,
    event_consumer: Option<StreamConsumer>,
    /// Worker-side observer of the run's event topic, used purely for
    /// offset accounting.
    accounting_consumer: Option<BaseConsumer>,
    dedup: DeduplicationQueue,
    offsets: OffsetLedger,
    poll_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaMessenger {
    /// Messenger for a worker: consumes the source topic, produces to the
    /// destination and event topics, and commits source offsets.
    pub fn for_worker(
        config: &KafkaConfig,
        pipeline: &str,
        run_id: &str,
    ) -> Result<Self, MessengerError> {
        let client_id = format!("sluice-worker-{}-{}", pipeline, random_suffix());
        let group = format!("{}-worker-{}", config.consumer_group_prefix, pipeline);

        let source_consumer: StreamConsumer = Self::consumer_config(config, &client_id, &group)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(transport)?;
        source_consumer
            .subscribe(&[&Self::source_topic_name(config, pipeline)])
            .map_err(transport)?;

        // Every worker observes all events of the run, so accounting uses a
        // consumer group of its own.
        let accounting_consumer: BaseConsumer =
            Self::consumer_config(config, &format!("{client_id}-events"), &client_id)
                .set("enable.auto.commit", "true")
                .create()
                .map_err(transport)?;
        accounting_consumer
            .subscribe(&[&Self::event_topic_name(config, run_id)])
            .map_err(transport)?;

        let mut messenger = Self::bare(config, pipeline, run_id)?;
        messenger.source_consumer = Some(source_consumer);
        messenger.accounting_consumer = Some(accounting_consumer);
        Ok(messenger)
    }

    /// Messenger for an indexer: consumes the destination topic and
    /// produces terminal events.
    pub fn for_indexer(
        config: &KafkaConfig,
        pipeline: &str,
        run_id: &str,
    ) -> Result<Self, MessengerError> {
        let client_id = format!("sluice-indexer-{}-{}", pipeline, random_suffix());
        let group = format!("{}-indexer-{}", config.consumer_group_prefix, pipeline);

        let dest_consumer: StreamConsumer = Self::consumer_config(config, &client_id, &group)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(transport)?;
        dest_consumer
            .subscribe(&[&Self::dest_topic_name(config, pipeline)])
            .map_err(transport)?;

        let mut messenger = Self::bare(config, pipeline, run_id)?;
        messenger.dest_consumer = Some(dest_consumer);
        Ok(messenger)
    }

    /// Messenger for a publisher: produces to the source topic and drains
    /// the run's event topic.
    pub fn for_publisher(
        config: &KafkaConfig,
        pipeline: &str,
        run_id: &str,
    ) -> Result<Self, MessengerError> {
        let client_id = format!("sluice-publisher-{}-{}", pipeline, random_suffix());
        let group = format!("{}-publisher-{}", config.consumer_group_prefix, run_id);

        let event_consumer: StreamConsumer = Self::consumer_config(config, &client_id, &group)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(transport)?;
        event_consumer
            .subscribe(&[&Self::event_topic_name(config, run_id)])
            .map_err(transport)?;

        let mut messenger = Self::bare(config, pipeline, run_id)?;
        messenger.event_consumer = Some(event_consumer);
        Ok(messenger)
    }

    fn bare(config: &KafkaConfig, pipeline: &str, run_id: &str) -> Result<Self, MessengerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(transport)?;

        Ok(Self {
            config: config.clone(),
            pipeline: pipeline.to_string(),
            run_id: run_id.to_string(),
            producer,
            source_consumer: None,
            dest_consumer: None,
            event_consumer: None,
            accounting_consumer: None,
            dedup: DeduplicationQueue::new(Duration::from_millis(config.dedup_delay_ms)),
            offsets: OffsetLedger::new(),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            closed: AtomicBool::new(false),
        })
    }

    fn consumer_config(config: &KafkaConfig, client_id: &str, group: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("client.id", client_id)
            .set("group.id", group)
            .set("auto.offset.reset", "earliest");
        client_config
    }

    fn source_topic_name(config: &KafkaConfig, pipeline: &str) -> String {
        format!("{}.source.{}", config.topic_prefix, pipeline)
    }

    fn dest_topic_name(config: &KafkaConfig, pipeline: &str) -> String {
        format!("{}.dest.{}", config.topic_prefix, pipeline)
    }

    fn event_topic_name(config: &KafkaConfig, run_id: &str) -> String {
        format!("{}.events.{}", config.topic_prefix, run_id)
    }

    async fn produce(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), MessengerError> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);
        self.producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| transport(e))
    }

    fn parse_document(payload: &[u8]) -> Result<Document, MessengerError> {
        serde_json::from_slice(payload).map_err(MessengerError::from)
    }

    /// Drain the accounting consumer, feeding terminal events into the
    /// offset ledger.
    fn observe_events(&self) {
        let Some(consumer) = &self.accounting_consumer else {
            return;
        };
        while let Some(result) = consumer.poll(Duration::ZERO) {
            match result {
                Ok(message) => {
                    let Some(payload) = message.payload() else {
                        continue;
                    };
                    match serde_json::from_slice::<Event>(payload) {
                        Ok(event) => self.offsets.observe(&event),
                        Err(e) => warn!("dropping malformed event payload: {e}"),
                    }
                }
                Err(e) => {
                    warn!("event accounting poll failed: {e}");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Messenger for KafkaMessenger {
    async fn poll_doc(&self) -> Result<Option<Document>, MessengerError> {
        let Some(consumer) = &self.source_consumer else {
            return Err(MessengerError::transport(
                "messenger has no source consumer",
            ));
        };
        match tokio::time::timeout(self.poll_timeout, consumer.recv()).await {
            Err(_elapsed) => {}
            Ok(Err(e)) => return Err(transport(e)),
            Ok(Ok(message)) => {
                let payload = message
                    .payload()
                    .ok_or_else(|| MessengerError::serialization("empty record payload"))?;
                let mut doc = Self::parse_document(payload)?;
                doc.set_source_offset(SourceOffset {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                });
                self.offsets.track(&doc);
                self.dedup.offer(doc);
            }
        }
        Ok(self.dedup.poll_ready())
    }

    async fn send_for_processing(&self, doc: Document) -> Result<(), MessengerError> {
        let payload = serde_json::to_vec(&doc)?;
        let topic = Self::source_topic_name(&self.config, &self.pipeline);
        self.produce(&topic, doc.id(), payload).await
    }

    async fn send_completed(&self, doc: Document) -> Result<(), MessengerError> {
        self.offsets.track_result(&doc);
        let payload = serde_json::to_vec(&doc)?;
        let topic = Self::dest_topic_name(&self.config, &self.pipeline);
        self.produce(&topic, doc.id(), payload).await
    }

    async fn poll_completed(&self) -> Result<Option<Document>, MessengerError> {
        let Some(consumer) = &self.dest_consumer else {
            return Err(MessengerError::transport(
                "messenger has no destination consumer",
            ));
        };
        match tokio::time::timeout(self.poll_timeout, consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(transport(e)),
            Ok(Ok(message)) => {
                let payload = message
                    .payload()
                    .ok_or_else(|| MessengerError::serialization("empty record payload"))?;
                let mut doc = Self::parse_document(payload)?;
                if doc.source_offset().is_none() {
                    doc.set_source_offset(SourceOffset {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                    });
                }
                Ok(Some(doc))
            }
        }
    }

    async fn send_event(&self, event: Event) -> Result<(), MessengerError> {
        let payload = serde_json::to_vec(&event)?;
        let topic = Self::event_topic_name(&self.config, &event.run_id);
        self.produce(&topic, &event.document_id, payload).await
    }

    async fn poll_event(&self) -> Result<Option<Event>, MessengerError> {
        let Some(consumer) = &self.event_consumer else {
            return Err(MessengerError::transport("messenger has no event consumer"));
        };
        match tokio::time::timeout(self.poll_timeout, consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(transport(e)),
            Ok(Ok(message)) => {
                let Some(payload) = message.payload() else {
                    return Ok(None);
                };
                match serde_json::from_slice::<Event>(payload) {
                    Ok(event) => Ok(Some(event)),
                    Err(e) => {
                        // Malformed events are logged and dropped; the
                        // event-drain path never errors on them.
                        warn!("dropping malformed event payload: {e}");
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn has_events(&self) -> Result<bool, MessengerError> {
        let Some(consumer) = &self.event_consumer else {
            return Ok(false);
        };
        // The event topic is created with a single partition.
        let topic = Self::event_topic_name(&self.config, &self.run_id);
        let (_low, high) = consumer
            .fetch_watermarks(&topic, 0, ADMIN_TIMEOUT)
            .map_err(transport)?;
        let position = consumer.position().map_err(transport)?;
        let consumed = position
            .find_partition(&topic, 0)
            .and_then(|p| p.offset().to_raw())
            .unwrap_or(0);
        Ok(consumed < high)
    }

    async fn commit_pending_offsets(&self) -> Result<(), MessengerError> {
        self.observe_events();
        let settled = self.offsets.take_committable();
        if settled.is_empty() {
            return Ok(());
        }
        let Some(consumer) = &self.source_consumer else {
            return Ok(());
        };

        // Collapse to the highest settled offset per partition; the commit
        // marks the next record to read.
        let mut highest: HashMap<(String, i32), i64> = HashMap::new();
        for offset in settled {
            let entry = highest
                .entry((offset.topic.clone(), offset.partition))
                .or_insert(offset.offset);
            *entry = (*entry).max(offset.offset);
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), offset) in &highest {
            list.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                .map_err(transport)?;
        }
        consumer.commit(&list, CommitMode::Sync).map_err(transport)?;
        debug!(partitions = highest.len(), "committed settled source offsets");
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.producer.flush(ADMIN_TIMEOUT).map_err(transport)?;
        if let Some(consumer) = &self.source_consumer {
            consumer.unsubscribe();
        }
        if let Some(consumer) = &self.dest_consumer {
            consumer.unsubscribe();
        }
        if let Some(consumer) = &self.event_consumer {
            consumer.unsubscribe();
        }
        if let Some(consumer) = &self.accounting_consumer {
            consumer.unsubscribe();
        }
        Ok(())
    }
}

/// Factory handing each worker its own [`KafkaMessenger`] with a unique
/// client id.
pub struct KafkaMessengerFactory {
    config: KafkaConfig,
    pipeline: String,
    run_id: String,
}

impl KafkaMessengerFactory {
    /// A factory for workers of the given pipeline and run.
    pub fn new(config: KafkaConfig, pipeline: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            config,
            pipeline: pipeline.into(),
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl MessengerFactory for KafkaMessengerFactory {
    async fn create(&self) -> Result<std::sync::Arc<dyn Messenger>, MessengerError> {
        let messenger = KafkaMessenger::for_worker(&self.config, &self.pipeline, &self.run_id)?;
        Ok(std::sync::Arc::new(messenger))
    }
}
