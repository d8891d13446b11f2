use crate::error::{AppError, Result};
use crate::models::OutboxMessage;
use async_trait::async_trait;
use chrono::Utc;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Destination for outbox notifications. Delivery is at-least-once, so
/// consumers deduplicate on the `message-id` header / message id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, message: &OutboxMessage) -> Result<()>;
}

/// Publishes each notification to `{topic_prefix}.{topic}`, keyed by user id
/// so a user's notifications stay ordered within the partition.
pub struct KafkaNotificationSink {
    client: Arc<Client>,
    topic_prefix: String,
    partition_clients: RwLock<BTreeMap<String, Arc<PartitionClient>>>,
}

impl KafkaNotificationSink {
    pub async fn connect(brokers: &str, topic_prefix: impl Into<String>) -> Result<Self> {
        let brokers: Vec<String> = brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() {
            return Err(AppError::Validation("no Kafka brokers configured".to_string()));
        }

        info!("Connecting to Kafka brokers: {:?}", brokers);
        let client = ClientBuilder::new(brokers).build().await?;
        info!("Successfully connected to Kafka");

        Ok(Self::new(Arc::new(client), topic_prefix))
    }

    pub fn new(client: Arc<Client>, topic_prefix: impl Into<String>) -> Self {
        Self {
            client,
            topic_prefix: topic_prefix.into(),
            partition_clients: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    pub fn topic_for(&self, topic: &str) -> String {
        format!("{}.{}", self.topic_prefix, topic)
    }

    async fn partition_client(&self, topic: &str) -> Result<Arc<PartitionClient>> {
        {
            let clients = self.partition_clients.read().await;
            if let Some(client) = clients.get(topic) {
                return Ok(Arc::clone(client));
            }
        }

        let partition_client = Arc::new(
            self.client
                .partition_client(topic.to_string(), 0, UnknownTopicHandling::Retry)
                .await?,
        );

        let mut clients = self.partition_clients.write().await;
        let client = clients
            .entry(topic.to_string())
            .or_insert_with(|| Arc::clone(&partition_client));
        Ok(Arc::clone(client))
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        let topic = self.topic_for(&message.topic);
        let value = serde_json::to_vec(&message.payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize payload: {}", e)))?;

        let mut headers = BTreeMap::new();
        headers.insert("message-id".to_string(), message.id.to_string().into_bytes());
        headers.insert("topic".to_string(), message.topic.clone().into_bytes());

        let record = Record {
            key: Some(message.user_id.to_string().into_bytes()),
            value: Some(value),
            headers,
            timestamp: Utc::now(),
        };

        let offsets = self
            .partition_client(&topic)
            .await?
            .produce(vec![record], Compression::NoCompression)
            .await?;

        debug!(
            message_id = %message.id,
            topic = %topic,
            offset = offsets.first().copied().unwrap_or_default(),
            "Notification published"
        );
        Ok(())
    }
}

/// Writes notifications to the log. Used when Kafka is disabled.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        info!(
            message_id = %message.id,
            topic = %message.topic,
            user_id = %message.user_id,
            payload = %message.payload,
            "Notification"
        );
        Ok(())
    }
}
