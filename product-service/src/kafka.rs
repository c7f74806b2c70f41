use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use tracing::info;

use crate::error::{classify_publish_error, Error, Result};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, product_id: i64, payload: &[u8]) -> Result<()>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    brokers: String,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "10000")
            .set("acks", "1")
            .create()
            .map_err(|err| Error::Upstream(format!("kafka producer: {err}")))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            brokers: brokers.to_string(),
        })
    }

    pub async fn ensure_topic(&self, partitions: i32, replication_factor: i32) -> Result<()> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|err| Error::Upstream(format!("kafka admin: {err}")))?;

        let topic = NewTopic::new(
            &self.topic,
            partitions,
            TopicReplication::Fixed(replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));

        let results = admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|err| Error::Upstream(format!("create topic: {err}")))?;

        for result in results {
            match result {
                Ok(name) => info!("created kafka topic '{name}'"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(Error::Upstream(format!("create topic '{name}': {code}")))
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    // The message key pins per-product ordering under hash partitioning.
    async fn publish(&self, product_id: i64, payload: &[u8]) -> Result<()> {
        let key = product_id.to_string();
        let record = FutureRecord::to(&self.topic).payload(payload).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(err, _)| classify_publish_error(&err.to_string()))?;

        Ok(())
    }
}
