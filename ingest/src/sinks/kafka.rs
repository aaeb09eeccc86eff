use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::api::IngestError;
use crate::config::KafkaConfig;
use crate::sinks::{Category, CategoryRows, RowSink};

struct IngestKafkaContext;

impl rdkafka::ClientContext for IngestKafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("ingest_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("ingest_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("ingest_kafka_callback_queue_depth").set(stats.replyq as f64);
    }
}

/// Store writer: the analytical store ingests from one Kafka topic per
/// category, so per-category isolation falls out of the topic split.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<IngestKafkaContext>,
    analytics_topic: String,
    debug_topic: String,
    forms_topic: String,
}

impl KafkaSink {
    pub fn new(config: KafkaConfig) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", config.kafka_compression_codec.clone())
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<IngestKafkaContext> =
            client_config.create_with_context(IngestKafkaContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        let _metadata = producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?;
        info!("connected to Kafka brokers");

        Ok(KafkaSink {
            producer,
            analytics_topic: config.kafka_analytics_topic,
            debug_topic: config.kafka_debug_topic,
            forms_topic: config.kafka_forms_topic,
        })
    }

    fn topic_for(&self, category: Category) -> &str {
        match category {
            Category::Analytics => &self.analytics_topic,
            Category::Debug => &self.debug_topic,
            Category::Forms => &self.forms_topic,
        }
    }

    fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: &str,
    ) -> Result<DeliveryFuture, IngestError> {
        match self.producer.send_result(FutureRecord {
            topic,
            payload: Some(payload),
            partition: None,
            key: Some(key),
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    counter!("ingest_rows_dropped_total", "cause" => "kafka_message_size")
                        .increment(1);
                    Err(IngestError::NonRetryableSinkError)
                }
                _ => {
                    error!("failed to produce row: {}", e);
                    Err(IngestError::RetryableSinkError)
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), IngestError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(IngestError::RetryableSinkError)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                counter!("ingest_rows_dropped_total", "cause" => "kafka_message_size")
                    .increment(1);
                Err(IngestError::NonRetryableSinkError)
            }
            Ok(Err((err, _))) => {
                counter!("ingest_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(IngestError::RetryableSinkError)
            }
            Ok(Ok(_)) => {
                counter!("ingest_rows_written_total", "category" => "kafka").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RowSink for KafkaSink {
    #[instrument(skip_all, fields(category = rows.category().as_str(), rows = rows.len()))]
    async fn append(&self, rows: CategoryRows) -> Result<(), IngestError> {
        let topic = self.topic_for(rows.category()).to_string();
        let batch_size = rows.len();

        let mut set = JoinSet::new();
        for (key, payload) in rows.payloads()? {
            // Queue sequentially so rows of one session stay ordered in the
            // producer, then wait for all broker ACKs concurrently
            let ack = self.produce(&topic, &key, &payload)?;
            set.spawn(Self::process_ack(ack));
        }

        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    set.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    set.abort_all();
                    error!("join error while waiting on Kafka ACK: {:?}", err);
                    return Err(IngestError::RetryableSinkError);
                }
            }
        }

        histogram!("ingest_row_batch_size", "category" => rows.category().as_str())
            .record(batch_size as f64);
        Ok(())
    }
}
