//! AMQP broker wrapper for the adaptation relay.
//!
//! The relay only sees the [`Publisher`] and [`Acknowledger`] seams and a
//! stream of [`InboundDelivery`] values; [`AmqpBroker`] backs them with lapin.

use crate::config::BrokerConfig;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Persistent delivery mode for published messages
const PERSISTENT: u8 = 2;

/// Errors raised by the broker seams
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Failed to declare {what}: {message}")]
    Declaration { what: String, message: String },

    #[error("Consumer error: {0}")]
    Consume(String),

    #[error("Failed to publish to {exchange}/{routing_key}: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Broker refused publish to {exchange}/{routing_key}")]
    Nacked { exchange: String, routing_key: String },

    #[error("Failed to settle delivery {delivery_tag}: {message}")]
    Settle { delivery_tag: u64, message: String },
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from the inbound binding
pub struct InboundDelivery {
    pub delivery_tag: u64,
    /// Set by the broker when this is a redelivery
    pub redelivered: bool,
    pub headers: FieldTable,
    /// The `reply-to` message property
    pub reply_to: Option<String>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("reply_to", &self.reply_to)
            .finish_non_exhaustive()
    }
}

/// Message to be published downstream
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: FieldTable,
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    /// A header-only message with an empty body
    pub fn headers_only(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        headers: FieldTable,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers,
            payload: Vec::new(),
        }
    }
}

/// Publishes to an exchange and waits for the broker to confirm
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError>;
}

/// Stream of inbound deliveries; an `Err` item means the consumer is broken
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, BrokerError>>;

/// lapin-backed broker with one channel for consuming and one for publishing
pub struct AmqpBroker {
    connection: Connection,
    consume_channel: Channel,
    publish_channel: Channel,
    config: BrokerConfig,
}

impl AmqpBroker {
    /// Connect and declare the inbound binding and the outbound target
    pub async fn connect(config: &BrokerConfig, prefetch: u16) -> Result<Self, BrokerError> {
        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connecting to message broker"
        );

        let connection =
            Connection::connect_uri(config.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let consume_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        consume_channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| declaration("consumer prefetch", e))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| declaration("publisher confirms", e))?;

        let broker = Self {
            connection,
            consume_channel,
            publish_channel,
            config: config.clone(),
        };
        broker.declare_topology().await?;

        Ok(broker)
    }

    async fn declare_topology(&self) -> Result<(), BrokerError> {
        let inbound = &self.config.inbound;
        let outbound = &self.config.outbound;

        declare_exchange(&self.consume_channel, &inbound.exchange).await?;
        declare_bound_queue(
            &self.consume_channel,
            &inbound.queue,
            &inbound.exchange,
            &inbound.routing_key,
        )
        .await?;

        declare_exchange(&self.publish_channel, &outbound.exchange).await?;
        if let Some(ref queue) = outbound.queue {
            declare_bound_queue(
                &self.publish_channel,
                queue,
                &outbound.exchange,
                &outbound.routing_key,
            )
            .await?;
        }

        info!(
            inbound_queue = %inbound.queue,
            outbound_exchange = %outbound.exchange,
            outbound_routing_key = %outbound.routing_key,
            "Broker topology declared"
        );

        Ok(())
    }

    /// Start consuming the inbound queue
    pub async fn consume(&self) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .consume_channel
            .basic_consume(
                &self.config.inbound.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        info!(queue = %self.config.inbound.queue, "Subscribed to inbound queue");

        Ok(consumer
            .map(|result| {
                result
                    .map(InboundDelivery::from)
                    .map_err(|e| BrokerError::Consume(e.to_string()))
            })
            .boxed())
    }

    /// Close the connection, logging instead of failing
    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "relay shutting down").await {
            warn!(error = %e, "Failed to close broker connection");
        }
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    #[instrument(skip(self, message), fields(exchange = %message.exchange, routing_key = %message.routing_key))]
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        let publish_error = |e: lapin::Error| BrokerError::Publish {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            message: e.to_string(),
        };

        let properties = BasicProperties::default()
            .with_headers(message.headers.clone())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .publish_channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Nacked {
                exchange: message.exchange,
                routing_key: message.routing_key,
            });
        }

        debug!("Message confirmed by broker");
        Ok(())
    }
}

struct AmqpAcker {
    delivery_tag: u64,
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Settle {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            reply_to: delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            acker: Box::new(AmqpAcker {
                delivery_tag: delivery.delivery_tag,
                acker: delivery.acker,
            }),
        }
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration(&format!("exchange {exchange}"), e))
}

async fn declare_bound_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration(&format!("queue {queue}"), e))?;

    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| declaration(&format!("binding {exchange}/{routing_key} -> {queue}"), e))
}

fn declaration(what: &str, e: lapin::Error) -> BrokerError {
    BrokerError::Declaration {
        what: what.to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{AMQPValue, LongString};

    #[test]
    fn test_headers_only_message_has_empty_body() {
        let mut headers = FieldTable::default();
        headers.insert(
            "file-id".into(),
            AMQPValue::LongString(LongString::from("F1".to_string())),
        );

        let message =
            OutgoingMessage::headers_only("processing-exchange", "processing-request", headers.clone());

        assert!(message.payload.is_empty());
        assert_eq!(message.exchange, "processing-exchange");
        assert_eq!(message.routing_key, "processing-request");
        assert_eq!(message.headers, headers);
    }

    #[test]
    fn test_broker_error_messages() {
        let err = BrokerError::Nacked {
            exchange: "processing-exchange".to_string(),
            routing_key: "processing-request".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Broker refused publish to processing-exchange/processing-request"
        );

        let err = BrokerError::Declaration {
            what: "queue adaptation-request-queue".to_string(),
            message: "PRECONDITION_FAILED".to_string(),
        };
        assert!(err.to_string().contains("adaptation-request-queue"));
    }
}
