//! AMQP 0-9-1 gateway backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::{Number, Value};
use tracing::{debug, info};
use uuid::Uuid;
use warren_core::{
    BindingSpec, BoxedGateway, BrokerGateway, Connector, DeliveryStream, DeliveryTag,
    ExchangeKind, ExchangeSpec, GatewayError, GatewayResult, Headers, InboundMessage,
    OutboundMessage, QueueSpec,
};

/// Opens `lapin` connections to one broker URL.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: "warren".to_string(),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> GatewayResult<BoxedGateway> {
        let failed = |e: lapin::Error| GatewayError::ConnectionFailed {
            url: self.describe(),
            reason: e.to_string(),
        };

        let connection = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await
        .map_err(failed)?;
        let channel = connection.create_channel().await.map_err(failed)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(failed)?;

        info!(url = %self.describe(), "Connected to AMQP broker");
        Ok(Arc::new(AmqpGateway {
            connection,
            channel,
        }))
    }

    /// The URL with credentials removed.
    fn describe(&self) -> String {
        redact(&self.url)
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// One AMQP connection with a single channel in publisher-confirm mode.
///
/// Frames on the channel are serialized by lapin; no extra lock is held.
pub struct AmqpGateway {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerGateway for AmqpGateway {
    async fn consume(&self, queue: &str, prefetch: u16) -> GatewayResult<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(GatewayError::channel)?;

        let tag = format!("warren-{queue}-{}", Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(GatewayError::channel)?;
        debug!(queue, consumer_tag = %tag, prefetch, "Consuming");

        let queue = queue.to_string();
        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| {
                        let properties = &d.properties;
                        InboundMessage {
                            queue: queue.clone(),
                            exchange: d.exchange.as_str().to_string(),
                            routing_key: d.routing_key.as_str().to_string(),
                            headers: properties
                                .headers()
                                .as_ref()
                                .map(from_field_table)
                                .unwrap_or_default(),
                            correlation_id: properties
                                .correlation_id()
                                .as_ref()
                                .map(short_string),
                            reply_to: properties.reply_to().as_ref().map(short_string),
                            redelivered: d.redelivered,
                            delivery_tag: DeliveryTag::new(d.delivery_tag),
                            payload: d.data,
                        }
                    })
                    .map_err(GatewayError::channel)
            })
            .boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> GatewayResult<()> {
        self.channel
            .basic_ack(tag.get(), BasicAckOptions::default())
            .await
            .map_err(GatewayError::channel)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> GatewayResult<()> {
        self.channel
            .basic_nack(
                tag.get(),
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(GatewayError::channel)
    }

    async fn publish(&self, message: OutboundMessage) -> GatewayResult<()> {
        let failed = |e: lapin::Error| GatewayError::PublishFailed {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            reason: e.to_string(),
        };

        let mut properties = BasicProperties::default().with_delivery_mode(2);
        if let Some(content_type) = &message.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }
        if let Some(id) = &message.correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(failed)?;
        let confirmation = confirm.await.map_err(failed)?;
        check_confirmation(&confirmation).map_err(|reason| GatewayError::PublishFailed {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            reason: reason.to_string(),
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> GatewayResult<String> {
        let mut args = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.as_str().into()),
            );
        }
        if let Some(key) = &spec.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(key.as_str().into()),
            );
        }
        if let Some(ttl) = spec.message_ttl {
            let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt(millis));
        }

        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| GatewayError::topology(&spec.name, e))?;
        Ok(short_string(queue.name()))
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> GatewayResult<()> {
        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| GatewayError::topology(&spec.name, e))
    }

    async fn bind(&self, spec: &BindingSpec) -> GatewayResult<()> {
        self.channel
            .queue_bind(
                &spec.queue,
                &spec.exchange,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| GatewayError::topology(&spec.queue, e))
    }

    async fn close(&self) -> GatewayResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "warren shutdown")
            .await
            .map_err(GatewayError::channel)
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// A publish only counts once the broker has acked it.
fn check_confirmation(confirmation: &Confirmation) -> Result<(), &'static str> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err("broker rejected the message"),
        Confirmation::NotRequested => Err("publisher confirms are not enabled on the channel"),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), to_amqp(value));
    }
    table
}

fn to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(n.to_string().into()),
        },
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.as_str().into(), to_amqp(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (short_string(key), from_amqp(value)))
        .collect()
}

fn from_amqp(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(short_string(s)),
        AMQPValue::LongString(s) => Value::String(long_string(s)),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp).collect())
        }
        AMQPValue::FieldTable(table) => {
            Value::Object(from_field_table(table).into_iter().collect())
        }
        AMQPValue::ByteArray(bytes) => {
            Value::String(String::from_utf8_lossy(bytes.as_slice()).into_owned())
        }
        AMQPValue::DecimalValue(d) => Value::from(d.value),
        AMQPValue::Void => Value::Null,
    }
}

fn short_string(s: &ShortString) -> String {
    s.as_str().to_string()
}

fn long_string(s: &LongString) -> String {
    String::from_utf8_lossy(s.as_bytes()).into_owned()
}
