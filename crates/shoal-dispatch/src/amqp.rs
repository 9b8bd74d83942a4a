use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::scope::Target;
use crate::transport::{AgentReply, AgentRequest, CommandTransport, TransportError};

/// Broker parameters. The broker itself handles transport security.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub connect_timeout: Duration,
}

/// The message published onto a target's command queue. The per-CN agent
/// reads the zonename to decide where to run the request.
#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    zonename: &'a str,
    request: &'a AgentRequest,
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<AgentReply>>>>;

/// AMQP 0-9-1 transport: one message per target on a per-target queue, with
/// a reply-to/correlation-id pattern over a single consumer queue.
pub struct AmqpTransport {
    channel: Channel,
    reply_queue: String,
    pending: PendingReplies,
}

impl AmqpTransport {
    pub async fn connect(config: &AmqpConfig) -> Result<Self, TransportError> {
        let uri = format!(
            "amqp://{}:{}@{}:{}/%2f",
            config.login, config.password, config.host, config.port
        );
        let connection = tokio::time::timeout(
            config.connect_timeout,
            Connection::connect(&uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            TransportError::Dispatch(format!(
                "broker connect timed out after {:?}",
                config.connect_timeout
            ))
        })?
        .map_err(|e| TransportError::Dispatch(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Dispatch(e.to_string()))?;

        let reply_queue = format!("shoal.reply.{}", Uuid::new_v4());
        channel
            .queue_declare(
                &reply_queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Dispatch(e.to_string()))?;

        let consumer = channel
            .basic_consume(
                &reply_queue,
                "shoal-dispatch",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Dispatch(e.to_string()))?;

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(route_replies(consumer, pending.clone()));

        debug!(queue = %reply_queue, "connected to broker");
        Ok(Self {
            channel,
            reply_queue,
            pending,
        })
    }

    fn command_queue(target: &Target) -> String {
        format!("shoal.agent.{}.{}", target.compute(), target.zonename())
    }
}

/// Route replies from the consumer queue to their waiting dispatch calls by
/// correlation id. Entries for requests that timed out stay in the map until
/// process exit; replies for them are dropped here.
async fn route_replies(mut consumer: Consumer, pending: PendingReplies) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(error = %err, "reply consumer failed");
                break;
            }
        };
        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            warn!(error = %err, "reply ack failed");
        }

        let Some(correlation) = delivery.properties.correlation_id().as_ref() else {
            continue;
        };
        let reply: AgentReply = match serde_json::from_slice(&delivery.data) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "unparsable agent reply");
                continue;
            }
        };
        if let Some(tx) = pending.lock().await.remove(correlation.as_str()) {
            let _ = tx.send(reply);
        }
    }
}

#[async_trait]
impl CommandTransport for AmqpTransport {
    async fn dispatch(
        &self,
        target: &Target,
        request: &AgentRequest,
    ) -> Result<AgentReply, TransportError> {
        let correlation = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation.clone(), tx);

        let envelope = CommandEnvelope {
            zonename: target.zonename(),
            request,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| TransportError::Dispatch(e.to_string()))?;
        let properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(correlation.clone()))
            .with_reply_to(ShortString::from(self.reply_queue.clone()));

        let queue = Self::command_queue(target);
        debug!(queue = %queue, target = target.uuid(), "publishing command");
        let confirm = self
            .channel
            .basic_publish(
                "",
                &queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await;
        let confirm = match confirm {
            Ok(confirm) => confirm,
            Err(err) => {
                self.pending.lock().await.remove(&correlation);
                return Err(TransportError::Dispatch(err.to_string()));
            }
        };
        if let Err(err) = confirm.await {
            self.pending.lock().await.remove(&correlation);
            return Err(TransportError::Dispatch(err.to_string()));
        }

        rx.await
            .map_err(|_| TransportError::Transport("reply channel closed".to_string()))
    }
}
