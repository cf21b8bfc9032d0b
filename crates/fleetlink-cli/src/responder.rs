//! Handler bound to each `[[subscriptions]]` entry.

use async_trait::async_trait;
use fleetlink_middleware::{FleetAgent, TopicHandler};
use fleetlink_types::Message;
use serde_json::Value;
use tracing::{info, warn};

/// Logs every message on its topic and, when configured, publishes a fixed
/// reply on the same topic.
pub struct ReplyHandler {
    agent: FleetAgent,
    topic: String,
    reply: Option<String>,
}

impl ReplyHandler {
    pub fn new(agent: FleetAgent, topic: impl Into<String>, reply: Option<String>) -> Self {
        Self {
            agent,
            topic: topic.into(),
            reply,
        }
    }

    /// The reply to send for `payload`, if any.  A payload equal to our own
    /// reply gets none, so two responders on one topic do not loop.
    fn reply_for(&self, payload: &Value) -> Option<&str> {
        let reply = self.reply.as_deref()?;
        (payload.as_str() != Some(reply)).then_some(reply)
    }
}

#[async_trait]
impl TopicHandler for ReplyHandler {
    async fn on_message(&self, message: &Message) {
        info!(
            topic = %self.topic,
            sender = %message.sender,
            payload = %message.payload,
            "received"
        );
        let Some(reply) = self.reply_for(&message.payload) else {
            return;
        };
        match self.agent.publish_to_topic(&self.topic, reply).await {
            Ok(report) if report.is_complete() => {
                info!(topic = %self.topic, reply, delivered = report.succeeded.len(), "replied")
            }
            Ok(report) => warn!(topic = %self.topic, failed = report.failed.len(), "reply partially delivered"),
            Err(e) => warn!(topic = %self.topic, error = %e, "reply not sent"),
        }
    }
}
