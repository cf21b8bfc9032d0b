//! Interpretation of inbound fleet messages.
//!
//! [`Dispatcher::dispatch`] is the single place where peer traffic touches
//! local state:
//!
//! | Kind | Effect |
//! |---|---|
//! | any, sent by the local vehicle | discarded |
//! | `Data` | every local handler for the topic is awaited with the message |
//! | `RosterAnnounce` | `roster[sender] = payload` (last write wins) |
//! | `TopicSubscriptionAnnounce` | `(sender, none)` appended to the topic, once |

use std::sync::Arc;

use fleetlink_types::{Endpoint, FleetError, Message, MessageKind, VehicleId};
use tracing::{debug, info};

use crate::registry::{FleetRegistry, TopicRegistry};

/// What a dispatched message did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message came from the local vehicle and was dropped.
    IgnoredOwnMessage,
    /// A Data message was handed to this many local handlers.
    Delivered(usize),
    /// The sender's roster entry was written; `previous` is the value it
    /// replaced.
    RosterUpdated { previous: Option<Endpoint> },
    /// The sender was recorded as a new subscriber of the topic.
    SubscriberAdded,
    /// The sender was already recorded for the topic; nothing changed.
    DuplicateSubscriber,
}

#[derive(Clone)]
pub struct Dispatcher {
    local: VehicleId,
    fleet: Arc<FleetRegistry>,
    topics: Arc<TopicRegistry>,
}

impl Dispatcher {
    pub fn new(local: VehicleId, fleet: Arc<FleetRegistry>, topics: Arc<TopicRegistry>) -> Self {
        Self {
            local,
            fleet,
            topics,
        }
    }

    /// Apply one inbound message.
    ///
    /// # Errors
    ///
    /// * [`FleetError::UnknownTopic`] – Data for a topic this vehicle has no
    ///   record of.  Nothing is mutated.
    /// * [`FleetError::Protocol`] – the message is missing its topic or
    ///   carries an undecodable roster payload.  Nothing is mutated.
    pub async fn dispatch(&self, message: Message) -> Result<DispatchOutcome, FleetError> {
        if message.sender == self.local {
            debug!(id = %message.id, kind = ?message.kind, "ignoring message from self");
            return Ok(DispatchOutcome::IgnoredOwnMessage);
        }

        match message.kind {
            MessageKind::Data => {
                let topic = message.require_topic()?;
                // Handlers are cloned out so none runs under the registry lock.
                let handlers = self.topics.local_handlers(topic).await?;
                for handler in &handlers {
                    handler.on_message(&message).await;
                }
                debug!(
                    topic = %topic,
                    sender = %message.sender,
                    handlers = handlers.len(),
                    "data delivered"
                );
                Ok(DispatchOutcome::Delivered(handlers.len()))
            }
            MessageKind::RosterAnnounce => {
                let endpoint = message.announced_endpoint()?;
                let previous = self
                    .fleet
                    .upsert(message.sender.clone(), endpoint.clone())
                    .await;
                if previous.as_ref() != Some(&endpoint) {
                    info!(vehicle = %message.sender, endpoint = %endpoint, "roster updated");
                }
                Ok(DispatchOutcome::RosterUpdated { previous })
            }
            MessageKind::TopicSubscriptionAnnounce => {
                let topic = message.require_topic()?;
                if self.topics.add_remote(topic, message.sender.clone()).await? {
                    info!(topic = %topic, vehicle = %message.sender, "remote subscriber added");
                    Ok(DispatchOutcome::SubscriberAdded)
                } else {
                    debug!(topic = %topic, vehicle = %message.sender, "duplicate subscription announce");
                    Ok(DispatchOutcome::DuplicateSubscriber)
                }
            }
        }
    }
}
