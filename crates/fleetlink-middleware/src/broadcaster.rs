//! Fan-out of one message to many vehicles.
//!
//! [`Broadcaster`] resolves each target through a single roster snapshot,
//! encodes the message once, and hands the frame to the [`Transport`] for
//! every target concurrently.  Per-target failures are collected into a
//! [`DeliveryReport`]; they never stop delivery to the other targets.

use std::collections::HashSet;
use std::sync::Arc;

use fleetlink_types::{DeliveryError, DeliveryReport, Endpoint, FleetError, Message, VehicleId};
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::{FleetRegistry, TopicRegistry};
use crate::transport::Transport;
use crate::wire::encode_frame;

/// Which vehicles a broadcast is addressed to.
///
/// The local vehicle is never a target, whatever the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every roster member except the message sender and the listed vehicles.
    AllExcept(Vec<VehicleId>),
    /// Exactly these vehicles (duplicates collapsed, order kept).
    Only(Vec<VehicleId>),
}

impl Targets {
    /// Every roster member except the message sender.
    pub fn fleet() -> Self {
        Targets::AllExcept(Vec::new())
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    local: VehicleId,
    fleet: Arc<FleetRegistry>,
    transport: Arc<dyn Transport>,
}

impl Broadcaster {
    pub fn new(local: VehicleId, fleet: Arc<FleetRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            local,
            fleet,
            transport,
        }
    }

    /// Deliver `message` to every vehicle selected by `targets`.
    ///
    /// A target missing from the roster is reported as
    /// [`DeliveryError::UnknownVehicle`].
    pub async fn broadcast(&self, message: &Message, targets: Targets) -> DeliveryReport {
        let plan = self.resolve(message, targets).await;
        if plan.is_empty() {
            debug!(kind = ?message.kind, "broadcast has no targets");
            return DeliveryReport::default();
        }

        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = ?message.kind, error = %e, "could not encode outbound message");
                let mut report = DeliveryReport::default();
                for (vehicle, _) in plan {
                    report.record(vehicle, Err(DeliveryError::Encode(e.to_string())));
                }
                return report;
            }
        };

        let deliveries = plan.into_iter().map(|(vehicle, endpoint)| {
            let frame = &frame;
            async move {
                let outcome = match endpoint {
                    Some(endpoint) => self.transport.deliver(&endpoint, frame).await,
                    None => Err(DeliveryError::UnknownVehicle),
                };
                match &outcome {
                    Ok(()) => debug!(vehicle = %vehicle, kind = ?message.kind, "delivered"),
                    Err(e) => warn!(vehicle = %vehicle, kind = ?message.kind, error = %e, "delivery failed"),
                }
                (vehicle, outcome)
            }
        });

        let mut report = DeliveryReport::default();
        for (vehicle, outcome) in join_all(deliveries).await {
            report.record(vehicle, outcome);
        }
        report
    }

    /// Send a Data message to every remote subscriber of `topic`.
    ///
    /// Subscribers equal to the local vehicle are skipped, so a topic only
    /// the local vehicle subscribes to produces no network traffic.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownTopic`] when the topic has never been
    /// subscribed to or announced.
    pub async fn publish(
        &self,
        topics: &TopicRegistry,
        topic: &str,
        payload: Value,
    ) -> Result<DeliveryReport, FleetError> {
        let subscribers = topics.remote_subscribers(topic).await?;
        let message = Message::data(self.local.clone(), topic, payload);
        Ok(self.broadcast(&message, Targets::Only(subscribers)).await)
    }

    /// Turn `targets` into (vehicle, endpoint) pairs from one roster snapshot.
    async fn resolve(
        &self,
        message: &Message,
        targets: Targets,
    ) -> Vec<(VehicleId, Option<Endpoint>)> {
        let roster = self.fleet.snapshot().await;
        match targets {
            Targets::AllExcept(excluded) => {
                let mut plan: Vec<(VehicleId, Option<Endpoint>)> = roster
                    .into_iter()
                    .filter(|(vehicle, _)| {
                        *vehicle != self.local
                            && *vehicle != message.sender
                            && !excluded.contains(vehicle)
                    })
                    .map(|(vehicle, endpoint)| (vehicle, Some(endpoint)))
                    .collect();
                plan.sort_by(|a, b| a.0.cmp(&b.0));
                plan
            }
            Targets::Only(list) => {
                let mut seen = HashSet::new();
                list.into_iter()
                    .filter(|vehicle| *vehicle != self.local && seen.insert(vehicle.clone()))
                    .map(|vehicle| {
                        let endpoint = roster.get(&vehicle).cloned();
                        (vehicle, endpoint)
                    })
                    .collect()
            }
        }
    }
}
