//! Fleet roster and topic subscription tables.
//!
//! Both registries are shared between the listener's connection tasks and
//! callers of the public API.  Each one owns its map behind a single
//! [`RwLock`]; every mutation and every multi-step read happens inside one
//! critical section, and readers only ever receive owned snapshots, so no
//! caller can observe a half-applied update.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use fleetlink_types::{Endpoint, FleetError, VehicleId};
use tokio::sync::RwLock;

use crate::handler::TopicHandler;

// ─────────────────────────────────────────────────────────────────────────────
// FleetRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Address book mapping every known vehicle to its listener endpoint.
#[derive(Default)]
pub struct FleetRegistry {
    entries: RwLock<HashMap<VehicleId, Endpoint>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registry from an initial roster.
    pub fn from_entries(entries: impl IntoIterator<Item = (VehicleId, Endpoint)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Insert or overwrite `vehicle`'s endpoint (last write wins).
    ///
    /// Returns the endpoint that was replaced, if any.
    pub async fn upsert(&self, vehicle: VehicleId, endpoint: Endpoint) -> Option<Endpoint> {
        self.entries.write().await.insert(vehicle, endpoint)
    }

    /// Insert `vehicle` only if it is not already known.
    ///
    /// Returns `true` when the entry was added.
    pub async fn insert_if_absent(&self, vehicle: VehicleId, endpoint: Endpoint) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&vehicle) {
            return false;
        }
        entries.insert(vehicle, endpoint);
        true
    }

    /// Resolve `vehicle` to its endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::UnknownVehicle`] when the vehicle is not in the
    /// roster.
    pub async fn lookup(&self, vehicle: &VehicleId) -> Result<Endpoint, FleetError> {
        self.entries
            .read()
            .await
            .get(vehicle)
            .cloned()
            .ok_or_else(|| FleetError::UnknownVehicle(vehicle.to_string()))
    }

    /// Consistent copy of the whole roster.
    pub async fn snapshot(&self) -> HashMap<VehicleId, Endpoint> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TopicRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// One vehicle recorded against a topic.
///
/// `handler` is only ever `Some` for the local vehicle.
#[derive(Clone)]
pub struct Subscriber {
    pub vehicle: VehicleId,
    pub handler: Option<Arc<dyn TopicHandler>>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("vehicle", &self.vehicle)
            .field("handler", if self.handler.is_some() { &"<local>" } else { &"<none>" })
            .finish()
    }
}

/// Subscription table mapping each topic to its ordered subscriber list.
pub struct TopicRegistry {
    local: VehicleId,
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl TopicRegistry {
    /// Create an empty table owned by the vehicle `local`.
    pub fn new(local: VehicleId) -> Self {
        Self {
            local,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// The vehicle whose handlers this table may invoke.
    pub fn local(&self) -> &VehicleId {
        &self.local
    }

    /// Register the local vehicle as a subscriber of `topic` bound to
    /// `handler`.
    ///
    /// Existing entries for the topic are preserved; the new entry is
    /// appended.  Subscribing twice registers two handlers, and both fire.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Validation`] for an empty topic name.
    pub async fn subscribe_local(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
    ) -> Result<(), FleetError> {
        validate_topic(topic)?;
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                vehicle: self.local.clone(),
                handler: Some(handler),
            });
        Ok(())
    }

    /// Record `vehicle` as a handler-less subscriber of `topic`, creating the
    /// topic if needed.
    ///
    /// Returns `false` (and changes nothing) when `vehicle` already has a
    /// handler-less entry for the topic, so repeated announces from the same
    /// peer never produce duplicate deliveries.
    pub async fn add_remote(&self, topic: &str, vehicle: VehicleId) -> Result<bool, FleetError> {
        validate_topic(topic)?;
        let mut topics = self.topics.write().await;
        let entries = topics.entry(topic.to_string()).or_default();
        let known = entries
            .iter()
            .any(|s| s.handler.is_none() && s.vehicle == vehicle);
        if known {
            return Ok(false);
        }
        entries.push(Subscriber {
            vehicle,
            handler: None,
        });
        Ok(true)
    }

    /// Identities subscribed to `topic`, in registration order.
    pub async fn subscribers(&self, topic: &str) -> Result<Vec<VehicleId>, FleetError> {
        let topics = self.topics.read().await;
        let entries = topics
            .get(topic)
            .ok_or_else(|| FleetError::UnknownTopic(topic.to_string()))?;
        Ok(entries.iter().map(|s| s.vehicle.clone()).collect())
    }

    /// Handlers registered by the local vehicle for `topic`.
    ///
    /// Entries whose identity is not the local vehicle are skipped even if a
    /// handler were somehow attached to them.
    pub async fn local_handlers(
        &self,
        topic: &str,
    ) -> Result<Vec<Arc<dyn TopicHandler>>, FleetError> {
        let topics = self.topics.read().await;
        let entries = topics
            .get(topic)
            .ok_or_else(|| FleetError::UnknownTopic(topic.to_string()))?;
        Ok(entries
            .iter()
            .filter(|s| s.vehicle == self.local)
            .filter_map(|s| s.handler.clone())
            .collect())
    }

    /// Distinct remote subscribers of `topic`, in registration order.
    pub async fn remote_subscribers(&self, topic: &str) -> Result<Vec<VehicleId>, FleetError> {
        let topics = self.topics.read().await;
        let entries = topics
            .get(topic)
            .ok_or_else(|| FleetError::UnknownTopic(topic.to_string()))?;
        let mut seen = HashSet::new();
        Ok(entries
            .iter()
            .filter(|s| s.vehicle != self.local)
            .filter(|s| seen.insert(s.vehicle.clone()))
            .map(|s| s.vehicle.clone())
            .collect())
    }

    /// All known topic names, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Topics the local vehicle holds at least one handler for, sorted.
    pub async fn local_topics(&self) -> Vec<String> {
        let topics = self.topics.read().await;
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, entries)| {
                entries
                    .iter()
                    .any(|s| s.vehicle == self.local && s.handler.is_some())
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

fn validate_topic(topic: &str) -> Result<(), FleetError> {
    if topic.trim().is_empty() {
        return Err(FleetError::Validation("topic name must not be empty".into()));
    }
    Ok(())
}
