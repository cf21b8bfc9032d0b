use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Unique name of one agent in the fleet, independent of its network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    /// Build an identity, rejecting empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Result<Self, FleetError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FleetError::Validation("vehicle name must not be empty".into()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for VehicleId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for VehicleId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Reachable location of a vehicle's listener.
///
/// `address` may be an IP literal or a resolvable hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Build an endpoint from user-supplied strings.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Validation`] when the address is empty or the
    /// port is empty, not a number, or zero.
    pub fn parse(address: &str, port: &str) -> Result<Self, FleetError> {
        if address.trim().is_empty() {
            return Err(FleetError::Validation("address must not be empty".into()));
        }
        let port = port.trim();
        if port.is_empty() {
            return Err(FleetError::Validation("port must not be empty".into()));
        }
        let port: u16 = port
            .parse()
            .map_err(|e| FleetError::Validation(format!("invalid port '{port}': {e}")))?;
        if port == 0 {
            return Err(FleetError::Validation("port must not be zero".into()));
        }
        Ok(Self::new(address.trim(), port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// What an inbound [`Message`] asks the receiving agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Application data published on a topic.
    Data,
    /// "Vehicle `sender` is reachable at the endpoint in `payload`."
    RosterAnnounce,
    /// "Vehicle `sender` subscribes to `topic`."
    TopicSubscriptionAnnounce,
}

/// Envelope carried by every fleet frame.
///
/// `id` and `timestamp` are informational (tracing and logs); they carry no
/// ordering semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    #[serde(default)]
    pub topic: Option<String>,
    pub sender: VehicleId,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    fn envelope(kind: MessageKind, topic: Option<String>, sender: VehicleId, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            topic,
            sender,
            payload,
        }
    }

    pub fn data(sender: VehicleId, topic: impl Into<String>, payload: Value) -> Self {
        Self::envelope(MessageKind::Data, Some(topic.into()), sender, payload)
    }

    /// Announce `vehicle` at `endpoint`. The announced vehicle is the sender.
    pub fn roster_announce(vehicle: VehicleId, endpoint: &Endpoint) -> Result<Self, FleetError> {
        let payload =
            serde_json::to_value(endpoint).map_err(|e| FleetError::Serialization(e.to_string()))?;
        Ok(Self::envelope(MessageKind::RosterAnnounce, None, vehicle, payload))
    }

    pub fn subscription_announce(sender: VehicleId, topic: impl Into<String>) -> Self {
        Self::envelope(
            MessageKind::TopicSubscriptionAnnounce,
            Some(topic.into()),
            sender,
            Value::Null,
        )
    }

    /// The topic field, or a protocol error for kinds that require one.
    pub fn require_topic(&self) -> Result<&str, FleetError> {
        match self.topic.as_deref() {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(FleetError::Protocol(format!(
                "{:?} message from {} carries no topic",
                self.kind, self.sender
            ))),
        }
    }

    /// Decode the payload of a [`MessageKind::RosterAnnounce`].
    pub fn announced_endpoint(&self) -> Result<Endpoint, FleetError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FleetError::Protocol(format!("roster announce from {} has bad endpoint: {e}", self.sender))
        })
    }
}

/// Global error type for registry, wire, and listener failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FleetError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Wire Protocol Error: {0}")]
    Protocol(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Listener Error: {0}")]
    Listener(String),
}

/// Why a single target did not receive a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryError {
    #[error("vehicle is not in the roster")]
    UnknownVehicle,

    #[error("connect to {endpoint} failed: {details}")]
    Connect { endpoint: String, details: String },

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("could not encode frame: {0}")]
    Encode(String),
}

/// One target that a broadcast or publish could not reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub vehicle: VehicleId,
    pub error: DeliveryError,
}

/// Aggregate outcome of a fan-out. Failures never abort the remaining targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub succeeded: Vec<VehicleId>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of targets that were attempted.
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn record(&mut self, vehicle: VehicleId, outcome: Result<(), DeliveryError>) {
        match outcome {
            Ok(()) => self.succeeded.push(vehicle),
            Err(error) => self.failed.push(DeliveryFailure { vehicle, error }),
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}
