//! [`FleetAgent`] – the public surface of the fleet link.
//!
//! One agent runs per vehicle.  It owns the vehicle's roster and
//! subscription table, a [`Listener`] feeding the [`Dispatcher`], and a
//! [`Broadcaster`] for outbound traffic.  All methods take `&self`; clone the
//! agent to share it between tasks or to hand it to a [`TopicHandler`] that
//! needs to publish replies.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetlink_middleware::{AgentConfig, FleetAgent, FnHandler};
//! use fleetlink_types::Endpoint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::new("Agent1", Endpoint::new("127.0.0.1", 65432))
//!         .with_vehicle("Agent2", Endpoint::new("127.0.0.1", 12345))
//!         .with_subscriber("Ping", "Agent2");
//!     let agent = FleetAgent::start(config).await?;
//!
//!     agent
//!         .subscribe_to_topic("Ping", Arc::new(FnHandler::new(|msg| println!("{}", msg.payload))))
//!         .await?;
//!     let report = agent.publish_to_topic("Ping", "Ping").await?;
//!     println!("delivered to {} vehicle(s)", report.succeeded.len());
//!
//!     agent.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use fleetlink_types::{DeliveryReport, Endpoint, FleetError, Message, VehicleId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broadcaster::{Broadcaster, Targets};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::handler::TopicHandler;
use crate::listener::{Listener, ListenerHandle};
use crate::registry::{FleetRegistry, TopicRegistry};
use crate::transport::{TcpTransport, Timeouts, Transport};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Construction-time configuration for a [`FleetAgent`].
///
/// Built with [`AgentConfig::new`] and the `with_*` builder methods.
#[derive(Clone)]
pub struct AgentConfig {
    /// Unique name of this vehicle.
    pub identity: String,
    /// Where the listener binds.  Port `0` picks an ephemeral port.
    pub listen: Endpoint,
    /// Initial roster.  An entry for `identity` is added if missing.
    pub roster: Vec<(String, Endpoint)>,
    /// Known remote subscribers, recorded without waiting for an announce.
    pub subscribers: Vec<(String, String)>,
    /// Local handlers registered at startup without announcing them.
    pub local_handlers: Vec<(String, Arc<dyn TopicHandler>)>,
    pub timeouts: Timeouts,
}

impl AgentConfig {
    pub fn new(identity: impl Into<String>, listen: Endpoint) -> Self {
        Self {
            identity: identity.into(),
            listen,
            roster: Vec::new(),
            subscribers: Vec::new(),
            local_handlers: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }

    /// Seed the roster with `vehicle` at `endpoint`.
    pub fn with_vehicle(mut self, vehicle: impl Into<String>, endpoint: Endpoint) -> Self {
        self.roster.push((vehicle.into(), endpoint));
        self
    }

    /// Record `vehicle` as a subscriber of `topic`.
    pub fn with_subscriber(mut self, topic: impl Into<String>, vehicle: impl Into<String>) -> Self {
        self.subscribers.push((topic.into(), vehicle.into()));
        self
    }

    /// Bind `handler` to `topic` for the local vehicle at startup.
    pub fn with_local_handler(mut self, topic: impl Into<String>, handler: Arc<dyn TopicHandler>) -> Self {
        self.local_handlers.push((topic.into(), handler));
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("identity", &self.identity)
            .field("listen", &self.listen)
            .field("roster", &self.roster)
            .field("subscribers", &self.subscribers)
            .field(
                "local_handlers",
                &self.local_handlers.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            )
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FleetAgent
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running fleet agent.  Cheap to clone.
#[derive(Clone)]
pub struct FleetAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    identity: VehicleId,
    local_addr: SocketAddr,
    fleet: Arc<FleetRegistry>,
    topics: Arc<TopicRegistry>,
    dispatcher: Dispatcher,
    broadcaster: Broadcaster,
    listener: Mutex<Option<ListenerHandle>>,
}

impl FleetAgent {
    /// Build the registries, bind the listener, and start accepting peer
    /// traffic over TCP.
    ///
    /// # Errors
    ///
    /// * [`FleetError::Validation`] – empty identity, roster name, or topic;
    ///   or a wildcard listen address (`0.0.0.0`, `::`) with no roster entry
    ///   for this vehicle.
    /// * [`FleetError::Listener`] – the listen endpoint cannot be bound.
    pub async fn start(config: AgentConfig) -> Result<Self, FleetError> {
        let transport = Arc::new(TcpTransport::new(config.timeouts));
        Self::start_with_transport(config, transport).await
    }

    /// Like [`FleetAgent::start`], but outbound frames go through
    /// `transport`.
    pub async fn start_with_transport(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, FleetError> {
        let identity = VehicleId::new(config.identity)?;
        if config.listen.address.trim().is_empty() {
            return Err(FleetError::Validation("listen address must not be empty".into()));
        }
        let self_seeded = config.roster.iter().any(|(name, _)| name == identity.as_str());
        if !self_seeded && is_wildcard(&config.listen.address) {
            return Err(FleetError::Validation(format!(
                "listen address {} cannot be advertised to peers; seed the roster with a reachable entry for {identity}",
                config.listen.address
            )));
        }

        let roster = config
            .roster
            .into_iter()
            .map(|(name, endpoint)| Ok((VehicleId::new(name)?, endpoint)))
            .collect::<Result<Vec<_>, FleetError>>()?;
        let fleet = Arc::new(FleetRegistry::from_entries(roster));

        let topics = Arc::new(TopicRegistry::new(identity.clone()));
        for (topic, vehicle) in config.subscribers {
            topics.add_remote(&topic, VehicleId::new(vehicle)?).await?;
        }
        for (topic, handler) in config.local_handlers {
            topics.subscribe_local(&topic, handler).await?;
        }

        let dispatcher = Dispatcher::new(identity.clone(), Arc::clone(&fleet), Arc::clone(&topics));
        let listener = Listener::bind(&config.listen, dispatcher.clone(), config.timeouts).await?;
        let local_addr = listener.local_addr();

        // The roster must always contain this vehicle.
        let advertised = Endpoint::new(config.listen.address.clone(), local_addr.port());
        fleet.insert_if_absent(identity.clone(), advertised).await;

        let broadcaster = Broadcaster::new(identity.clone(), Arc::clone(&fleet), transport);
        let handle = listener.spawn();
        info!(vehicle = %identity, addr = %local_addr, peers = fleet.len().await.saturating_sub(1), "fleet agent started");

        Ok(Self {
            inner: Arc::new(AgentInner {
                identity,
                local_addr,
                fleet,
                topics,
                dispatcher,
                broadcaster,
                listener: Mutex::new(Some(handle)),
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Add (or move) `name` in the roster and announce it to the rest of the
    /// fleet.
    ///
    /// The announce goes to every known vehicle other than this one and the
    /// vehicle being added.  It is best effort: failures show up in the
    /// returned report and are never retried.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Validation`] and leaves the roster untouched
    /// when `name`, `address`, or `port` is empty, or `port` is not a valid
    /// non-zero port number.
    pub async fn add_vehicle(
        &self,
        name: &str,
        address: &str,
        port: &str,
    ) -> Result<DeliveryReport, FleetError> {
        let vehicle = VehicleId::new(name)?;
        let endpoint = Endpoint::parse(address, port)?;
        let announce = Message::roster_announce(vehicle.clone(), &endpoint)?;

        let previous = self.inner.fleet.upsert(vehicle.clone(), endpoint.clone()).await;
        info!(vehicle = %vehicle, endpoint = %endpoint, replaced = previous.is_some(), "vehicle added to roster");

        let report = self.inner.broadcaster.broadcast(&announce, Targets::fleet()).await;
        log_report("roster announce", &report);
        Ok(report)
    }

    /// Subscribe this vehicle to `topic` and announce the subscription.
    ///
    /// The local entry is in place before this method returns; peers learn
    /// about it as the announce arrives.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Validation`] for an empty topic name.
    pub async fn subscribe_to_topic(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
    ) -> Result<DeliveryReport, FleetError> {
        self.inner.topics.subscribe_local(topic, handler).await?;
        info!(vehicle = %self.inner.identity, topic = %topic, "subscribed");

        let announce = Message::subscription_announce(self.inner.identity.clone(), topic);
        let report = self.inner.broadcaster.broadcast(&announce, Targets::fleet()).await;
        log_report("subscription announce", &report);
        Ok(report)
    }

    /// Send `payload` to every remote subscriber of `topic`.
    ///
    /// # Errors
    ///
    /// * [`FleetError::UnknownTopic`] – nobody is known to subscribe to
    ///   `topic`.
    /// * [`FleetError::Serialization`] – `payload` cannot be represented as
    ///   JSON.
    pub async fn publish_to_topic<T>(&self, topic: &str, payload: T) -> Result<DeliveryReport, FleetError>
    where
        T: Serialize,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| FleetError::Serialization(e.to_string()))?;
        let report = self
            .inner
            .broadcaster
            .publish(&self.inner.topics, topic, payload)
            .await?;
        log_report("publish", &report);
        Ok(report)
    }

    /// Re-announce this vehicle's roster entry and every local subscription.
    ///
    /// Announces are idempotent on the receiving side, so calling this
    /// periodically repairs peers that missed earlier announces without
    /// creating duplicates.
    pub async fn announce_self(&self) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        match self.inner.fleet.lookup(&self.inner.identity).await {
            Ok(endpoint) => match Message::roster_announce(self.inner.identity.clone(), &endpoint) {
                Ok(announce) => {
                    report.merge(self.inner.broadcaster.broadcast(&announce, Targets::fleet()).await)
                }
                Err(e) => warn!(error = %e, "could not build roster announce"),
            },
            Err(e) => warn!(error = %e, "own roster entry missing"),
        }

        for topic in self.inner.topics.local_topics().await {
            let announce = Message::subscription_announce(self.inner.identity.clone(), topic);
            report.merge(self.inner.broadcaster.broadcast(&announce, Targets::fleet()).await);
        }

        log_report("re-announce", &report);
        report
    }

    /// Apply a message that arrived through some other channel than the
    /// listener, exactly as if a peer had sent it.
    pub async fn handle_inbound(&self, message: Message) -> Result<DispatchOutcome, FleetError> {
        self.inner.dispatcher.dispatch(message).await
    }

    /// Stop the listener and release its socket.
    ///
    /// Outbound calls keep working afterwards, but no more peer traffic is
    /// received.  Returns the number of inbound connections served.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Listener`] if the agent was already shut down.
    pub async fn shutdown(&self) -> Result<usize, FleetError> {
        let handle = self
            .inner
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| FleetError::Listener("agent already shut down".into()))?;
        let served = handle.shutdown().await?;
        info!(vehicle = %self.inner.identity, served, "fleet agent stopped");
        Ok(served)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn identity(&self) -> &VehicleId {
        &self.inner.identity
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Snapshot of the roster.
    pub async fn roster(&self) -> HashMap<VehicleId, Endpoint> {
        self.inner.fleet.snapshot().await
    }

    pub async fn lookup(&self, name: &str) -> Result<Endpoint, FleetError> {
        self.inner.fleet.lookup(&VehicleId::new(name)?).await
    }

    /// Vehicles subscribed to `topic`, in registration order.
    pub async fn subscribers(&self, topic: &str) -> Result<Vec<VehicleId>, FleetError> {
        self.inner.topics.subscribers(topic).await
    }

    pub async fn topics(&self) -> Vec<String> {
        self.inner.topics.topics().await
    }
}

/// `0.0.0.0` / `::` bind every interface but are not a destination.
fn is_wildcard(address: &str) -> bool {
    address
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_unspecified())
}

fn log_report(what: &str, report: &DeliveryReport) {
    if report.is_complete() {
        info!(what, delivered = report.succeeded.len(), "fan-out complete");
    } else {
        let failed: Vec<String> = report.failed.iter().map(|f| f.vehicle.to_string()).collect();
        warn!(
            what,
            delivered = report.succeeded.len(),
            failed = ?failed,
            "fan-out partially failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use crate::transport::testing::RecordingTransport;
    use fleetlink_types::MessageKind;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn vid(name: &str) -> VehicleId {
        VehicleId::new(name).unwrap()
    }

    fn local_listen() -> Endpoint {
        Endpoint::new("127.0.0.1", 0)
    }

    fn noop() -> Arc<dyn TopicHandler> {
        Arc::new(FnHandler::new(|_| {}))
    }

    async fn recorded(config: AgentConfig) -> (FleetAgent, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let agent = FleetAgent::start_with_transport(config, transport.clone())
            .await
            .unwrap();
        (agent, transport)
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_rejects_empty_identity() {
        let result = FleetAgent::start(AgentConfig::new(" ", local_listen())).await;
        assert!(matches!(result, Err(FleetError::Validation(_))));
    }

    #[tokio::test]
    async fn start_adds_self_to_roster() {
        let (agent, _) = recorded(AgentConfig::new("L", local_listen())).await;
        let own = agent.lookup("L").await.unwrap();
        assert_eq!(own.port, agent.local_addr().port());
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_keeps_seeded_self_entry() {
        let config = AgentConfig::new("L", local_listen()).with_vehicle("L", Endpoint::new("vehicle-l.fleet", 4000));
        let (agent, _) = recorded(config).await;
        assert_eq!(agent.lookup("L").await.unwrap(), Endpoint::new("vehicle-l.fleet", 4000));
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wildcard_listen_address_needs_a_seeded_self_entry() {
        let result = FleetAgent::start(AgentConfig::new("L", Endpoint::new("0.0.0.0", 0))).await;
        assert!(matches!(result, Err(FleetError::Validation(msg)) if msg.contains("0.0.0.0")));

        let config = AgentConfig::new("L", Endpoint::new("0.0.0.0", 0))
            .with_vehicle("L", Endpoint::new("10.0.0.1", 9000));
        let (agent, _) = recorded(config).await;
        assert_eq!(agent.lookup("L").await.unwrap(), Endpoint::new("10.0.0.1", 9000));
        agent.shutdown().await.unwrap();
    }

    #[test]
    fn wildcard_detection() {
        assert!(is_wildcard("0.0.0.0"));
        assert!(is_wildcard("::"));
        assert!(!is_wildcard("127.0.0.1"));
        assert!(!is_wildcard("vehicle-l.fleet"));
    }

    #[tokio::test]
    async fn seeded_topics_are_known_without_announces() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("A", Endpoint::new("127.0.0.1", 9001))
            .with_subscriber("Ping", "A")
            .with_local_handler("Ping", noop());
        let (agent, transport) = recorded(config).await;

        assert_eq!(agent.subscribers("Ping").await.unwrap(), vec![vid("A"), vid("L")]);
        assert!(transport.sent().is_empty());
        agent.shutdown().await.unwrap();
    }

    // -----------------------------------------------------------------------
    // add_vehicle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn add_vehicle_with_empty_field_is_rejected_without_state_change() {
        let config = AgentConfig::new("L", local_listen()).with_vehicle("A", Endpoint::new("127.0.0.1", 9001));
        let (agent, transport) = recorded(config).await;
        let before = agent.roster().await;

        for (name, address, port) in [("", "10.0.0.2", "9000"), ("B", "", "9000"), ("B", "10.0.0.2", "")] {
            let result = agent.add_vehicle(name, address, port).await;
            assert!(matches!(result, Err(FleetError::Validation(_))), "{name:?} {address:?} {port:?}");
        }

        assert_eq!(agent.roster().await, before);
        assert!(transport.sent().is_empty());
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_vehicle_announces_to_each_other_known_vehicle_once() {
        let config = AgentConfig::new("L", local_listen()).with_vehicle("A", Endpoint::new("127.0.0.1", 9001));
        let (agent, transport) = recorded(config).await;

        let report = agent.add_vehicle("B", "10.0.0.2", "9000").await.unwrap();

        assert_eq!(agent.lookup("B").await.unwrap(), Endpoint::new("10.0.0.2", 9000));
        assert_eq!(report.succeeded, vec![vid("A")]);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (endpoint, message) = &sent[0];
        assert_eq!(*endpoint, Endpoint::new("127.0.0.1", 9001));
        assert_eq!(message.kind, MessageKind::RosterAnnounce);
        assert_eq!(message.sender, vid("B"));
        assert_eq!(message.announced_endpoint().unwrap(), Endpoint::new("10.0.0.2", 9000));
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_vehicle_reports_unreachable_peers() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("A", Endpoint::new("127.0.0.1", 9001))
            .with_vehicle("C", Endpoint::new("127.0.0.1", 9003));
        let (agent, transport) = recorded(config).await;
        transport.fail_endpoint(Endpoint::new("127.0.0.1", 9001));

        let report = agent.add_vehicle("B", "10.0.0.2", "9000").await.unwrap();

        assert_eq!(report.succeeded, vec![vid("C")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].vehicle, vid("A"));
        // The roster change stands even though one announce failed.
        assert!(agent.lookup("B").await.is_ok());
        agent.shutdown().await.unwrap();
    }

    // -----------------------------------------------------------------------
    // subscribe_to_topic / publish_to_topic
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn subscribe_records_locally_and_announces() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("A", Endpoint::new("127.0.0.1", 9001))
            .with_vehicle("B", Endpoint::new("127.0.0.1", 9002))
            .with_subscriber("Ping", "A");
        let (agent, transport) = recorded(config).await;

        let report = agent.subscribe_to_topic("Ping", noop()).await.unwrap();

        assert_eq!(agent.subscribers("Ping").await.unwrap(), vec![vid("A"), vid("L")]);
        assert_eq!(report.succeeded, vec![vid("A"), vid("B")]);
        for (_, message) in transport.sent() {
            assert_eq!(message.kind, MessageKind::TopicSubscriptionAnnounce);
            assert_eq!(message.sender, vid("L"));
            assert_eq!(message.topic.as_deref(), Some("Ping"));
        }
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_rejects_empty_topic() {
        let (agent, transport) = recorded(AgentConfig::new("L", local_listen())).await;
        assert!(matches!(
            agent.subscribe_to_topic("", noop()).await,
            Err(FleetError::Validation(_))
        ));
        assert!(agent.topics().await.is_empty());
        assert!(transport.sent().is_empty());
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn publish_to_self_only_topic_sends_nothing() {
        let config = AgentConfig::new("L", local_listen()).with_vehicle("A", Endpoint::new("127.0.0.1", 9001));
        let (agent, transport) = recorded(config).await;
        agent.subscribe_to_topic("Ping", noop()).await.unwrap();
        transport.clear();

        let report = agent.publish_to_topic("Ping", "x").await.unwrap();

        assert_eq!(report.attempted(), 0);
        assert!(transport.sent().is_empty());
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn publish_reaches_each_remote_subscriber() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("C", Endpoint::new("10.0.0.3", 9003))
            .with_vehicle("D", Endpoint::new("10.0.0.4", 9004))
            .with_subscriber("Ping", "C")
            .with_subscriber("Ping", "D");
        let (agent, transport) = recorded(config).await;

        let report = agent.publish_to_topic("Ping", "x").await.unwrap();
        assert_eq!(report.succeeded.len(), 2);

        let mut sent = transport.sent();
        sent.sort_by_key(|(endpoint, _)| endpoint.port);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Endpoint::new("10.0.0.3", 9003));
        assert_eq!(sent[1].0, Endpoint::new("10.0.0.4", 9004));
        for (_, message) in &sent {
            assert_eq!(message.kind, MessageKind::Data);
            assert_eq!(message.sender, vid("L"));
            assert_eq!(message.topic.as_deref(), Some("Ping"));
            assert_eq!(message.payload, serde_json::json!("x"));
        }
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn publish_to_subscriber_missing_from_roster_fails_only_that_target() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("C", Endpoint::new("10.0.0.3", 9003))
            .with_subscriber("Ping", "C")
            .with_subscriber("Ping", "ghost");
        let (agent, transport) = recorded(config).await;

        let report = agent.publish_to_topic("Ping", 42).await.unwrap();

        assert_eq!(report.succeeded, vec![vid("C")]);
        assert_eq!(report.failed[0].vehicle, vid("ghost"));
        assert_eq!(transport.sent().len(), 1);
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_an_error() {
        let (agent, _) = recorded(AgentConfig::new("L", local_listen())).await;
        assert!(matches!(
            agent.publish_to_topic("nope", "x").await,
            Err(FleetError::UnknownTopic(_))
        ));
        agent.shutdown().await.unwrap();
    }

    // -----------------------------------------------------------------------
    // announce_self / handle_inbound / shutdown
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn announce_self_repeats_roster_entry_and_local_subscriptions() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("A", Endpoint::new("127.0.0.1", 9001))
            .with_local_handler("Ping", noop())
            .with_local_handler("Status", noop());
        let (agent, transport) = recorded(config).await;

        let report = agent.announce_self().await;

        assert_eq!(report.succeeded.len(), 3);
        let kinds: Vec<MessageKind> = transport.sent().iter().map(|(_, m)| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::RosterAnnounce,
                MessageKind::TopicSubscriptionAnnounce,
                MessageKind::TopicSubscriptionAnnounce
            ]
        );
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handle_inbound_applies_peer_announces() {
        let (agent, _) = recorded(AgentConfig::new("L", local_listen())).await;

        agent
            .handle_inbound(Message::subscription_announce(vid("B"), "Ping"))
            .await
            .unwrap();
        agent
            .handle_inbound(Message::roster_announce(vid("B"), &Endpoint::new("10.0.0.2", 9000)).unwrap())
            .await
            .unwrap();

        assert_eq!(agent.subscribers("Ping").await.unwrap(), vec![vid("B")]);
        assert_eq!(agent.lookup("B").await.unwrap(), Endpoint::new("10.0.0.2", 9000));
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn second_shutdown_is_an_error() {
        let (agent, _) = recorded(AgentConfig::new("L", local_listen())).await;
        agent.shutdown().await.unwrap();
        assert!(matches!(agent.shutdown().await, Err(FleetError::Listener(_))));
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_add_and_publish_never_observe_partial_state() {
        let config = AgentConfig::new("L", local_listen())
            .with_vehicle("C", Endpoint::new("10.0.0.3", 9003))
            .with_subscriber("Ping", "C");
        let (agent, _) = recorded(config).await;

        let mut tasks = Vec::new();
        for i in 0..16u16 {
            let adder = agent.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("V{i}");
                adder
                    .add_vehicle(&name, &format!("10.1.0.{i}"), &(9100 + i).to_string())
                    .await
                    .map(|_| ())
            }));
            let announcer = agent.clone();
            tasks.push(tokio::spawn(async move {
                announcer
                    .handle_inbound(Message::subscription_announce(vid(&format!("V{i}")), "Ping"))
                    .await
                    .map(|_| ())
            }));
            let publisher = agent.clone();
            tasks.push(tokio::spawn(async move {
                publisher.publish_to_topic("Ping", i).await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let roster = agent.roster().await;
        assert_eq!(roster.len(), 18);
        for i in 0..16u16 {
            let endpoint = &roster[&vid(&format!("V{i}"))];
            assert_eq!(*endpoint, Endpoint::new(format!("10.1.0.{i}"), 9100 + i));
        }
        let subscribers = agent.subscribers("Ping").await.unwrap();
        assert_eq!(subscribers.len(), 17);
        agent.shutdown().await.unwrap();
    }

    // -----------------------------------------------------------------------
    // End to end over TCP
    // -----------------------------------------------------------------------

    async fn wait_for_subscriber(agent: &FleetAgent, topic: &str, vehicle: &str) {
        for _ in 0..100 {
            let subs = agent.subscribers(topic).await.unwrap_or_default();
            if subs.iter().any(|s| s == vehicle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{vehicle} never showed up as a subscriber of {topic}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_pong_between_two_live_agents() {
        let a_received = Arc::new(StdMutex::new(Vec::new()));
        let b_received = Arc::new(StdMutex::new(Vec::new()));

        let agent_a = FleetAgent::start(AgentConfig::new("A", local_listen())).await.unwrap();
        let a_port = agent_a.local_addr().port();
        let agent_b = FleetAgent::start(
            AgentConfig::new("B", local_listen()).with_vehicle("A", Endpoint::new("127.0.0.1", a_port)),
        )
        .await
        .unwrap();
        let b_port = agent_b.local_addr().port();
        agent_a
            .add_vehicle("B", "127.0.0.1", &b_port.to_string())
            .await
            .unwrap();

        // A answers every Ping with a Pong.
        struct Responder {
            agent: FleetAgent,
            seen: Arc<StdMutex<Vec<serde_json::Value>>>,
        }
        #[async_trait::async_trait]
        impl TopicHandler for Responder {
            async fn on_message(&self, message: &Message) {
                self.seen.lock().unwrap().push(message.payload.clone());
                self.agent.publish_to_topic("Ping", "Pong").await.unwrap();
            }
        }
        agent_a
            .subscribe_to_topic(
                "Ping",
                Arc::new(Responder {
                    agent: agent_a.clone(),
                    seen: Arc::clone(&a_received),
                }),
            )
            .await
            .unwrap();

        let seen_by_b = Arc::clone(&b_received);
        agent_b
            .subscribe_to_topic(
                "Ping",
                Arc::new(FnHandler::new(move |msg: &Message| {
                    seen_by_b.lock().unwrap().push(msg.payload.clone());
                })),
            )
            .await
            .unwrap();

        wait_for_subscriber(&agent_b, "Ping", "A").await;
        wait_for_subscriber(&agent_a, "Ping", "B").await;

        // A repeated announce from A must not add a second entry on B.
        assert_eq!(
            agent_b
                .handle_inbound(Message::subscription_announce(vid("A"), "Ping"))
                .await
                .unwrap(),
            DispatchOutcome::DuplicateSubscriber
        );
        let on_b = agent_b.subscribers("Ping").await.unwrap();
        assert_eq!(on_b.iter().filter(|v| **v == "A").count(), 1);
        assert_eq!(on_b.len(), 2);
        // B's own entry is the only one carrying a handler.
        assert_eq!(agent_b.inner.topics.local_handlers("Ping").await.unwrap().len(), 1);

        let report = agent_b.publish_to_topic("Ping", "Ping").await.unwrap();
        assert_eq!(report.succeeded, vec![vid("A")]);

        for _ in 0..100 {
            if !b_received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give any stray duplicate a chance to show up.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*a_received.lock().unwrap(), vec![serde_json::json!("Ping")]);
        assert_eq!(*b_received.lock().unwrap(), vec![serde_json::json!("Pong")]);

        agent_a.shutdown().await.unwrap();
        agent_b.shutdown().await.unwrap();
    }
}
