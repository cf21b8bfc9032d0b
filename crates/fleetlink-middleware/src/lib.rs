//! `fleetlink-middleware` – Peer-to-Peer Fleet Messaging
//!
//! Lets a group of vehicle agents exchange topic-addressed messages with no
//! central broker.  Every vehicle keeps its own roster and subscription table
//! and learns about peers from announces they send.
//!
//! # Modules
//!
//! - [`agent`] – [`FleetAgent`], the public API: add vehicles, subscribe,
//!   publish, re-announce, shut down.
//! - [`registry`] – Concurrent roster ([`FleetRegistry`]) and subscription
//!   table ([`TopicRegistry`]).
//! - [`dispatcher`] – Applies inbound messages to local state.
//! - [`broadcaster`] – Concurrent fan-out with per-target failure isolation.
//! - [`listener`] – TCP accept loop, one frame per connection.
//! - [`transport`] – Outbound delivery seam and its TCP implementation.
//! - [`wire`] – Length-prefixed JSON framing.
//! - [`handler`] – The [`TopicHandler`] callback trait.

pub mod agent;
pub mod broadcaster;
pub mod dispatcher;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod transport;
pub mod wire;

pub use agent::{AgentConfig, FleetAgent};
pub use broadcaster::{Broadcaster, Targets};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use handler::{FnHandler, TopicHandler};
pub use listener::{Listener, ListenerHandle};
pub use registry::{FleetRegistry, Subscriber, TopicRegistry};
pub use transport::{TcpTransport, Timeouts, Transport};
