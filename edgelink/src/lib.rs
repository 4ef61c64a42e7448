//! On-device agent connecting edge and embedded devices to a cloud IoT
//! platform over MQTT.
//!
//! The agent publishes telemetry, attributes and location samples, executes
//! cloud-initiated actions against registered handlers, moves files in both
//! directions with integrity verification and orchestrates over-the-air
//! software updates. It is built for field devices on intermittent links: the
//! session reconnects on its own, pending transfers survive restarts and the
//! mailbox is polled again after every reconnect.

pub mod actions;
pub mod agent;
pub mod ota;
pub mod protocol;
pub mod status;
pub mod telemetry;
pub mod transfer;
pub mod transport;
pub mod value;

pub(crate) mod utils;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentHandle};
pub use status::{AgentError, ErrorKind, Result};
pub use value::{DataType, Location, LocationSource, TypedValue};
