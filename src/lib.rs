//! Read telemetry from Daly Battery Management Systems over Bluetooth Low Energy
//!
//! The BMS speaks a request-response protocol of fixed 13 byte frames over a GATT
//! service with one write and one notify characteristic. Responses arrive as
//! notifications, sometimes several frames per notification, and are matched to
//! requests only by their command byte.
//!
//! Currently the following data can be read:
//!
//! - Pack voltage (V), current (A) and state of charge (%)
//! - Highest and lowest temperature (°C) and their sensors
//! - Charge/discharge mode, mosfet states and residual capacity (Ah)
//! - Cell and sensor counts, charger/load state and cycle count
//!
//! # Example
//!
//! ```no_run
//! # use dalyread::{BleConfig, BleConnector, BmsClient, ClientConfig, TelemetryKind};
//! #
//! # #[tokio::main]
//! # pub async fn main() -> Result<(), dalyread::BmsError> {
//!     let connector = BleConnector::discover(BleConfig::default()).await?;
//!     let mut client = BmsClient::new(connector, ClientConfig::default());
//!     client.subscribe(TelemetryKind::Soc, |event| println!("{:?}", event.telemetry));
//!
//!     let (_stop, shutdown) = tokio::sync::oneshot::channel();
//!     client.run(shutdown).await
//! # }
//! ```

mod ble;
mod client;
mod command;
mod config;
mod connection;
mod error;
mod event_bus;
pub mod frame;
mod polling;
mod session;
mod telemetry;
mod transport;

pub use ble::{BleConnector, BleWriter};
pub use client::BmsClient;
pub use command::{Command, TelemetryKind};
pub use config::{BleConfig, ClientConfig, ReconnectPolicy};
pub use connection::{ConnectionMachine, ConnectionManager, LinkEvent, Next, SessionState};
pub use error::{BmsError, Result};
pub use frame::{encode_command, Frame};
pub use event_bus::{ErrorHandler, EventBus, SubscriptionId, TelemetryHandler};
pub use polling::PollingScheduler;
pub use session::{decode_notification, query, Dispatch, ProtocolSession};
pub use telemetry::{
    decode, MosfetMode, MosfetStatus, PackStatus, SocSample, Telemetry, TelemetryEvent,
    TemperatureSample,
};
pub use transport::{Connector, Link, NotificationStream, WriteEndpoint};
