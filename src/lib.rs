pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod rest_server;
pub mod service_utils;
pub mod session;
pub mod telemetry;

#[cfg(any(test, feature = "mock"))]
pub mod testing;

pub use command::{Command, CommandPublisher, CommandReceipt};
pub use config::{Config, ConfigError};
pub use db::{DatabaseService, MeasurementStore};
pub use error::{
    CommandError, ConnectionError, ConsumeError, DecodeError, PublishError, StorageError,
    ValidationError,
};
pub use models::{MeasurementRecord, StoredMeasurement, TelemetryMessage};
pub use session::{Ack, BrokerLink, BrokerSession, ConnectionState, MessageHandler};
pub use telemetry::{TelemetryConsumer, TelemetryDecoder};
