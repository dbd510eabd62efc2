use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CommandError, PublishError, ValidationError};
use crate::session::{BrokerLink, ConnectionState};

pub const CHANNEL_MAX: u8 = 255;
pub const DEFAULT_BRIGHTNESS_MAX: u8 = 100;

/// An RGB light command.
///
/// Renders as `red,green,blue,brightness`, the payload the LED firmware parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub brightness: u8,
}

impl Command {
    /// Validates raw request values. Out-of-range values are rejected, never clamped.
    pub fn new(
        red: i64,
        green: i64,
        blue: i64,
        brightness: i64,
        brightness_max: u8,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            red: bounded("red", red, CHANNEL_MAX)?,
            green: bounded("green", green, CHANNEL_MAX)?,
            blue: bounded("blue", blue, CHANNEL_MAX)?,
            brightness: bounded("brightness", brightness, brightness_max)?,
        })
    }

    pub fn values(&self) -> [u8; 4] {
        [self.red, self.green, self.blue, self.brightness]
    }

    pub fn to_payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.red, self.green, self.blue, self.brightness
        )
    }
}

fn bounded(field: &'static str, value: i64, max: u8) -> Result<u8, ValidationError> {
    if (0..=i64::from(max)).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min: 0,
            max: i64::from(max),
        })
    }
}

/// What was sent, and how healthy the link looked while sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub command: Command,
    pub payload: String,
    pub link: ConnectionState,
    /// The session had to be re-established before the publish went through.
    pub reconnected: bool,
}

impl CommandReceipt {
    pub fn degraded(&self) -> bool {
        self.reconnected || self.link != ConnectionState::Connected
    }
}

/// Publishes light commands on the command topic through the shared session.
#[derive(Clone)]
pub struct CommandPublisher {
    link: Arc<dyn BrokerLink>,
    topic: String,
    brightness_max: u8,
}

impl CommandPublisher {
    pub fn new(link: Arc<dyn BrokerLink>, topic: impl Into<String>, brightness_max: u8) -> Self {
        Self {
            link,
            topic: topic.into(),
            brightness_max,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn link_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub async fn send_color_command(
        &self,
        red: i64,
        green: i64,
        blue: i64,
        brightness: i64,
    ) -> Result<CommandReceipt, CommandError> {
        let command = Command::new(red, green, blue, brightness, self.brightness_max)?;
        self.send(command).await
    }

    pub async fn send(&self, command: Command) -> Result<CommandReceipt, CommandError> {
        let mut reconnected = false;

        let state = self.link.state();
        if state != ConnectionState::Connected {
            warn!("Broker link is {} before sending a command, reconnecting once.", state);
            if let Err(cause) = self.link.ensure_connected().await {
                return Err(PublishError::NotConnected {
                    state: self.link.state(),
                    cause: Some(cause),
                }
                .into());
            }
            reconnected = true;
        }

        let payload = command.to_payload();
        let ack = self
            .link
            .publish(&self.topic, payload.clone().into_bytes())
            .await?;

        info!("Color command '{}' sent to '{}'.", payload, ack.topic);
        Ok(CommandReceipt {
            command,
            payload,
            link: ack.state,
            reconnected,
        })
    }
}
