use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};

use crate::config::ApiConfig;
use crate::error::ConnectionError;
use crate::rest_server::{run_rest_server, ApiState};
use crate::session::{BrokerSession, ConnectionState};
use crate::telemetry::TelemetryConsumer;

/// Install the global fmt subscriber.
pub fn init_logging(level: Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Start the telemetry consumer on its own task
pub fn start_consumer(
    consumer: Arc<TelemetryConsumer>,
    session: Arc<BrokerSession>,
    topic: String,
) -> JoinHandle<Result<(), ConnectionError>> {
    tokio::spawn(async move { consumer.run(&session, &topic).await })
}

/// Start the REST API on its own task
pub fn start_rest_server(
    state: ApiState,
    config: ApiConfig,
) -> JoinHandle<Result<(), rocket::Error>> {
    info!("Starting REST API on {}:{}...", config.address, config.port);
    tokio::spawn(run_rest_server(state, config))
}

/// Log every broker connection state change
pub fn log_state_changes(session: &BrokerSession) {
    let mut states = session.watch_state();
    let client_id = session.client_id().to_string();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Connected => info!("Broker session '{}' is {}.", client_id, state),
                ConnectionState::Failed => error!("Broker session '{}' has {}.", client_id, state),
                _ => warn!("Broker session '{}' is {}.", client_id, state),
            }
        }
    });
}

/// Wait for a termination signal
pub async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Bridge is shutting down..."),
        Err(e) => error!("Failed to handle termination signal: {:?}", e),
    }
}
