use domotic_bridge::config::Config;
use domotic_bridge::db::{DatabaseService, MeasurementStore};
use domotic_bridge::rest_server::ApiState;
use domotic_bridge::service_utils::{
    init_logging, log_state_changes, start_consumer, start_rest_server, wait_for_shutdown,
};
use domotic_bridge::{BrokerSession, CommandPublisher, TelemetryConsumer, TelemetryDecoder};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = Config::from_env();
    init_logging(config.as_ref().map(|cfg| cfg.log_level).unwrap_or(Level::INFO));
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Loaded configuration: {:?}", config);

    let db_service = match DatabaseService::new(&config.database) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to create database service: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {}", e);
        return ExitCode::FAILURE;
    }
    let store: Arc<dyn MeasurementStore> = Arc::new(db_service);

    let session = match BrokerSession::connect(config.broker.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!("Could not connect to the MQTT broker: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log_state_changes(&session);

    let consumer = Arc::new(TelemetryConsumer::new(
        TelemetryDecoder::new(config.sensor_fields.clone()),
        store.clone(),
    ));
    let publisher = CommandPublisher::new(
        session.clone(),
        config.broker.command_topic.clone(),
        config.brightness_max,
    );

    let mut consumer_task = start_consumer(
        consumer.clone(),
        session.clone(),
        config.broker.telemetry_topic.clone(),
    );
    let mut rest_task = start_rest_server(
        ApiState {
            publisher,
            store,
            consumer: Some(consumer),
        },
        config.api.clone(),
    );

    let code = tokio::select! {
        _ = wait_for_shutdown() => ExitCode::SUCCESS,
        result = &mut consumer_task => match result {
            Ok(Ok(())) => ExitCode::SUCCESS,
            Ok(Err(e)) => {
                error!("Telemetry consumer stopped: {}", e);
                ExitCode::FAILURE
            }
            Err(e) => {
                error!("Telemetry consumer task failed: {}", e);
                ExitCode::FAILURE
            }
        },
        result = &mut rest_task => match result {
            Ok(Ok(())) => {
                info!("REST API stopped.");
                ExitCode::SUCCESS
            }
            Ok(Err(e)) => {
                error!("REST API failed: {}", e);
                ExitCode::FAILURE
            }
            Err(e) => {
                error!("REST API task failed: {}", e);
                ExitCode::FAILURE
            }
        },
    };

    session.shutdown().await;
    consumer_task.abort();
    rest_task.abort();

    info!("All services shut down.");
    code
}
