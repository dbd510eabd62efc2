use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, routes, Build, Rocket, State};
use serde::Serialize;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::{error, warn};

use crate::command::CommandPublisher;
use crate::config::ApiConfig;
use crate::db::MeasurementStore;
use crate::error::CommandError;
use crate::session::ConnectionState;
use crate::telemetry::TelemetryConsumer;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

/// Shared handles the routes work with.
pub struct ApiState {
    pub publisher: CommandPublisher,
    pub store: Arc<dyn MeasurementStore>,
    pub consumer: Option<Arc<TelemetryConsumer>>,
}

/// Response to an accepted color command
#[derive(Serialize)]
struct CommandResponse {
    message: String,
    values: [u8; 4],
    broker: String,
    degraded: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    broker: String,
    stored: u64,
    rejected: u64,
    storage_failures: u64,
}

#[derive(Serialize)]
struct MeasurementResponse {
    id: i64,
    temperature: f64,
    humidity: f64,
    sensor_id: String,
    received_at: String,
}

type ApiError = (Status, Json<ErrorResponse>);

fn api_error(status: Status, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            status: "error".to_string(),
            message: message.into(),
        }),
    )
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Methods", "GET"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

/// Forward a color command to the LED controller
#[get("/setColor?<r>&<g>&<b>&<brightness>")]
async fn set_color(
    r: i64,
    g: i64,
    b: i64,
    brightness: i64,
    api: &State<ApiState>,
) -> Result<Json<CommandResponse>, ApiError> {
    match api.publisher.send_color_command(r, g, b, brightness).await {
        Ok(receipt) => Ok(Json(CommandResponse {
            message: "Color sent".to_string(),
            values: receipt.command.values(),
            broker: receipt.link.to_string(),
            degraded: receipt.degraded(),
        })),
        Err(CommandError::Validation(e)) => {
            warn!("Rejected color command: {}", e);
            Err(api_error(Status::UnprocessableEntity, e.to_string()))
        }
        Err(CommandError::Publish(e)) => {
            error!("Color command could not be published: {}", e);
            Err(api_error(Status::ServiceUnavailable, e.to_string()))
        }
    }
}

/// Broker link state and consumer counters
#[get("/health")]
fn health(api: &State<ApiState>) -> Json<HealthResponse> {
    let broker = api.publisher.link_state();
    let (stored, rejected, storage_failures) = api
        .consumer
        .as_ref()
        .map(|consumer| {
            let stats = consumer.stats();
            (stats.stored(), stats.rejected(), stats.storage_failures())
        })
        .unwrap_or_default();

    Json(HealthResponse {
        status: if broker == ConnectionState::Connected {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        broker: broker.to_string(),
        stored,
        rejected,
        storage_failures,
    })
}

/// Get the newest persisted measurements
#[get("/measurements/latest?<limit>")]
async fn latest_measurements(
    limit: Option<usize>,
    api: &State<ApiState>,
) -> Result<Json<Vec<MeasurementResponse>>, ApiError> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let store = api.store.clone();

    let rows = rocket::tokio::task::spawn_blocking(move || store.latest(limit))
        .await
        .map_err(|e| api_error(Status::InternalServerError, e.to_string()))?
        .map_err(|e| {
            error!("Failed to read measurements: {}", e);
            api_error(Status::InternalServerError, e.to_string())
        })?;

    let mut measurements = Vec::with_capacity(rows.len());
    for row in rows {
        let received_at = row
            .record
            .received_at
            .format(&Rfc3339)
            .map_err(|e| api_error(Status::InternalServerError, e.to_string()))?;
        measurements.push(MeasurementResponse {
            id: row.id,
            temperature: row.record.temperature,
            humidity: row.record.humidity,
            sensor_id: row.record.sensor_id,
            received_at,
        });
    }

    Ok(Json(measurements))
}

/// Assembles the Rocket instance without launching it.
pub fn build_rest_server(state: ApiState, config: &ApiConfig) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", config.address.clone()))
        .merge(("port", config.port));

    rocket::custom(figment)
        .manage(state)
        .mount("/", routes![set_color, health, latest_measurements])
        .attach(Cors)
}

/// Run the Rocket server until it is shut down
pub async fn run_rest_server(state: ApiState, config: ApiConfig) -> Result<(), rocket::Error> {
    build_rest_server(state, &config).launch().await?;
    Ok(())
}
