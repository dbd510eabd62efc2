use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::db::MeasurementStore;
use crate::error::{ConnectionError, ConsumeError, DecodeError, StorageError, ValidationError};
use crate::models::{MeasurementRecord, TelemetryMessage};
use crate::session::{BrokerSession, MessageHandler};

/// Field name the sensor identifier is stored under.
pub const CANONICAL_SENSOR_FIELD: &str = "sensor_id";

/// Payload field names accepted for the sensor identifier, in priority order.
/// `light` is the field older firmware revisions send in its place.
pub const DEFAULT_SENSOR_FIELDS: [&str; 3] = ["sensor_id", "idSensor", "light"];

/// Parses a raw payload into a JSON object.
pub fn decode_payload(raw: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(DecodeError::NotAnObject),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

/// Turns decoded telemetry objects into measurement records.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    sensor_fields: Vec<String>,
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_SENSOR_FIELDS.iter().map(|field| field.to_string()).collect())
    }
}

impl TelemetryDecoder {
    pub fn new(sensor_fields: Vec<String>) -> Self {
        Self { sensor_fields }
    }

    pub fn sensor_fields(&self) -> &[String] {
        &self.sensor_fields
    }

    pub fn validate(
        &self,
        object: &Map<String, Value>,
        received_at: OffsetDateTime,
    ) -> Result<MeasurementRecord, ValidationError> {
        Ok(MeasurementRecord {
            temperature: number(object, "temperature")?,
            humidity: number(object, "humidity")?,
            sensor_id: self.sensor_id(object)?,
            received_at,
        })
    }

    /// Decodes and validates in one step.
    pub fn decode(
        &self,
        raw: &[u8],
        received_at: OffsetDateTime,
    ) -> Result<MeasurementRecord, ConsumeError> {
        let object = decode_payload(raw)?;
        Ok(self.validate(&object, received_at)?)
    }

    fn sensor_id(&self, object: &Map<String, Value>) -> Result<String, ValidationError> {
        for field in &self.sensor_fields {
            match object.get(field) {
                None | Some(Value::Null) => continue,
                Some(Value::String(id)) if !id.trim().is_empty() => return Ok(id.clone()),
                Some(Value::Number(id)) => return Ok(id.to_string()),
                Some(_) => {
                    return Err(ValidationError::InvalidType {
                        field: field.clone(),
                        expected: "a non-empty string or a number",
                    })
                }
            }
        }
        Err(ValidationError::MissingField(CANONICAL_SENSOR_FIELD.to_string()))
    }
}

fn number(object: &Map<String, Value>, field: &str) -> Result<f64, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ValidationError::InvalidType {
                field: field.to_string(),
                expected: "a finite number",
            }),
        Some(_) => Err(ValidationError::InvalidType {
            field: field.to_string(),
            expected: "a number",
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribed,
    Receiving,
    Decoding,
    Validating,
    Persisting,
    Faulted,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    stored: AtomicU64,
    rejected: AtomicU64,
    storage_failures: AtomicU64,
}

impl ConsumerStats {
    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// Messages dropped for decode or validation errors.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn storage_failures(&self) -> u64 {
        self.storage_failures.load(Ordering::Relaxed)
    }
}

/// Consumes telemetry deliveries and persists them, one message at a time.
///
/// A bad payload or a failed write is logged and counted; it never ends the
/// subscription. Each message is handled at most once.
pub struct TelemetryConsumer {
    decoder: TelemetryDecoder,
    store: Arc<dyn MeasurementStore>,
    state: Mutex<ConsumerState>,
    stats: ConsumerStats,
}

impl TelemetryConsumer {
    pub fn new(decoder: TelemetryDecoder, store: Arc<dyn MeasurementStore>) -> Self {
        Self {
            decoder,
            store,
            state: Mutex::new(ConsumerState::Idle),
            stats: ConsumerStats::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Subscribes to `topic` and processes deliveries until the session ends.
    /// Only an unrecoverable session loss is returned as an error.
    pub async fn run(&self, session: &BrokerSession, topic: &str) -> Result<(), ConnectionError> {
        self.set_state(ConsumerState::Subscribed);
        info!("Consuming telemetry from '{}'.", topic);

        let result = session.subscribe(topic, self).await;
        match &result {
            Ok(()) => self.set_state(ConsumerState::Idle),
            Err(e) => {
                error!("Telemetry consumer faulted: {}", e);
                self.set_state(ConsumerState::Faulted);
            }
        }
        result
    }

    /// Runs one message through decode, validation and persistence.
    pub async fn process(
        &self,
        message: TelemetryMessage,
    ) -> Result<MeasurementRecord, ConsumeError> {
        self.set_state(ConsumerState::Receiving);
        let received_at = OffsetDateTime::now_utc();

        self.set_state(ConsumerState::Decoding);
        let object = decode_payload(&message.raw_payload)?;

        self.set_state(ConsumerState::Validating);
        let record = self.decoder.validate(&object, received_at)?;

        self.set_state(ConsumerState::Persisting);
        let store = self.store.clone();
        let pending = record.clone();
        let id = tokio::task::spawn_blocking(move || store.store(&pending))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))??;

        debug!(
            "Persisted measurement {} from sensor '{}' (topic '{}').",
            id, record.sensor_id, message.topic
        );
        Ok(record)
    }
}

#[async_trait]
impl MessageHandler for TelemetryConsumer {
    async fn on_message(&self, message: TelemetryMessage) {
        let topic = message.topic.clone();

        match self.process(message).await {
            Ok(_) => {
                self.stats.stored.fetch_add(1, Ordering::Relaxed);
            }
            Err(ConsumeError::Storage(e)) => {
                self.stats.storage_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to store telemetry from '{}': {}", topic, e);
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping telemetry from '{}': {}", topic, e);
            }
        }

        self.set_state(ConsumerState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;

    const TOPIC: &str = "esp32/sensors";

    fn consumer(store: &Arc<FakeStore>) -> TelemetryConsumer {
        TelemetryConsumer::new(TelemetryDecoder::default(), store.clone())
    }

    fn message(payload: &str) -> TelemetryMessage {
        TelemetryMessage::new(TOPIC, payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn persists_a_well_formed_payload() {
        let store = FakeStore::new();
        let consumer = consumer(&store);

        consumer
            .on_message(message(
                r#"{"temperature": 21.5, "humidity": 40.2, "sensor_id": "s1"}"#,
            ))
            .await;

        let stored = store.stored();
        assert_eq!(store.store_calls(), 1);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].temperature, 21.5);
        assert_eq!(stored[0].humidity, 40.2);
        assert_eq!(stored[0].sensor_id, "s1");
        assert_eq!(consumer.stats().stored(), 1);
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }

    #[tokio::test]
    async fn a_bad_message_does_not_stop_the_next_one() {
        let store = FakeStore::new();
        let consumer = consumer(&store);

        consumer.on_message(message(r#"{"temperature": 21.5"#)).await;
        consumer
            .on_message(message(
                r#"{"temperature": 19.0, "humidity": 55, "sensor_id": "s2"}"#,
            ))
            .await;

        assert_eq!(store.store_calls(), 1);
        assert_eq!(store.stored()[0].sensor_id, "s2");
        assert_eq!(consumer.stats().rejected(), 1);
        assert_eq!(consumer.stats().stored(), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_never_reach_the_store() {
        let store = FakeStore::new();
        let consumer = consumer(&store);

        let cases: [&[u8]; 6] = [
            b"not json",
            b"[1, 2, 3]",
            &[0xff, 0xfe, 0x00],
            br#"{"humidity": 40.2, "sensor_id": "s1"}"#,
            br#"{"temperature": "warm", "humidity": 40.2, "sensor_id": "s1"}"#,
            br#"{"temperature": 21.5, "humidity": 40.2}"#,
        ];
        for raw in cases {
            consumer
                .on_message(TelemetryMessage::new(TOPIC, raw.to_vec()))
                .await;
        }

        assert_eq!(store.store_calls(), 0);
        assert_eq!(consumer.stats().rejected(), 6);
    }

    #[tokio::test]
    async fn process_reports_the_failing_stage() {
        let store = FakeStore::new();
        let consumer = consumer(&store);

        assert!(matches!(
            consumer.process(message("{oops")).await.unwrap_err(),
            ConsumeError::Decode(DecodeError::Malformed(_))
        ));
        assert_eq!(
            consumer.process(message("42")).await.unwrap_err(),
            ConsumeError::Decode(DecodeError::NotAnObject)
        );
        assert_eq!(
            consumer
                .process(message(r#"{"temperature": 1, "sensor_id": "s1"}"#))
                .await
                .unwrap_err(),
            ConsumeError::Validation(ValidationError::MissingField("humidity".to_string()))
        );
    }

    #[tokio::test]
    async fn storage_failure_is_contained() {
        let store = FakeStore::new();
        store.fail_next(StorageError::ConnectionRefused("db is down".to_string()));
        let consumer = consumer(&store);

        let payload = r#"{"temperature": 20.0, "humidity": 30.0, "sensor_id": "s1"}"#;
        consumer.on_message(message(payload)).await;
        consumer.on_message(message(payload)).await;

        assert_eq!(store.store_calls(), 2);
        assert_eq!(store.stored().len(), 1);
        assert_eq!(consumer.stats().storage_failures(), 1);
        assert_eq!(consumer.stats().stored(), 1);
        assert_eq!(consumer.state(), ConsumerState::Idle);
    }

    #[test]
    fn legacy_sensor_fields_are_normalized() {
        let decoder = TelemetryDecoder::default();
        let at = OffsetDateTime::UNIX_EPOCH;

        let legacy = decoder
            .decode(br#"{"temperature": 20, "humidity": 30, "light": 512}"#, at)
            .unwrap();
        assert_eq!(legacy.sensor_id, "512");

        let renamed = decoder
            .decode(br#"{"temperature": 20, "humidity": 30, "idSensor": "k1"}"#, at)
            .unwrap();
        assert_eq!(renamed.sensor_id, "k1");

        let both = decoder
            .decode(
                br#"{"temperature": 20, "humidity": 30, "light": 5, "sensor_id": "s9"}"#,
                at,
            )
            .unwrap();
        assert_eq!(both.sensor_id, "s9");
    }

    #[test]
    fn alias_table_is_configurable() {
        let decoder = TelemetryDecoder::new(vec!["device".to_string()]);
        let at = OffsetDateTime::UNIX_EPOCH;

        let record = decoder
            .decode(br#"{"temperature": 20, "humidity": 30, "device": "d1"}"#, at)
            .unwrap();
        assert_eq!(record.sensor_id, "d1");
        assert!(decoder
            .decode(br#"{"temperature": 20, "humidity": 30, "sensor_id": "s1"}"#, at)
            .is_err());
    }

    #[test]
    fn extra_fields_are_ignored_and_bad_ids_rejected() {
        let decoder = TelemetryDecoder::default();
        let at = OffsetDateTime::UNIX_EPOCH;

        let record = decoder
            .decode(
                br#"{"temperature": -3.5, "humidity": 80, "sensor_id": "s1", "rssi": -70}"#,
                at,
            )
            .unwrap();
        assert_eq!(record.temperature, -3.5);
        assert_eq!(record.received_at, at);

        assert_eq!(
            decoder
                .decode(br#"{"temperature": 1, "humidity": 2, "sensor_id": ""}"#, at)
                .unwrap_err(),
            ConsumeError::Validation(ValidationError::InvalidType {
                field: "sensor_id".to_string(),
                expected: "a non-empty string or a number",
            })
        );
    }
}
