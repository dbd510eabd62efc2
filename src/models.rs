use time::OffsetDateTime;

/// A message as delivered by the broker, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub topic: String,
    pub raw_payload: Vec<u8>,
}

impl TelemetryMessage {
    pub fn new(topic: impl Into<String>, raw_payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            raw_payload: raw_payload.into(),
        }
    }
}

/// A decoded and validated measurement ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub temperature: f64,
    pub humidity: f64,
    pub sensor_id: String,
    pub received_at: OffsetDateTime,
}

/// A persisted measurement as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMeasurement {
    pub id: i64,
    pub record: MeasurementRecord,
}
