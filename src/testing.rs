//! In-memory stand-ins for the broker session and the measurement store.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::db::MeasurementStore;
use crate::error::{ConnectionError, PublishError, StorageError};
use crate::models::{MeasurementRecord, StoredMeasurement};
use crate::session::{Ack, BrokerLink, ConnectionState};

/// Records every publish instead of talking to a broker.
pub struct FakeBroker {
    state: Mutex<ConnectionState>,
    reconnect_succeeds: bool,
    rejection: Mutex<Option<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    publish_calls: AtomicUsize,
    reconnect_calls: AtomicUsize,
}

impl FakeBroker {
    fn with_state(state: ConnectionState, reconnect_succeeds: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            reconnect_succeeds,
            rejection: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            publish_calls: AtomicUsize::new(0),
            reconnect_calls: AtomicUsize::new(0),
        })
    }

    pub fn connected() -> Arc<Self> {
        Self::with_state(ConnectionState::Connected, true)
    }

    /// A dropped session whose next reconnect attempt succeeds or not.
    pub fn disconnected(reconnect_succeeds: bool) -> Arc<Self> {
        Self::with_state(ConnectionState::Disconnected, reconnect_succeeds)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn reject_publishes(&self, reason: &str) {
        *self.rejection.lock().unwrap() = Some(reason.to_string());
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerLink for FakeBroker {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.reconnect_succeeds {
            self.set_state(ConnectionState::Connected);
            Ok(())
        } else {
            Err(ConnectionError::Timeout)
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let state = BrokerLink::state(self);
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected { state, cause: None });
        }
        if let Some(reason) = self.rejection.lock().unwrap().clone() {
            return Err(PublishError::BrokerRejected(reason));
        }

        let payload_len = payload.len();
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(Ack {
            topic: topic.to_string(),
            payload_len,
            state,
        })
    }
}

/// Keeps stored records in memory and can be told to fail.
#[derive(Default)]
pub struct FakeStore {
    stored: Mutex<Vec<MeasurementRecord>>,
    failures: Mutex<VecDeque<StorageError>>,
    store_calls: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `store` call fails with `err`.
    pub fn fail_next(&self, err: StorageError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn stored(&self) -> Vec<MeasurementRecord> {
        self.stored.lock().unwrap().clone()
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }
}

impl MeasurementStore for FakeStore {
    fn store(&self, record: &MeasurementRecord) -> Result<i64, StorageError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut stored = self.stored.lock().unwrap();
        stored.push(record.clone());
        Ok(stored.len() as i64)
    }

    fn latest(&self, limit: usize) -> Result<Vec<StoredMeasurement>, StorageError> {
        let stored = self.stored.lock().unwrap();
        Ok(stored
            .iter()
            .enumerate()
            .rev()
            .take(limit)
            .map(|(index, record)| StoredMeasurement {
                id: index as i64 + 1,
                record: record.clone(),
            })
            .collect())
    }
}
