//! The payload that evaluation currently reads from.
//!
//! Each [`Client`](crate::Client) owns a [`PayloadStore`]. The synchronizer publishes fetched and
//! streamed payloads into it, while evaluation takes a snapshot per call.
use std::sync::{Arc, RwLock};

use crate::{payload::FeaturePayload, sync::PayloadSubscriber};

/// Holds the active [`FeaturePayload`] behind an `Arc`.
///
/// Payloads are swapped whole. An evaluation that took a snapshot keeps using it even if a newer
/// payload arrives halfway through.
#[derive(Debug, Default)]
pub struct PayloadStore {
    payload: RwLock<Option<Arc<FeaturePayload>>>,
}

impl PayloadStore {
    pub fn new() -> Self {
        PayloadStore::default()
    }

    /// Snapshot of the active payload, `None` until the first one is published.
    pub fn get_payload(&self) -> Option<Arc<FeaturePayload>> {
        self.payload
            .read()
            .expect("thread holding payload lock should not panic")
            .clone()
    }

    /// Publish `payload`, handing back the one it replaces.
    pub fn set_payload(&self, payload: Arc<FeaturePayload>) -> Option<Arc<FeaturePayload>> {
        self.payload
            .write()
            .expect("thread holding payload lock should not panic")
            .replace(payload)
    }
}

impl PayloadSubscriber for PayloadStore {
    fn on_payload(&self, payload: Arc<FeaturePayload>) {
        self.set_payload(payload);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::PayloadStore;
    use crate::payload::FeaturePayload;

    #[test]
    fn payload_published_from_another_thread_is_visible() {
        let store = Arc::new(PayloadStore::new());

        assert!(store.get_payload().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_payload(Arc::new(FeaturePayload::default()));
            })
            .join();
        }

        assert!(store.get_payload().is_some());
    }

    #[test]
    fn snapshot_survives_replacement() {
        let store = PayloadStore::new();
        let first = Arc::new(FeaturePayload {
            date_updated: Some("1".to_owned()),
            ..Default::default()
        });

        assert!(store.set_payload(first.clone()).is_none());
        let snapshot = store.get_payload().unwrap();
        let previous = store.set_payload(Arc::new(FeaturePayload::default()));

        assert!(Arc::ptr_eq(&previous.unwrap(), &first));
        assert_eq!(snapshot.date_updated.as_deref(), Some("1"));
        assert!(store.get_payload().unwrap().date_updated.is_none());
    }
}
