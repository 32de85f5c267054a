//! Media-plane seam.
//!
//! The gateway signs participants on and off the SFU but never touches
//! media itself. All SFU interaction goes through [`MediaPlane`], and the
//! room actors never call it directly: media operations run in the
//! per-connection task between a `begin_*` and `commit_*` exchange with
//! the room, so a slow SFU call can never stall a room's mailbox.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

use messenger_protocol::conference::{PreferredLayers, ProducerKind};

use crate::errors::GatewayError;

/// Media-plane error.
#[derive(Debug, Error)]
pub enum MediaPlaneError {
    #[error("media plane unavailable: {0}")]
    Unavailable(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),
}

impl From<MediaPlaneError> for GatewayError {
    fn from(err: MediaPlaneError) -> Self {
        match err {
            MediaPlaneError::Unavailable(msg) => GatewayError::Internal(msg),
            MediaPlaneError::UnknownResource(id) => GatewayError::UnknownProducer(id),
        }
    }
}

/// SFU operations the conference rooms depend on.
#[async_trait]
pub trait MediaPlane: Send + Sync {
    /// Allocate a transport for a participant. Returns the transport id.
    async fn create_transport(
        &self,
        dialog_id: &str,
        user_id: &str,
    ) -> Result<String, MediaPlaneError>;

    /// Complete transport negotiation with the client's DTLS parameters.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), MediaPlaneError>;

    /// Create a producer on a connected transport. Returns the producer id.
    async fn create_producer(
        &self,
        transport_id: &str,
        kind: ProducerKind,
        rtp_parameters: &Value,
    ) -> Result<String, MediaPlaneError>;

    /// Create a consumer of a producer. Consumers start paused.
    async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
    ) -> Result<String, MediaPlaneError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), MediaPlaneError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), MediaPlaneError>;

    /// Request SVC layers on a consumer. Best effort.
    async fn set_preferred_layers(
        &self,
        consumer_id: &str,
        layers: PreferredLayers,
    ) -> Result<(), MediaPlaneError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), MediaPlaneError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), MediaPlaneError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), MediaPlaneError>;
}

/// In-process media plane that allocates ids and tracks open resources.
/// Backs local development and lets tests assert resource cleanup.
#[derive(Debug, Default)]
pub struct LoopbackMediaPlane {
    transports: Mutex<HashSet<String>>,
    producers: Mutex<HashSet<String>>,
    consumers: Mutex<HashSet<String>>,
}

impl LoopbackMediaPlane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn open_producers(&self) -> usize {
        lock(&self.producers).len()
    }

    #[must_use]
    pub fn open_consumers(&self) -> usize {
        lock(&self.consumers).len()
    }

    #[must_use]
    pub fn open_transports(&self) -> usize {
        lock(&self.transports).len()
    }
}

#[async_trait]
impl MediaPlane for LoopbackMediaPlane {
    async fn create_transport(
        &self,
        _dialog_id: &str,
        _user_id: &str,
    ) -> Result<String, MediaPlaneError> {
        let id = format!("tr-{}", uuid::Uuid::new_v4());
        lock(&self.transports).insert(id.clone());
        Ok(id)
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: &Value,
    ) -> Result<(), MediaPlaneError> {
        if lock(&self.transports).contains(transport_id) {
            Ok(())
        } else {
            Err(MediaPlaneError::UnknownResource(transport_id.to_string()))
        }
    }

    async fn create_producer(
        &self,
        transport_id: &str,
        _kind: ProducerKind,
        _rtp_parameters: &Value,
    ) -> Result<String, MediaPlaneError> {
        if !lock(&self.transports).contains(transport_id) {
            return Err(MediaPlaneError::UnknownResource(transport_id.to_string()));
        }
        let id = format!("pr-{}", uuid::Uuid::new_v4());
        lock(&self.producers).insert(id.clone());
        Ok(id)
    }

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
    ) -> Result<String, MediaPlaneError> {
        if !lock(&self.transports).contains(transport_id) {
            return Err(MediaPlaneError::UnknownResource(transport_id.to_string()));
        }
        if !lock(&self.producers).contains(producer_id) {
            return Err(MediaPlaneError::UnknownResource(producer_id.to_string()));
        }
        let id = format!("co-{}", uuid::Uuid::new_v4());
        lock(&self.consumers).insert(id.clone());
        Ok(id)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), MediaPlaneError> {
        known(&self.consumers, consumer_id)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), MediaPlaneError> {
        known(&self.consumers, consumer_id)
    }

    async fn set_preferred_layers(
        &self,
        consumer_id: &str,
        _layers: PreferredLayers,
    ) -> Result<(), MediaPlaneError> {
        known(&self.consumers, consumer_id)
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), MediaPlaneError> {
        lock(&self.producers).remove(producer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), MediaPlaneError> {
        lock(&self.consumers).remove(consumer_id);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), MediaPlaneError> {
        lock(&self.transports).remove(transport_id);
        Ok(())
    }
}

fn known(set: &Mutex<HashSet<String>>, id: &str) -> Result<(), MediaPlaneError> {
    if lock(set).contains(id) {
        Ok(())
    } else {
        Err(MediaPlaneError::UnknownResource(id.to_string()))
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_produce_requires_transport() {
        let plane = LoopbackMediaPlane::new();
        let result = plane
            .create_producer("tr-missing", ProducerKind::Audio, &json!({}))
            .await;
        assert!(matches!(result, Err(MediaPlaneError::UnknownResource(_))));
    }

    #[tokio::test]
    async fn test_full_lifecycle_releases_resources() {
        let plane = LoopbackMediaPlane::new();
        let transport = plane.create_transport("d1", "u1").await.unwrap();
        plane
            .connect_transport(&transport, &json!({"role": "client"}))
            .await
            .unwrap();
        let producer = plane
            .create_producer(&transport, ProducerKind::Video, &json!({}))
            .await
            .unwrap();
        let consumer = plane.create_consumer(&transport, &producer).await.unwrap();

        assert_eq!(plane.open_producers(), 1);
        assert_eq!(plane.open_consumers(), 1);

        plane.close_consumer(&consumer).await.unwrap();
        plane.close_producer(&producer).await.unwrap();
        plane.close_transport(&transport).await.unwrap();

        assert_eq!(plane.open_producers(), 0);
        assert_eq!(plane.open_consumers(), 0);
        assert_eq!(plane.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_rejected() {
        let plane = LoopbackMediaPlane::new();
        let transport = plane.create_transport("d1", "u1").await.unwrap();
        let result = plane.create_consumer(&transport, "pr-ghost").await;
        assert!(matches!(result, Err(MediaPlaneError::UnknownResource(_))));
    }
}
