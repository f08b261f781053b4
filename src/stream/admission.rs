//! Connection admission for stream requests.

use std::sync::Arc;
use tracing::{info, warn};

use crate::Result;
use crate::power::PowerController;
use crate::registry::{ClientConnection, ClientId, ClientRegistry, Transport};

/// Enrolls new stream clients and wakes the idle pipeline.
///
/// This is the only place that resumes suspended workers.
pub struct Admission<T> {
    registry: Arc<ClientRegistry<ClientConnection<T>>>,
    power: Arc<PowerController>,
}

impl<T> Clone for Admission<T> {
    fn clone(&self) -> Self {
        Self { registry: Arc::clone(&self.registry), power: Arc::clone(&self.power) }
    }
}

impl<T: Transport> Admission<T> {
    pub fn new(registry: Arc<ClientRegistry<ClientConnection<T>>>, power: Arc<PowerController>) -> Self {
        Self { registry, power }
    }

    /// Admit one stream client.
    ///
    /// When the registry is full the connection is dropped and the registry is left
    /// exactly as it was. Otherwise the stream preamble is written, the client is queued
    /// at the tail and both workers are woken.
    pub async fn admit(&self, mut connection: ClientConnection<T>) -> Result<ClientId> {
        let id = connection.id();
        let reservation = match self.registry.reserve() {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(client = %id, "Stream request refused: {}", e);
                return Err(e);
            }
        };

        // On failure the reservation is dropped and the slot freed
        connection.send_preamble().await?;
        reservation.commit(connection);

        let woke = self.power.wake_all();
        info!(client = %id, active = self.registry.len(), woke, "Stream client admitted");
        Ok(id)
    }

    /// Clients currently enrolled
    pub fn active_clients(&self) -> usize {
        self.registry.len()
    }

    /// Registry capacity
    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    /// Whether a new client would be refused right now.
    pub fn is_full(&self) -> bool {
        self.registry.len() >= self.registry.capacity()
    }
}
