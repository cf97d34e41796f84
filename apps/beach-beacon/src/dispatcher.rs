use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::{self, DecodeError, ProtocolError};
use crate::registry::{ConnectionId, ConnectionRegistry, RegistryError};
use crate::session::Outbound;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no negotiation session for connection {0}")]
    NoSession(ConnectionId),
    #[error("negotiation session for connection {0} is closing")]
    SessionClosed(ConnectionId),
}

/// Routes transport lifecycle and inbound frames to the owning session.
#[derive(Clone)]
pub struct SignalingDispatcher {
    registry: ConnectionRegistry,
}

impl SignalingDispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn on_connection_opened(
        &self,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<(), RegistryError> {
        self.registry.open(connection, outbound).await.map(|_| ())
    }

    /// Decodes one text frame and queues it on the connection's session.
    /// Nothing reaches the session when decoding fails.
    pub fn on_text_message(&self, connection: ConnectionId, text: &str) -> Result<(), DispatchError> {
        let envelope = protocol::decode(text)?;
        trace!(connection = %connection, kind = %envelope.kind, "inbound signaling message");

        let session = self
            .registry
            .lookup(connection)
            .ok_or(DispatchError::NoSession(connection))?;
        if !session.deliver(envelope) {
            return Err(DispatchError::SessionClosed(connection));
        }
        Ok(())
    }

    pub fn on_binary_message(&self, _connection: ConnectionId, len: usize) -> Result<(), DispatchError> {
        Err(ProtocolError::BinaryFrame(len).into())
    }

    pub fn on_connection_closed(&self, connection: ConnectionId) -> bool {
        self.registry.close(connection)
    }
}
