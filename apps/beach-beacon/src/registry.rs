use std::fmt;
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{EngineError, EngineEvents, EngineFactory, Role};
use crate::session::{NegotiationSession, Outbound, SessionHandle};

/// Identity of one signaling transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} already has a negotiation session")]
    Duplicate(ConnectionId),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RegistryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistryError::Engine(err) if err.is_fatal())
    }
}

/// Live negotiation sessions keyed by connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<ConnectionRegistryInner>,
}

struct ConnectionRegistryInner {
    sessions: DashMap<ConnectionId, Arc<SessionHandle>>,
    factory: Arc<dyn EngineFactory>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(ConnectionRegistryInner {
                sessions: DashMap::new(),
                factory,
            }),
        }
    }

    /// Builds and starts an engine for `connection`, then registers a polite
    /// session that writes its signaling through `outbound`.
    pub async fn open(
        &self,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Arc<SessionHandle>, RegistryError> {
        if self.inner.sessions.contains_key(&connection) {
            return Err(RegistryError::Duplicate(connection));
        }

        let role = Role::Polite;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = self
            .inner
            .factory
            .create(role, EngineEvents::new(events_tx.clone()))
            .await?;
        if let Err(err) = engine.start().await {
            warn!(connection = %connection, error = %err, "media engine failed to start");
            engine.stop().await;
            return Err(err.into());
        }

        let session = NegotiationSession::new(
            connection,
            role,
            engine,
            outbound,
            events_tx.clone(),
        );
        let handle = SessionHandle::spawn(session, events_tx, events_rx);

        let inserted = match self.inner.sessions.entry(connection) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&handle));
                true
            }
        };
        if !inserted {
            handle.close();
            return Err(RegistryError::Duplicate(connection));
        }

        info!(
            connection = %connection,
            sessions = self.inner.sessions.len(),
            "negotiation session opened"
        );
        Ok(handle)
    }

    /// Stops and forgets the session for `connection`. Returns false if there
    /// was none.
    pub fn close(&self, connection: ConnectionId) -> bool {
        let Some(handle) = self.lookup(connection) else {
            debug!(connection = %connection, "no session to close");
            return false;
        };

        handle.close();
        let removed = self
            .inner
            .sessions
            .remove_if(&connection, |_, current| Arc::ptr_eq(current, &handle))
            .is_some();
        if removed {
            info!(
                connection = %connection,
                sessions = self.inner.sessions.len(),
                "negotiation session removed"
            );
        }
        removed
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<Arc<SessionHandle>> {
        self.inner
            .sessions
            .get(&connection)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Closes every session and waits for their engines to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if handles.is_empty() {
            return;
        }

        info!(sessions = handles.len(), "closing remaining negotiation sessions");
        for handle in &handles {
            self.close(handle.connection());
        }
        for handle in handles {
            handle.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::engine::mock::{EngineCall, MockBehavior, MockEngineFactory};

    fn registry(behavior: MockBehavior) -> (ConnectionRegistry, Arc<MockEngineFactory>) {
        let factory = Arc::new(MockEngineFactory::with_behavior(behavior));
        (ConnectionRegistry::new(factory.clone()), factory)
    }

    fn stop_count(calls: &[EngineCall]) -> usize {
        calls
            .iter()
            .filter(|call| matches!(call, EngineCall::Stop))
            .count()
    }

    #[tokio::test]
    async fn open_registers_a_started_polite_session() {
        let (registry, factory) = registry(MockBehavior::default());
        let (outbound, _rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();

        let handle = registry.open(connection, outbound).await.expect("open");
        assert_eq!(handle.connection(), connection);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(connection).is_some());

        let engine = factory.last_engine().expect("engine built");
        assert_eq!(engine.role(), Role::Polite);
        assert_eq!(engine.calls().first(), Some(&EngineCall::Start));
    }

    #[tokio::test]
    async fn open_rejects_duplicate_connection() {
        let (registry, _factory) = registry(MockBehavior::default());
        let (outbound, _rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();

        registry.open(connection, outbound.clone()).await.expect("open");
        let err = registry.open(connection, outbound).await.expect_err("duplicate");
        assert!(matches!(err, RegistryError::Duplicate(id) if id == connection));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (registry, factory) = registry(MockBehavior::default());
        let (outbound, _rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        registry.open(connection, outbound).await.expect("open");

        assert!(registry.close(connection));
        assert!(!registry.close(connection));
        assert!(registry.is_empty());

        let engine = factory.last_engine().expect("engine built");
        assert!(engine.wait_for(|calls| stop_count(calls) == 1).await);
        assert_eq!(stop_count(&engine.calls()), 1);
    }

    #[tokio::test]
    async fn keys_track_open_connections() {
        let (registry, _factory) = registry(MockBehavior::default());
        let (outbound, _rx) = mpsc::unbounded_channel();
        let ids: Vec<ConnectionId> = (0..3).map(|_| ConnectionId::new()).collect();
        for id in &ids {
            registry.open(*id, outbound.clone()).await.expect("open");
        }

        assert!(registry.close(ids[1]));
        assert!(!registry.close(ConnectionId::new()));

        let expected: HashSet<ConnectionId> = [ids[0], ids[2]].into_iter().collect();
        let actual: HashSet<ConnectionId> = registry.connection_ids().into_iter().collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn failed_start_registers_nothing() {
        let (registry, factory) = registry(MockBehavior {
            fail_start: true,
            ..MockBehavior::default()
        });
        let (outbound, _rx) = mpsc::unbounded_channel();

        let err = registry
            .open(ConnectionId::new(), outbound)
            .await
            .expect_err("start fails");
        assert!(!err.is_fatal());
        assert!(registry.is_empty());

        let engine = factory.last_engine().expect("engine built");
        assert_eq!(engine.calls(), vec![EngineCall::Start, EngineCall::Stop]);
    }

    #[tokio::test]
    async fn declined_engine_registers_nothing() {
        let (registry, factory) = registry(MockBehavior {
            fail_create: true,
            ..MockBehavior::default()
        });
        let (outbound, _rx) = mpsc::unbounded_channel();

        let err = registry
            .open(ConnectionId::new(), outbound)
            .await
            .expect_err("factory declines");
        assert!(matches!(
            err,
            RegistryError::Engine(EngineError::Rejected { operation: "create", .. })
        ));
        assert!(!err.is_fatal());
        assert!(registry.is_empty());
        assert!(factory.engines().is_empty());
    }

    #[tokio::test]
    async fn startup_failure_is_fatal() {
        let (registry, _factory) = registry(MockBehavior {
            fatal_create: true,
            ..MockBehavior::default()
        });
        let (outbound, _rx) = mpsc::unbounded_channel();

        let err = registry
            .open(ConnectionId::new(), outbound)
            .await
            .expect_err("factory fails");
        assert!(err.is_fatal());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn offer_finishing_after_close_is_discarded() {
        let (registry, factory) = registry(MockBehavior {
            hold_offers: true,
            negotiate_on_start: true,
            ..MockBehavior::default()
        });
        let (outbound, mut rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        let other = ConnectionId::new();
        registry.open(connection, outbound.clone()).await.expect("open");
        registry.open(other, outbound).await.expect("open other");

        let engine = factory.engines()[0].clone();
        assert!(engine.wait_for(|calls| calls.contains(&EngineCall::CreateOffer)).await);

        assert!(registry.close(connection));
        assert!(engine.wait_for(|calls| stop_count(calls) == 1).await);
        engine.release_offer();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        assert!(!engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::SetLocalDescription(_))));
        assert_eq!(registry.connection_ids(), vec![other]);
    }

    #[tokio::test]
    async fn shutdown_stops_every_engine() {
        let (registry, factory) = registry(MockBehavior::default());
        let (outbound, _rx) = mpsc::unbounded_channel();
        for _ in 0..2 {
            registry
                .open(ConnectionId::new(), outbound.clone())
                .await
                .expect("open");
        }

        registry.shutdown().await;
        assert!(registry.is_empty());
        for engine in factory.engines() {
            assert_eq!(stop_count(&engine.calls()), 1);
        }
    }
}
