//! Cooperative cancellation: one-shot controllers and the request registry.
//!
//! A [`CancellationController`] owns the signal; the engine call only ever
//! sees a [`CancellationToken`]. The [`CancellationRegistry`] maps request ids
//! to controllers so an out-of-band RPC can cancel one specific operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identifier naming one in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new random RequestId.
    pub fn new() -> Self {
        RequestId(uuid::Uuid::new_v4().to_string())
    }

    /// Use the caller-supplied id, or generate one when it is blank.
    pub fn from_client(id: &str) -> Self {
        if id.trim().is_empty() {
            Self::new()
        } else {
            RequestId(id.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-shot cancellation signal source.
#[derive(Debug, Clone)]
pub struct CancellationController {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Token handed to the engine call.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a [`CancellationController`].
#[derive(Debug, Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signaled.
    ///
    /// Never resolves if the controller is dropped without signaling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let signaled = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if signaled.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Errors produced by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("request id {0} is already registered")]
    DuplicateRequestId(RequestId),
}

/// Process-scoped map from [`RequestId`] to live controllers.
///
/// Cheap to clone; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    entries: Arc<Mutex<HashMap<RequestId, CancellationController>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationController>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new in-flight operation.
    ///
    /// The returned guard unregisters the id when dropped.
    pub fn register(&self, id: RequestId) -> Result<Registration, RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateRequestId(id));
        }
        let controller = CancellationController::new();
        entries.insert(id.clone(), controller.clone());
        Ok(Registration {
            registry: self.clone(),
            id,
            controller,
        })
    }

    /// Signal cancellation for `id`. Returns `false` when the id is unknown.
    pub fn signal(&self, id: &RequestId) -> bool {
        let controller = self.lock().get(id).cloned();
        match controller {
            Some(controller) => {
                controller.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove `id`. No-op when absent.
    pub fn unregister(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    /// Signal every live entry; returns how many were signaled.
    pub fn cancel_all(&self) -> usize {
        let controllers: Vec<_> = self.lock().values().cloned().collect();
        for controller in &controllers {
            controller.cancel();
        }
        controllers.len()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// RAII registration of one request id.
#[derive(Debug)]
pub struct Registration {
    registry: CancellationRegistry,
    id: RequestId,
    controller: CancellationController,
}

impl Registration {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn controller(&self) -> &CancellationController {
        &self.controller
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_controller_is_one_shot() {
        let controller = CancellationController::new();
        assert!(!controller.is_cancelled());
        assert!(controller.cancel());
        assert!(!controller.cancel());
        assert!(controller.is_cancelled());
    }

    #[test]
    fn test_token_observes_controller() {
        let controller = CancellationController::new();
        let token = controller.token();
        assert!(!token.is_cancelled());
        controller.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_token_cancelled_resolves() {
        let controller = CancellationController::new();
        let token = controller.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        controller.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("token should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_cancelled_already_signaled() {
        let controller = CancellationController::new();
        controller.cancel();
        tokio::time::timeout(Duration::from_secs(1), controller.token().cancelled())
            .await
            .expect("already-cancelled token resolves immediately");
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = CancellationRegistry::new();
        let id = RequestId("build-1".into());
        let _first = registry.register(id.clone()).unwrap();
        let err = registry.register(id.clone()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRequestId(id));
    }

    #[test]
    fn test_signal_unknown_returns_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.signal(&RequestId("nope".into())));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_signal_known_cancels_only_that_entry() {
        let registry = CancellationRegistry::new();
        let a = registry.register(RequestId("a".into())).unwrap();
        let b = registry.register(RequestId("b".into())).unwrap();

        assert!(registry.signal(a.id()));
        assert!(a.controller().is_cancelled());
        assert!(!b.controller().is_cancelled());
    }

    #[test]
    fn test_signal_twice_still_acknowledged() {
        let registry = CancellationRegistry::new();
        let reg = registry.register(RequestId("a".into())).unwrap();
        assert!(registry.signal(reg.id()));
        assert!(registry.signal(reg.id()));
        assert!(reg.controller().is_cancelled());
    }

    #[test]
    fn test_registration_drop_unregisters() {
        let registry = CancellationRegistry::new();
        let id = RequestId("a".into());
        {
            let _reg = registry.register(id.clone()).unwrap();
            assert!(registry.contains(&id));
        }
        assert!(!registry.contains(&id));
        assert!(!registry.signal(&id));
        // id can be reused once the previous operation is gone
        let _again = registry.register(id).unwrap();
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancellationRegistry::new();
        let a = registry.register(RequestId("a".into())).unwrap();
        let b = registry.register(RequestId("b".into())).unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.controller().is_cancelled());
        assert!(b.controller().is_cancelled());
    }

    #[test]
    fn test_request_id_from_client() {
        assert_eq!(RequestId::from_client("abc").as_str(), "abc");
        let generated = RequestId::from_client("");
        assert!(uuid::Uuid::parse_str(generated.as_str()).is_ok());
    }
}
