//! Per-operation engine connections.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{BuildConfig, VersionPolicy};
use crate::engine::{Engine, EngineConnection, EngineResult};

/// Opens engine connections and keeps count of the live ones.
pub struct ConnectionProvider {
    engine: Arc<dyn Engine>,
    live: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl ConnectionProvider {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            live: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Configure a fresh connector from `config` and connect.
    ///
    /// Steps run in a fixed order: project directory, user home (only when
    /// set), version policy, connect.
    pub async fn acquire(&self, config: &BuildConfig) -> EngineResult<Connection> {
        let mut connector = self.engine.new_connector();
        connector.for_project_directory(&config.project_dir);
        if let Some(home) = &config.user_home {
            connector.use_gradle_user_home_dir(home);
        }
        match &config.version_policy {
            VersionPolicy::UseWrapper => connector.use_build_distribution(),
            VersionPolicy::UseVersion(version) => connector.use_gradle_version(version),
            VersionPolicy::UseInstallation(dir) => connector.use_installation(dir),
        }
        let inner = connector.connect().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(
            connection = id,
            project_dir = %config.project_dir.display(),
            policy = %config.version_policy,
            "connection opened"
        );
        Ok(Connection {
            id,
            config: config.clone(),
            inner,
            live: self.live.clone(),
            closed: false,
        })
    }

    /// Close `conn`. Consuming it makes a second close impossible.
    pub async fn release(&self, mut conn: Connection) {
        conn.inner.close().await;
        conn.closed = true;
        debug!(connection = conn.id, "connection closed");
    }

    /// Connections acquired and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Engine connection owned by exactly one operation.
pub struct Connection {
    id: u64,
    config: BuildConfig,
    inner: Box<dyn EngineConnection>,
    live: Arc<AtomicUsize>,
    closed: bool,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn engine_mut(&mut self) -> &mut dyn EngineConnection {
        self.inner.as_mut()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("project_dir", &self.config.project_dir)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed {
            warn!(connection = self.id, "connection dropped without being released");
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, RawBuildConfig};
    use crate::engine::EngineError;
    use crate::fakes::{EngineCall, FakeEngine};
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_acquire_applies_steps_in_order() {
        let engine = FakeEngine::new();
        let provider = ConnectionProvider::new(Arc::new(engine.clone()));
        let config = resolve(&RawBuildConfig {
            user_home: "/home/me/.gradle".into(),
            ..RawBuildConfig::wrapper("/tmp/p")
        })
        .unwrap();

        let conn = provider.acquire(&config).await.unwrap();
        assert_eq!(provider.open_connections(), 1);
        provider.release(conn).await;
        assert_eq!(provider.open_connections(), 0);

        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::ForProjectDirectory(PathBuf::from("/tmp/p")),
                EngineCall::UseGradleUserHome(PathBuf::from("/home/me/.gradle")),
                EngineCall::UseBuildDistribution,
                EngineCall::Connect,
                EngineCall::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_user_home_absent_is_never_applied() {
        let engine = FakeEngine::new();
        let provider = ConnectionProvider::new(Arc::new(engine.clone()));
        let config = resolve(&RawBuildConfig {
            installation: "/opt/gradle".into(),
            ..RawBuildConfig {
                project_dir: "/tmp/p".into(),
                ..RawBuildConfig::default()
            }
        })
        .unwrap();

        let conn = provider.acquire(&config).await.unwrap();
        provider.release(conn).await;
        assert_eq!(
            engine.count(|c| matches!(c, EngineCall::UseGradleUserHome(_))),
            0
        );
        assert!(engine
            .calls()
            .contains(&EngineCall::UseInstallation(PathBuf::from("/opt/gradle"))));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_nothing_open() {
        let engine = FakeEngine::new().with_connect_error("no daemon");
        let provider = ConnectionProvider::new(Arc::new(engine));
        let config = resolve(&RawBuildConfig::wrapper("/tmp/p")).unwrap();

        let err = provider.acquire(&config).await.unwrap_err();
        assert!(matches!(err, EngineError::Connect(_)));
        assert_eq!(provider.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_still_counted_down() {
        let provider = ConnectionProvider::new(Arc::new(FakeEngine::new()));
        let config = resolve(&RawBuildConfig::wrapper("/tmp/p")).unwrap();
        let conn = provider.acquire(&config).await.unwrap();
        drop(conn);
        assert_eq!(provider.open_connections(), 0);
    }
}
