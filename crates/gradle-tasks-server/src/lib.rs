//! gradle-tasks gRPC server
//!
//! Exposes the core [`BuildService`] as `gradle_tasks.v1.GradleTasks`.

pub mod convert;
pub mod grpc;
pub mod proto;

use std::future::Future;
use std::time::Duration;

use gradle_tasks_core::BuildService;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

pub use grpc::GradleTasksService;
pub use proto::v1::gradle_tasks_client::GradleTasksClient;
pub use proto::v1::gradle_tasks_server::GradleTasksServer;

/// How long shutdown waits for cancelled operations to release their
/// connections.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve on `listener` until `shutdown` resolves.
///
/// On shutdown every in-flight operation is cancelled first so open streams
/// end with a `CANCELLED` status instead of holding the server open.
pub async fn serve<F>(listener: TcpListener, core: BuildService, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr()?;
    info!(%addr, "gradle-tasks server listening");

    let signal = {
        let core = core.clone();
        async move {
            shutdown.await;
            let cancelled = core.shutdown();
            info!(cancelled, "shutting down");
        }
    };

    Server::builder()
        .add_service(GradleTasksServer::new(GradleTasksService::new(core.clone())))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
        .await?;

    if !core.wait_idle(DRAIN_TIMEOUT).await {
        warn!(
            connections = core.open_connections(),
            "operations still running after shutdown"
        );
    }
    Ok(())
}
