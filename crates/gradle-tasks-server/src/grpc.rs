//! tonic implementation of `gradle_tasks.v1.GradleTasks`.
//!
//! Each handler translates the request, calls the core [`BuildService`] and
//! maps the result back. Streaming handlers wrap the core's operation stream;
//! when the client goes away tonic drops that stream, which the core treats as
//! a cancellation.

use std::pin::Pin;

use gradle_tasks_core::{service as facade, BuildService};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::convert;
use crate::proto::v1::gradle_tasks_server::GradleTasks;
use crate::proto::v1::{
    CancelGetBuildReply, CancelGetBuildRequest, CancelGetBuildsReply, CancelGetBuildsRequest,
    CancelRunTaskReply, CancelRunTaskRequest, CancelRunTasksReply, CancelRunTasksRequest,
    GetBuildReply, GetBuildRequest, GetDaemonsStatusReply, GetDaemonsStatusRequest,
    RunTaskReply, RunTaskRequest, StopDaemonReply, StopDaemonRequest, StopDaemonsReply,
    StopDaemonsRequest,
};

type ReplyStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// gRPC front end over a [`BuildService`].
#[derive(Clone)]
pub struct GradleTasksService {
    core: BuildService,
}

impl GradleTasksService {
    pub fn new(core: BuildService) -> Self {
        Self { core }
    }
}

#[tonic::async_trait]
impl GradleTasks for GradleTasksService {
    type GetBuildStream = ReplyStream<GetBuildReply>;
    type RunTaskStream = ReplyStream<RunTaskReply>;

    async fn get_build(
        &self,
        request: Request<GetBuildRequest>,
    ) -> Result<Response<Self::GetBuildStream>, Status> {
        let req = request.into_inner();
        debug!(project_dir = %req.project_dir, request_id = %req.request_id, "GetBuild");
        let stream = self.core.get_build(facade::GetBuildRequest {
            request_id: req.request_id,
            config: convert::raw_config(req.project_dir, req.gradle_config, req.show_output_colors),
        });
        let replies = ReceiverStream::new(stream).filter_map(convert::get_build_item);
        Ok(Response::new(Box::pin(replies)))
    }

    async fn cancel_get_build(
        &self,
        request: Request<CancelGetBuildRequest>,
    ) -> Result<Response<CancelGetBuildReply>, Status> {
        let reply = self.core.cancel_get_build(&request.into_inner().request_id);
        Ok(Response::new(CancelGetBuildReply {
            message: reply.message,
            build_running: reply.running,
        }))
    }

    async fn cancel_get_builds(
        &self,
        _request: Request<CancelGetBuildsRequest>,
    ) -> Result<Response<CancelGetBuildsReply>, Status> {
        let reply = self.core.cancel_get_builds();
        Ok(Response::new(CancelGetBuildsReply {
            message: reply.message,
        }))
    }

    async fn run_task(
        &self,
        request: Request<RunTaskRequest>,
    ) -> Result<Response<Self::RunTaskStream>, Status> {
        let req = request.into_inner();
        debug!(project_dir = %req.project_dir, task = %req.task, request_id = %req.request_id, "RunTask");
        let stream = self.core.run_task(facade::RunTaskRequest {
            request_id: req.request_id,
            config: convert::raw_config(req.project_dir, req.gradle_config, req.show_output_colors),
            tasks: vec![req.task],
            arguments: req.args,
            java_debug: req.java_debug,
            java_debug_port: req.java_debug_port,
        });
        let replies = ReceiverStream::new(stream).filter_map(convert::run_task_item);
        Ok(Response::new(Box::pin(replies)))
    }

    async fn cancel_run_task(
        &self,
        request: Request<CancelRunTaskRequest>,
    ) -> Result<Response<CancelRunTaskReply>, Status> {
        let reply = self.core.cancel_run_task(&request.into_inner().request_id);
        Ok(Response::new(CancelRunTaskReply {
            message: reply.message,
            task_running: reply.running,
        }))
    }

    async fn cancel_run_tasks(
        &self,
        _request: Request<CancelRunTasksRequest>,
    ) -> Result<Response<CancelRunTasksReply>, Status> {
        let reply = self.core.cancel_run_tasks();
        Ok(Response::new(CancelRunTasksReply {
            message: reply.message,
        }))
    }

    async fn get_daemons_status(
        &self,
        request: Request<GetDaemonsStatusRequest>,
    ) -> Result<Response<GetDaemonsStatusReply>, Status> {
        let project_dir = request.into_inner().project_dir;
        let daemons = self
            .core
            .daemons_status(&project_dir)
            .await
            .map_err(|err| convert::status(&err))?;
        Ok(Response::new(GetDaemonsStatusReply {
            daemon_info: daemons.into_iter().map(convert::daemon).collect(),
        }))
    }

    async fn stop_daemons(
        &self,
        request: Request<StopDaemonsRequest>,
    ) -> Result<Response<StopDaemonsReply>, Status> {
        let project_dir = request.into_inner().project_dir;
        let message = self
            .core
            .stop_daemons(&project_dir)
            .await
            .map_err(|err| convert::status(&err))?;
        Ok(Response::new(StopDaemonsReply { message }))
    }

    async fn stop_daemon(
        &self,
        request: Request<StopDaemonRequest>,
    ) -> Result<Response<StopDaemonReply>, Status> {
        let pid = request.into_inner().pid;
        let message = self
            .core
            .stop_daemon(&pid)
            .await
            .map_err(|err| convert::status(&err))?;
        Ok(Response::new(StopDaemonReply { message }))
    }
}
