//! gRPC Run API.
//!
//! Thin mapping from the wire surface (`proto/engine.proto`) onto the
//! [`Engine`] façade: runs are created from raw suite YAML, observed through
//! snapshots, streamed via per-run log subscriptions, and cancelled
//! cooperatively. Log streaming pumps a [`LogSubscription`] into an mpsc
//! channel so the generated server can return a `ReceiverStream`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::Server, Request, Response, Status};
use tracing::info;

use crate::engine::runs::{LogEntry, RunRecord, RunStatus, StepRecord, TestRecord};
use crate::engine::Engine;
use crate::errors::EngineError;

/// Generated wire types for `rocketship.v1`.
pub mod proto {
    tonic::include_proto!("rocketship.v1");
}

use proto::engine_server::{Engine as EngineRpc, EngineServer};

/// gRPC service wrapping a shared engine.
pub struct EngineService {
    engine: Arc<Engine>,
}

impl EngineService {
    /// Wraps `engine` for serving.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl EngineRpc for EngineService {
    async fn create_run(
        &self,
        request: Request<proto::CreateRunRequest>,
    ) -> Result<Response<proto::CreateRunResponse>, Status> {
        let req = request.into_inner();
        let yaml = String::from_utf8(req.suite_yaml)
            .map_err(|_| Status::invalid_argument("suite_yaml is not valid UTF-8"))?;
        let overrides: Vec<(String, String)> = req.overrides.into_iter().collect();
        let timeout = (req.timeout_seconds > 0).then(|| Duration::from_secs(req.timeout_seconds));

        match self.engine.create_run(&yaml, overrides, timeout).await {
            Ok(run_id) => Ok(Response::new(proto::CreateRunResponse { run_id })),
            Err(err @ (EngineError::Validation { .. } | EngineError::UnresolvedVariable { .. })) => {
                Err(Status::invalid_argument(err.to_string()))
            }
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn get_run(
        &self,
        request: Request<proto::GetRunRequest>,
    ) -> Result<Response<proto::RunSnapshot>, Status> {
        let run_id = request.into_inner().run_id;
        let record = self
            .engine
            .get_run(&run_id)
            .await
            .ok_or_else(|| Status::not_found(format!("no run with id '{run_id}'")))?;
        Ok(Response::new(snapshot_to_proto(&record)))
    }

    async fn list_runs(
        &self,
        request: Request<proto::ListRunsRequest>,
    ) -> Result<Response<proto::RunSummaryPage>, Status> {
        let req = request.into_inner();
        let filter = proto::RunStatus::try_from(req.status).ok();
        let offset: usize = if req.page_token.is_empty() {
            0
        } else {
            req.page_token
                .parse()
                .map_err(|_| Status::invalid_argument("malformed page_token"))?
        };
        let page_size = if req.page_size == 0 {
            50
        } else {
            req.page_size as usize
        };

        let runs: Vec<RunRecord> = self
            .engine
            .list_runs()
            .await
            .into_iter()
            .filter(|record| match filter {
                None | Some(proto::RunStatus::Unspecified) => true,
                Some(wanted) => status_to_proto(record.status) == wanted,
            })
            .collect();

        let page: Vec<proto::RunSummary> = runs
            .iter()
            .skip(offset)
            .take(page_size)
            .map(summary_to_proto)
            .collect();
        let next_page_token = if offset + page.len() < runs.len() {
            (offset + page.len()).to_string()
        } else {
            String::new()
        };

        Ok(Response::new(proto::RunSummaryPage {
            runs: page,
            next_page_token,
        }))
    }

    type StreamLogsStream = ReceiverStream<Result<proto::LogEntry, Status>>;

    async fn stream_logs(
        &self,
        request: Request<proto::StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let run_id = request.into_inner().run_id;
        let mut subscription = self
            .engine
            .subscribe_logs(&run_id)
            .await
            .ok_or_else(|| Status::not_found(format!("no run with id '{run_id}'")))?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(entry) = subscription.next().await {
                if tx.send(Ok(entry_to_proto(&entry))).await.is_err() {
                    break; // Client disconnected.
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn cancel_run(
        &self,
        request: Request<proto::CancelRunRequest>,
    ) -> Result<Response<proto::CancelRunResponse>, Status> {
        let run_id = request.into_inner().run_id;
        let cancelling = self
            .engine
            .cancel_run(&run_id)
            .await
            .ok_or_else(|| Status::not_found(format!("no run with id '{run_id}'")))?;
        Ok(Response::new(proto::CancelRunResponse { cancelling }))
    }

    async fn get_capabilities(
        &self,
        _request: Request<proto::GetCapabilitiesRequest>,
    ) -> Result<Response<proto::Capabilities>, Status> {
        let plugins = self
            .engine
            .registry()
            .capabilities()
            .into_iter()
            .map(|(kind, schema)| proto::PluginInfo {
                kind: kind.to_string(),
                config_schema_json: schema.to_string(),
            })
            .collect();
        Ok(Response::new(proto::Capabilities {
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugins,
        }))
    }
}

/// Serves the engine on `addr` until the process exits.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    info!(%addr, "engine listening");
    Server::builder()
        .add_service(EngineServer::new(EngineService::new(engine)))
        .serve(addr)
        .await
}

// ============================================================================
// Wire mapping
// ============================================================================

fn status_to_proto(status: RunStatus) -> proto::RunStatus {
    match status {
        RunStatus::Pending => proto::RunStatus::Pending,
        RunStatus::Running => proto::RunStatus::Running,
        RunStatus::Passed => proto::RunStatus::Passed,
        RunStatus::Failed => proto::RunStatus::Failed,
        RunStatus::Cancelled => proto::RunStatus::Cancelled,
        RunStatus::Timeout => proto::RunStatus::Timeout,
    }
}

fn snapshot_to_proto(record: &RunRecord) -> proto::RunSnapshot {
    proto::RunSnapshot {
        run_id: record.run_id.clone(),
        suite_name: record.suite_name.clone(),
        status: status_to_proto(record.status) as i32,
        started_at: record
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        ended_at: record.ended_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        duration_ms: record.duration_ms,
        tests: record.tests.iter().map(test_to_proto).collect(),
    }
}

fn test_to_proto(record: &TestRecord) -> proto::TestSnapshot {
    proto::TestSnapshot {
        name: record.name.clone(),
        status: status_to_proto(record.status) as i32,
        duration_ms: record.duration_ms,
        steps: record.steps.iter().map(step_to_proto).collect(),
    }
}

fn step_to_proto(record: &StepRecord) -> proto::StepSnapshot {
    proto::StepSnapshot {
        name: record.name.clone(),
        plugin: record.plugin.clone(),
        status: status_to_proto(record.status) as i32,
        attempts: record.attempts,
        duration_ms: record.duration_ms,
        error: record.error.clone().unwrap_or_default(),
    }
}

fn summary_to_proto(record: &RunRecord) -> proto::RunSummary {
    proto::RunSummary {
        run_id: record.run_id.clone(),
        suite_name: record.suite_name.clone(),
        status: status_to_proto(record.status) as i32,
        started_at: record
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        ended_at: record.ended_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
    }
}

fn entry_to_proto(entry: &LogEntry) -> proto::LogEntry {
    proto::LogEntry {
        run_id: entry.run_id.clone(),
        seq: entry.seq,
        test_name: entry.test_name.clone().unwrap_or_default(),
        step_name: entry.step_name.clone().unwrap_or_default(),
        level: entry.level.clone(),
        timestamp: entry.timestamp.to_rfc3339(),
        payload_json: entry.payload.to_string(),
        terminal: entry.terminal.is_some(),
        final_status: entry
            .terminal
            .map(|status| status_to_proto(status) as i32)
            .unwrap_or(proto::RunStatus::Unspecified as i32),
    }
}
