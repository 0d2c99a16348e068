use crate::data::{AllocationRequest, ResultEnvelope};
use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, RunOutcome};
use axum::extract::State;
use axum::{Json, Router, routing::post};
use serde::{Deserialize, Serialize};

async fn run_handler(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<AllocationRequest>,
) -> Result<Json<ResultEnvelope>, (axum::http::StatusCode, String)> {
    let ticket = orchestrator.start(request).map_err(|e| match e {
        EngineError::InvalidInput(_) => (axum::http::StatusCode::BAD_REQUEST, e.to_string()),
        _ => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        ),
    })?;

    match ticket.outcome.await {
        Ok(RunOutcome::Completed(result)) => Ok(Json(ResultEnvelope { data: result })),
        Ok(RunOutcome::Cancelled) => Err((
            axum::http::StatusCode::CONFLICT,
            format!("run '{}' was cancelled", ticket.run_id),
        )),
        Ok(RunOutcome::Failed(message)) => {
            Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, message))
        }
        Err(_) => Err((
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "worker finished without reporting an outcome".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

/// Best-effort: cancelling an unknown or finished run is not an error.
async fn cancel_handler(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<CancelRequest>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: orchestrator.cancel(&request.run_id),
    })
}

pub fn app() -> Router {
    Router::new()
        .route("/v1/allocation/run", post(run_handler))
        .route("/v1/allocation/cancel", post(cancel_handler))
        .with_state(Orchestrator::new())
}

pub async fn run_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
        .await
        .unwrap();

    println!("Server running at http://{}", listener.local_addr().unwrap());

    axum::serve(listener, app()).await.unwrap();
}
