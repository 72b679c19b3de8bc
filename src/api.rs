//! Minimal status HTTP endpoint: a single `GET /` route reporting whether
//! the active application is fully up and which reconciliation phase the
//! supervisor is in.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::supervisor::Supervisor;

#[derive(Serialize)]
struct Status {
    ok: bool,
    up: bool,
    state: String,
    version: &'static str,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/", get(status))
        .with_state(supervisor)
}

async fn status(axum::extract::State(supervisor): axum::extract::State<Arc<Supervisor>>) -> Json<Status> {
    let up = match supervisor.active().await {
        Some(app) => app.is_up().await,
        None => false,
    };

    Json(Status {
        ok: true,
        up,
        state: supervisor.phase().await.to_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn serve(addr: SocketAddr, supervisor: Arc<Supervisor>) -> Result<(), std::io::Error> {
    axum::Server::bind(&addr)
        .serve(router(supervisor).into_make_service())
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
}
