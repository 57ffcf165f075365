//! HTTP server that lets the local forger and operators drive the node.

use std::net::SocketAddr;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router, Server,
};
use log::{error, info};
use serde_json::json;
use txpool::Block;

use crate::{error::Error, node::Node};

mod dto;

pub use dto::*;

pub async fn run(addr: SocketAddr, node: Node) {
    let router = new_router(node);

    let server = match Server::try_bind(&addr) {
        Ok(server) => server,
        Err(err) => {
            error!("❌ Failed to bind http server on {addr}: {err}");
            return;
        }
    };

    info!("📣 HTTP server listening on {addr}");
    if let Err(err) = server.serve(router.into_make_service()).await {
        error!("❌ HTTP server stopped: {err}");
    }
}

pub fn new_router(node: Node) -> Router {
    Router::new()
        .route("/network/status", get(network_status))
        .route("/transactions", post(post_transactions))
        .route("/transactions/processable", get(processable_transactions))
        .route("/blocks/new", post(new_block))
        .route("/blocks/deleted", post(deleted_block))
        .route("/rounds/rollback", post(round_rollback))
        .route("/txpool/status", get(txpool_status))
        .fallback(not_found)
        .layer(Extension(node))
}

async fn network_status(Extension(node): Extension<Node>) -> impl IntoResponse {
    info!("📣 >> [HTTP] network_status");
    Json(node.network_status())
}

async fn post_transactions(
    Extension(node): Extension<Node>,
    Json(req): Json<TransactionsReq>,
) -> Result<impl IntoResponse, HttpError> {
    info!("📣 >> [HTTP] post_transactions: {} transactions", req.transactions.len());
    let added = node.submit_transactions(req.transactions)?;
    info!("📣 << [HTTP] post_transactions added: {added}");

    Ok(Json(json!({ "success": true, "added": added })))
}

async fn processable_transactions(
    Extension(node): Extension<Node>,
    Query(params): Query<ProcessableReq>,
) -> impl IntoResponse {
    info!("📣 >> [HTTP] processable_transactions by: {:?}", params);
    let transactions = node.get_processable_transactions(params.limit);
    info!("📣 << [HTTP] processable_transactions: {}", transactions.len());

    Json(TransactionsResp { transactions })
}

async fn new_block(Extension(node): Extension<Node>, Json(block): Json<Block>) -> impl IntoResponse {
    info!("📣 >> [HTTP] new_block at height {}", block.height);
    node.on_new_block(block).await;

    Json(json!({ "success": true }))
}

async fn deleted_block(
    Extension(node): Extension<Node>,
    Json(block): Json<Block>,
) -> impl IntoResponse {
    info!("📣 >> [HTTP] deleted_block at height {}", block.height);
    node.on_delete_block(block).await;

    Json(json!({ "success": true }))
}

async fn round_rollback(
    Extension(node): Extension<Node>,
    Json(req): Json<RoundRollbackReq>,
) -> impl IntoResponse {
    info!("📣 >> [HTTP] round_rollback: {:?}", req.delegates);
    node.on_round_rollback(&req.delegates);

    Json(json!({ "success": true }))
}

async fn txpool_status(Extension(node): Extension<Node>) -> impl IntoResponse {
    info!("📣 >> [HTTP] txpool_status");
    Json(node.txpool_status())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

#[derive(thiserror::Error, Debug)]
enum HttpError {
    #[error("Bad request: {0}")]
    BadRequest(Error),
    #[error("Internal server error: {0}")]
    InternalServerError(Error),
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        match err {
            Error::BadRequest(..) | Error::InvalidTransaction(..) => HttpError::BadRequest(err),
            _ => HttpError::InternalServerError(err),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));

        (status, body).into_response()
    }
}
