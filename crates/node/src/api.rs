//! Gateway HTTP API.
//!
//! The JSON surface client binaries talk to. Every response is an
//! envelope `{Code, Message, Data}` with `Code` drawn from the error
//! taxonomy (0 = success).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info};

use sao_common::{Error, Result};
use sao_proto::model::Model;
use sao_proto::proposal::{
    MetadataProposal, OrderRenewProposal, OrderStoreProposal, OrderTerminateProposal,
    PermissionProposal,
};

use crate::model::ModelManager;
use crate::state::OrderState;
use crate::storage::StorageService;

pub struct AppState {
    pub model: Arc<ModelManager>,
    pub storage: Arc<StorageService>,
    /// multiaddr clients should name as `gateway` in signed queries
    pub peer_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiResponse<T> {
    pub code: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(ApiResponse { code: 0, message: String::new(), data: Some(data) })
    }

    fn err(e: Error) -> Json<Self> {
        Json(ApiResponse { code: e.code(), message: e.to_string(), data: None })
    }

    fn from(result: Result<T>) -> Json<Self> {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                error!("api request failed: {}", e);
                Self::err(e)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateModelRequest {
    pub query: MetadataProposal,
    pub proposal: OrderStoreProposal,
    pub order_id: u64,
    /// base64 content bytes
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateModelRequest {
    pub query: MetadataProposal,
    pub proposal: OrderStoreProposal,
    pub order_id: u64,
    /// base64 JSON-Patch document
    pub patch: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RenewModelRequest {
    pub proposal: OrderRenewProposal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelStatus {
    pub data_id: String,
    pub order_id: u64,
    pub state: String,
    pub expire_height: u64,
    pub latest_height: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    pub address: String,
    pub peer_address: String,
    pub latest_height: i64,
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value.as_bytes())
        .map_err(|e| Error::InvalidParameters(format!("{}: {}", field, e)))
}

async fn create_model(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateModelRequest>,
) -> Json<ApiResponse<Model>> {
    let content = match decode_b64("content", &req.content) {
        Ok(c) => c,
        Err(e) => return ApiResponse::err(e),
    };
    ApiResponse::from(st.model.create(&req.query, &req.proposal, req.order_id, content).await)
}

async fn load_model(
    State(st): State<Arc<AppState>>,
    Json(req): Json<MetadataProposal>,
) -> Json<ApiResponse<Model>> {
    ApiResponse::from(st.model.load(&req).await)
}

async fn update_model(
    State(st): State<Arc<AppState>>,
    Json(req): Json<UpdateModelRequest>,
) -> Json<ApiResponse<Model>> {
    let patch = match decode_b64("patch", &req.patch) {
        Ok(p) => p,
        Err(e) => return ApiResponse::err(e),
    };
    ApiResponse::from(st.model.update(&req.query, &req.proposal, req.order_id, patch).await)
}

async fn delete_model(
    State(st): State<Arc<AppState>>,
    Json(req): Json<OrderTerminateProposal>,
) -> Json<ApiResponse<Model>> {
    ApiResponse::from(st.model.delete(&req).await)
}

async fn model_commits(
    State(st): State<Arc<AppState>>,
    Json(req): Json<MetadataProposal>,
) -> Json<ApiResponse<Model>> {
    ApiResponse::from(st.model.show_commits(&req).await)
}

async fn renew_models(
    State(st): State<Arc<AppState>>,
    Json(req): Json<RenewModelRequest>,
) -> Json<ApiResponse<std::collections::HashMap<String, String>>> {
    let gateway = st.model.gateway().clone();
    let result = async {
        let (_, results) = gateway.renew(&req.proposal).await?;
        // the chain granted these renewals; now push each to completion
        let mut granted = std::collections::HashMap::new();
        for (data_id, result) in &results {
            if let Some(order_id) = result.strip_prefix("SUCCESS=") {
                if let Ok(order_id) = order_id.parse::<u64>() {
                    granted.insert(data_id.clone(), order_id);
                }
            }
        }
        gateway.renew_models(req.proposal.proposal.timeout, granted).await?;
        Ok(results)
    }
    .await;
    ApiResponse::from(result)
}

async fn update_permission(
    State(st): State<Arc<AppState>>,
    Json(req): Json<PermissionProposal>,
) -> Json<ApiResponse<String>> {
    ApiResponse::from(st.model.gateway().update_permission(&req).await)
}

async fn model_status(
    State(st): State<Arc<AppState>>,
    Path(data_id): Path<String>,
) -> Json<ApiResponse<ModelStatus>> {
    let gateway = st.model.gateway();
    let result = async {
        let meta = gateway.get_meta(&data_id).await?;
        let order = gateway.get_order(meta.order_id).await?;
        let latest = gateway.last_height().await?;
        let state = match gateway.order_status(&data_id) {
            Ok(info) => info.state,
            Err(_) => OrderState::Complete,
        };
        Ok(ModelStatus {
            data_id,
            order_id: order.id,
            state: state.to_string(),
            expire_height: order.expire,
            latest_height: latest,
        })
    }
    .await;
    ApiResponse::from(result)
}

async fn model_meta(
    State(st): State<Arc<AppState>>,
    Path(data_id): Path<String>,
) -> Json<ApiResponse<sao_chain::Metadata>> {
    ApiResponse::from(st.model.gateway().get_meta(&data_id).await)
}

async fn order_info(
    State(st): State<Arc<AppState>>,
    Path(order_id): Path<u64>,
) -> Json<ApiResponse<sao_chain::Order>> {
    ApiResponse::from(st.model.gateway().get_order(order_id).await)
}

async fn node_status(State(st): State<Arc<AppState>>) -> Json<ApiResponse<NodeStatus>> {
    let gateway = st.model.gateway();
    let result = async {
        Ok(NodeStatus {
            address: st.storage.node_address().to_string(),
            peer_address: st.peer_address.clone(),
            latest_height: gateway.last_height().await?,
        })
    }
    .await;
    ApiResponse::from(result)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/model/create", post(create_model))
        .route("/api/v1/model/load", post(load_model))
        .route("/api/v1/model/update", post(update_model))
        .route("/api/v1/model/delete", post(delete_model))
        .route("/api/v1/model/commits", post(model_commits))
        .route("/api/v1/model/renew", post(renew_models))
        .route("/api/v1/model/update-permission", post(update_permission))
        .route("/api/v1/model/:data_id/status", get(model_status))
        .route("/api/v1/model/:data_id/meta", get(model_meta))
        .route("/api/v1/order/:order_id", get(order_info))
        .route("/api/v1/status", get(node_status))
        .with_state(state)
}

pub async fn run_api_server(addr: SocketAddr, state: Arc<AppState>, shutdown: Arc<Notify>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::CreateClientFailed(format!("bind api {}: {}", addr, e)))?;
    info!(%addr, "gateway api listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            info!("gateway api shutting down");
        })
        .await
        .map_err(|e| Error::CreateClientFailed(format!("api server: {}", e)))
}
