use super::protocol::{ENDPOINT_NODES, ENDPOINT_SEARCH, NodeSummary, SearchParams, SearchResponse};
use super::registry::ClusterHandle;
use super::types::SearchOutcome;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Form, Json, Router};

pub fn router(cluster: ClusterHandle) -> Router {
    Router::new()
        .route(ENDPOINT_SEARCH, get(handle_search).post(handle_search_form))
        .route(ENDPOINT_NODES, get(handle_nodes))
        .layer(Extension(cluster))
}

pub async fn handle_search(
    Extension(cluster): Extension<ClusterHandle>,
    Query(params): Query<SearchParams>,
) -> (StatusCode, Json<SearchResponse>) {
    run_search(&cluster, params.query).await
}

/// POST variant: the query may come from the URL or from a form body.
pub async fn handle_search_form(
    Extension(cluster): Extension<ClusterHandle>,
    Query(params): Query<SearchParams>,
    form: Option<Form<SearchParams>>,
) -> (StatusCode, Json<SearchResponse>) {
    let query = form
        .map(|Form(body)| body.query)
        .filter(|query| !query.is_empty())
        .unwrap_or(params.query);
    run_search(&cluster, query).await
}

async fn run_search(cluster: &ClusterHandle, query: String) -> (StatusCode, Json<SearchResponse>) {
    match cluster.search(query).await {
        Ok(SearchOutcome::Found(worker)) => (
            StatusCode::OK,
            Json(SearchResponse {
                result: 1,
                node: worker.to_string(),
            }),
        ),
        Ok(SearchOutcome::NotFound) => (StatusCode::OK, Json(not_found())),
        Err(e) => {
            tracing::error!("Search failed: {:#}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(not_found()))
        }
    }
}

fn not_found() -> SearchResponse {
    SearchResponse {
        result: 0,
        node: "0".to_string(),
    }
}

pub async fn handle_nodes(
    Extension(cluster): Extension<ClusterHandle>,
) -> (StatusCode, Json<Vec<NodeSummary>>) {
    match cluster.nodes().await {
        Ok(nodes) => (StatusCode::OK, Json(nodes)),
        Err(e) => {
            tracing::error!("Failed to list nodes: {:#}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(Vec::new()))
        }
    }
}
