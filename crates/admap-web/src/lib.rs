//! Axum trigger surface for the sync pipeline: run it on demand, get back the
//! run-completion signal as JSON.

use std::sync::Arc;

use admap_sync::{
    load_target_registry, maybe_build_scheduler, pipeline_from_config, SyncConfig, SyncError,
    SyncPipeline, SyncTarget,
};
use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "admap-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub targets: Arc<Vec<SyncTarget>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(sync_all_handler))
        .route("/sync/{target}", post(sync_target_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ADMAP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let config = SyncConfig::from_env();
    let registry = load_target_registry(&config.targets_path).await?;
    let pipeline = Arc::new(pipeline_from_config(&config).await?);

    if let Some(scheduler) =
        maybe_build_scheduler(&config, pipeline.clone(), registry.clone()).await?
    {
        scheduler.start().await.context("starting scheduler")?;
    }

    let state = AppState {
        pipeline,
        targets: Arc::new(registry.targets),
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_all(state.targets.as_slice()).await {
        Ok(runs) => Json(json!({ "success": true, "runs": runs })).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sync_target_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let Some(target) = state.targets.iter().find(|t| t.name == name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("unknown sync target {name}") })),
        )
            .into_response();
    };
    match state.pipeline.run_once(target).await {
        Ok(run) => Json(json!({ "success": true, "runs": [run] })).into_response(),
        Err(err) => sync_error(err),
    }
}

fn sync_error(err: SyncError) -> Response {
    error!(error = %err, "sync run failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use admap_adapters::{AdSource, SourceError};
    use admap_core::{
        AdAttributes, AdLocation, DocumentShape, ListingSummary, RawAd, SearchCriteria, SortOrder,
    };
    use admap_store::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct OneAdSource;

    #[async_trait]
    impl AdSource for OneAdSource {
        async fn search(
            &self,
            _criteria: &SearchCriteria,
        ) -> Result<Vec<ListingSummary>, SourceError> {
            Ok(vec![ListingSummary {
                id: "a".to_string(),
                link: "/v-apartments/x/a".to_string(),
            }])
        }

        async fn fetch_detail(&self, _link: &str) -> Result<RawAd, SourceError> {
            Ok(RawAd {
                id: "a".to_string(),
                title: Some("Listing a".to_string()),
                date: None,
                image: None,
                images: Vec::new(),
                url: Some("https://ads.example/v/a".to_string()),
                attributes: AdAttributes {
                    price: Some(2000.0),
                    location: Some(AdLocation {
                        latitude: Some(43.64),
                        longitude: Some(-79.45),
                        map_address: None,
                    }),
                    ..Default::default()
                },
            })
        }
    }

    struct FailingSource;

    #[async_trait]
    impl AdSource for FailingSource {
        async fn search(
            &self,
            _criteria: &SearchCriteria,
        ) -> Result<Vec<ListingSummary>, SourceError> {
            Err(SourceError::Parse("listing page offline".to_string()))
        }

        async fn fetch_detail(&self, link: &str) -> Result<RawAd, SourceError> {
            Err(SourceError::Link {
                link: link.to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    fn test_state(source: Arc<dyn AdSource>) -> AppState {
        let store = Arc::new(MemoryStore::new());
        AppState {
            pipeline: Arc::new(SyncPipeline::new(store, source)),
            targets: Arc::new(vec![SyncTarget {
                name: "toronto-apartments".to_string(),
                permanent_collection: "listing-features".to_string(),
                staging_collection: "pending-listings".to_string(),
                document_shape: DocumentShape::GeoFeature,
                search: SearchCriteria {
                    location: "city-of-toronto".to_string(),
                    category: "apartments-condos".to_string(),
                    sort: SortOrder::DateDesc,
                    min_results: 20,
                },
            }]),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("body is json")
    }

    #[tokio::test]
    async fn trigger_reports_the_net_new_count() {
        let app = app(test_state(Arc::new(OneAdSource)));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["runs"][0]["net_new"], json!(1));
        assert_eq!(value["runs"][0]["target"], json!("toronto-apartments"));
    }

    #[tokio::test]
    async fn single_target_trigger_runs_only_that_target() {
        let app = app(test_state(Arc::new(OneAdSource)));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/toronto-apartments")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["runs"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn unknown_target_is_a_404() {
        let app = app(test_state(Arc::new(OneAdSource)));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/nowhere")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = body_json(response).await;
        assert_eq!(value["success"], json!(false));
    }

    #[tokio::test]
    async fn failed_run_surfaces_an_error_payload() {
        let app = app(test_state(Arc::new(FailingSource)));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = body_json(response).await;
        assert_eq!(value["success"], json!(false));
        assert!(value["error"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = app(test_state(Arc::new(OneAdSource)));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
