use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use log::{debug, error, info};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::cors::CorsLayer;

use crate::{
    cache::LatestReading,
    config::HttpConfig,
    message::Reading,
    store::{ReadingRecord, ReadingStore},
};

#[derive(Clone)]
pub struct AppState {
    pub cache: LatestReading,
    pub store: Arc<dyn ReadingStore>,
    pub history_limit: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/receber", get(latest))
        .route("/historico", get(history))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn latest(State(state): State<AppState>) -> Json<Reading> {
    Json(state.cache.get().await)
}

async fn history(
    State(state): State<AppState>,
) -> Result<Json<Vec<ReadingRecord>>, (StatusCode, Json<Value>)> {
    match state.store.list_recent(state.history_limit).await {
        Ok(records) => {
            debug!("serving {} history records", records.len());
            Ok(Json(records))
        }
        Err(e) => {
            error!("failed to fetch history: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Erro ao buscar histórico" })),
            ))
        }
    }
}

/// Serves the read API until a termination signal arrives.
pub(crate) async fn serve(
    config: HttpConfig,
    state: AppState,
    mut termination_receiver: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.bind, config.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("http listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            termination_receiver.recv().await.ok();
        })
        .await
        .context("http server failed")?;
    info!("http server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        ingest::Pipeline,
        store::{testing::UnreachableStore, MemoryConfig, MemoryStore},
    };

    fn state(store: Arc<dyn ReadingStore>) -> AppState {
        AppState {
            cache: LatestReading::new(),
            store,
            history_limit: 50,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn latest_returns_placeholder_before_any_message() {
        let app = router(state(Arc::new(MemoryStore::new(MemoryConfig::default()))));

        let (status, body) = get_json(app, "/receber").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "id": "no data yet", "nivelLixo": 0.0 }));
    }

    #[tokio::test]
    async fn latest_returns_cached_reading() {
        let state = state(Arc::new(MemoryStore::new(MemoryConfig::default())));
        state.cache.set(Reading::new("CCBLX0001", 42.0)).await;

        let (status, body) = get_json(router(state), "/receber").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "id": "CCBLX0001", "nivelLixo": 42.0 }));
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let state = state(Arc::new(MemoryStore::new(MemoryConfig::default())));
        for level in 0..60 {
            state
                .store
                .append(&Reading::new("CCBLX0002", level as f64))
                .await
                .unwrap();
        }

        let (status, body) = get_json(router(state), "/historico").await;
        assert_eq!(status, StatusCode::OK);
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 50);
        assert_eq!(records[0]["sensor_id"], "CCBLX0002");
        assert_eq!(records[0]["nivel_lixo"], 59.0);
        assert_eq!(records[49]["nivel_lixo"], 10.0);
        assert!(records[0]["data_hora"].is_string());
    }

    #[tokio::test]
    async fn storage_outage_fails_history_but_not_latest() {
        let state = state(Arc::new(UnreachableStore));
        let pipeline = Pipeline::new(state.cache.clone(), state.store.clone());
        pipeline
            .ingest(b"CCBLX0003:64")
            .await
            .unwrap()
            .await
            .unwrap();

        let app = router(state);
        let (status, body) = get_json(app.clone(), "/historico").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Erro ao buscar histórico" }));

        let (status, body) = get_json(app, "/receber").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "id": "CCBLX0003", "nivelLixo": 64.0 }));
    }
}
