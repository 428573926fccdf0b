//! The configuration publisher: the local HTTP endpoint workers poll for
//! table updates.

use crate::config::Listener;
use crate::metrics_defs::PUBLISHER_REQUESTS;
use crate::store::TableStore;
use axum::{
    Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use shared::counter;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn router(store: Arc<TableStore>) -> Router {
    Router::new()
        .route("/configuration/backends", get(backends))
        .route("/configuration/servers", get(servers))
        .route("/configuration/raw-last-synced", get(raw_last_synced))
        .route("/health", get(|| async { "ok\n" }))
        .route("/ready", get(ready))
        .with_state(store)
}

async fn ready(State(store): State<Arc<TableStore>>) -> Response {
    if store.is_ready() {
        "ok\n".into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

pub async fn serve(listener: Listener, store: Arc<TableStore>) -> Result<(), PublisherError> {
    let app = router(store);
    let bound = TcpListener::bind(format!("{}:{}", listener.host, listener.port)).await?;
    tracing::info!(addr = %bound.local_addr()?, "configuration publisher listening");
    axum::serve(bound, app).await?;
    Ok(())
}

#[derive(Deserialize)]
struct BackendsQuery {
    /// Presence alone selects the stamp-only response used for cheap
    /// change detection.
    raw_last_synced_at: Option<String>,
}

fn json_response<T: serde::Serialize>(table: &T) -> Response {
    // The only 5xx this service produces: the table failed to serialize.
    match serde_json::to_string(table) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "could not serialize configuration table");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn backends(
    State(store): State<Arc<TableStore>>,
    Query(query): Query<BackendsQuery>,
) -> Response {
    let published = store.snapshot();
    if query.raw_last_synced_at.is_some() {
        counter!(PUBLISHER_REQUESTS, "endpoint" => "raw-last-synced").increment(1);
        return published.raw_last_synced.to_string().into_response();
    }
    counter!(PUBLISHER_REQUESTS, "endpoint" => "backends").increment(1);
    json_response(published.backends.as_ref())
}

async fn servers(State(store): State<Arc<TableStore>>) -> Response {
    counter!(PUBLISHER_REQUESTS, "endpoint" => "servers").increment(1);
    json_response(store.snapshot().servers.as_ref())
}

async fn raw_last_synced(State(store): State<Arc<TableStore>>) -> Response {
    counter!(PUBLISHER_REQUESTS, "endpoint" => "raw-last-synced").increment(1);
    store.snapshot().raw_last_synced.to_string().into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Tables;
    use shared::tables::{Backend, Endpoint, Server};

    async fn spawn_publisher(store: Arc<TableStore>) -> String {
        let app = router(store);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn sample_tables() -> Tables {
        Tables {
            backends: vec![Backend {
                name: "default-old-80".into(),
                endpoints: vec![Endpoint {
                    address: "10.0.0.1".into(),
                    port: "80".into(),
                }],
                ..Default::default()
            }],
            servers: vec![Server {
                hostname: "bg50.release.com".into(),
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn serves_tables_and_stamp() {
        let store = Arc::new(TableStore::new());
        store.publish(sample_tables());
        let base = spawn_publisher(store.clone()).await;

        let backends: Vec<Backend> = reqwest::get(format!("{base}/configuration/backends"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(backends[0].name, "default-old-80");

        let servers: Vec<Server> = reqwest::get(format!("{base}/configuration/servers"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(servers[0].hostname, "bg50.release.com");

        let stamp = reqwest::get(format!("{base}/configuration/raw-last-synced"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(stamp, "1");

        // The query-flag form returns the stamp from the backends route.
        let stamp = reqwest::get(format!("{base}/configuration/backends?raw_last_synced_at"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(stamp, "1");
    }

    #[tokio::test]
    async fn empty_tables_are_legal() {
        let store = Arc::new(TableStore::new());
        let base = spawn_publisher(store).await;

        let response = reqwest::get(format!("{base}/configuration/backends"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn readiness_follows_the_first_publish() {
        let store = Arc::new(TableStore::new());
        let base = spawn_publisher(store.clone()).await;

        let response = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(response.status(), 503);

        store.publish(sample_tables());
        let response = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}
