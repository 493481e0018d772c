use std::net::SocketAddr;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::users;

#[derive(Debug, Serialize)]
struct Note {
    id: u32,
    text: &'static str,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/notes", get(notes))
        .route("/health", get(|| async { "ok" }))
        .merge(users::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        if status.is_server_error() {
                            tracing::error!(%status, ?latency, "response");
                        } else {
                            tracing::info!(%status, ?latency, "response");
                        }
                    },
                ),
        )
}

async fn hello() -> &'static str {
    "Hello World!"
}

async fn notes() -> Json<Vec<Note>> {
    Json(vec![
        Note { id: 1, text: "Note 1" },
        Note { id: 2, text: "Note 2" },
    ])
}

pub async fn serve(app: Router, addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_text(uri: &str) -> (StatusCode, String) {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn root_says_hello() {
        let (status, body) = get_text("/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello World!");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = get_text("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn notes_are_listed() {
        let (status, body) = get_text("/notes").await;
        assert_eq!(status, StatusCode::OK);
        let notes: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(notes[1]["text"], "Note 2");
    }

    #[tokio::test]
    async fn users_are_mounted() {
        let (status, body) = get_text("/users/count").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"count":0}"#);
    }
}
