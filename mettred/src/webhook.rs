//! Receives put.io transfer callbacks.
//!
//! put.io posts a form-encoded transfer description to the callback URL
//! configured on the account. Every request is acknowledged with 204 so the
//! service never retries; only transfer events carrying a hash reach the engine.

use std::collections::HashMap;
use std::future::Future;
use std::io;

use axum::Router;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::sync::events::TransferReported;

const TRANSFER_EVENTS: [&str; 2] = ["transfer", "transferred"];

#[derive(Clone)]
struct WebhookState {
    reports: mpsc::UnboundedSender<TransferReported>,
}

/// `"putio/"` and `"/putio"` both become `"/putio"`; an empty base becomes `""`.
pub fn normalize_base_path(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

pub fn router(base_path: &str, reports: mpsc::UnboundedSender<TransferReported>) -> Router {
    let route = format!("{}/{{event}}", normalize_base_path(base_path));
    Router::new()
        .route(&route, post(receive))
        .with_state(WebhookState { reports })
}

pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "webhook server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn receive(
    State(state): State<WebhookState>,
    Path(event): Path<String>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> StatusCode {
    let fields = match form {
        Ok(Form(fields)) => fields,
        Err(err) => {
            tracing::warn!(%event, error = %err, "webhook body is not a form");
            return StatusCode::NO_CONTENT;
        }
    };
    tracing::debug!(%event, ?fields, "webhook received");

    if !TRANSFER_EVENTS.contains(&event.as_str()) {
        tracing::info!(%event, "ignoring webhook event");
        return StatusCode::NO_CONTENT;
    }
    let Some(hash) = fields.get("hash").filter(|hash| !hash.is_empty()) else {
        tracing::warn!(%event, "transfer webhook without a hash");
        return StatusCode::NO_CONTENT;
    };

    let report = TransferReported {
        hash: hash.clone(),
        remote_transfer_id: fields.get("id").and_then(|id| id.parse().ok()),
    };
    tracing::info!(
        hash = %report.hash,
        transfer_id = ?report.remote_transfer_id,
        name = fields.get("name").map(String::as_str).unwrap_or_default(),
        status = fields.get("status").map(String::as_str).unwrap_or_default(),
        "transfer reported"
    );
    if state.reports.send(report).is_err() {
        tracing::warn!("engine is gone, transfer report dropped");
    }
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn form_post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path("putio/"), "/putio");
        assert_eq!(normalize_base_path("/hooks/putio"), "/hooks/putio");
        assert_eq!(normalize_base_path("/"), "");
    }

    #[tokio::test]
    async fn transfer_event_is_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = router("/putio", tx);

        let response = app
            .oneshot(form_post(
                "/putio/transferred",
                "id=42&hash=ABCDEF&name=movie&status=COMPLETED&file_id=10",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransferReported {
                hash: "ABCDEF".into(),
                remote_transfer_id: Some(42),
            }
        );
    }

    #[tokio::test]
    async fn other_events_and_bad_bodies_are_acknowledged_and_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = router("putio", tx);

        for request in [
            form_post("/putio/file_shared", "id=1&hash=abc"),
            form_post("/putio/transfer", "id=1&name=no-hash"),
            Request::builder()
                .method("POST")
                .uri("/putio/transfer")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        ] {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn routes_only_post_under_base_path() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let app = router("/putio", tx);

        let wrong_method = Request::builder()
            .method("GET")
            .uri("/putio/transfer")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(wrong_method).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = app
            .oneshot(form_post("/elsewhere/transfer", "hash=abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
