mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub use self::state::*;

/// Upload limit per request: 10 MiB.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/recognize", post(api::recognize_handler))
        .route("/batch-recognize", post(api::batch_recognize_handler))
        .route("/cache", post(api::cache_handler))
        .route("/encodings/regenerate", post(api::regenerate_handler))
        .route("/health", get(api::health_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use facecheck_core::types::ENCODING_DIM;
    use facecheck_core::{Config, Encoding, EncodingStore, RecognitionService, SqliteStore};
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "facecheck-test-boundary";

    fn png(seed: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(40, 40, |x, y| Rgb([((x * seed) % 256) as u8, ((y * 7) % 256) as u8, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    /// (field name, filename, content); a `None` filename makes a text field.
    fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Body {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(f) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn form_request(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(body)
            .unwrap()
    }

    fn json_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn app() -> (Router, Arc<SqliteStore>) {
        let config = Config {
            workers: 1,
            ..Config::default()
        };
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = RecognitionService::with_sqlite(&config, Arc::clone(&store)).unwrap();
        (create_app(AppState::new(service)), store)
    }

    #[tokio::test]
    async fn test_recognize_requires_image() {
        let (app, _) = app();
        let (status, body) = send(&app, form_request("/recognize", multipart(&[("serviceId", None, b"3")]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Image file is required");
    }

    #[tokio::test]
    async fn test_recognize_empty_gallery() {
        let (app, _) = app();
        let image = png(3);
        let (status, body) = send(&app, form_request("/recognize", multipart(&[("image", Some("a.png"), &image)]))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_recognize_bad_image_with_empty_gallery() {
        let (app, _) = app();
        let (status, body) = send(&app, form_request("/recognize", multipart(&[("image", Some("a.jpg"), b"garbage")]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid image"));
    }

    #[tokio::test]
    async fn test_recognize_and_check_in() {
        let (app, store) = app();
        let person = store.add_person("Ada").unwrap();
        store.add_record(person, &[png(3)]).unwrap();
        let (status, body) = send(&app, json_request("/encodings/regenerate", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success_count"], 1);

        let image = png(3);
        let (status, body) = send(
            &app,
            form_request("/recognize", multipart(&[("image", Some("a.png"), &image), ("serviceId", None, b"12")])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["match"]["display_name"], "Ada");
        assert_eq!(store.list_attendance(Some(person)).unwrap()[0].service_id, Some(12));
    }

    #[tokio::test]
    async fn test_recognize_bad_image() {
        let (app, store) = app();
        let person = store.add_person("Ada").unwrap();
        let record = store.add_record(person, &[vec![0]]).unwrap();
        store
            .save_encoding(record, &Encoding::new(vec![0.1; ENCODING_DIM]).unwrap().to_bytes())
            .unwrap();

        let (status, body) = send(&app, form_request("/recognize", multipart(&[("image", Some("a.png"), b"nope")]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_service_id() {
        let (app, _) = app();
        let image = png(3);
        let (status, _) = send(
            &app,
            form_request("/recognize", multipart(&[("serviceId", None, b"abc"), ("image", Some("a.png"), &image)])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_requires_images() {
        let (app, _) = app();
        let (status, body) = send(&app, form_request("/batch-recognize", multipart(&[]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No images provided");
    }

    #[tokio::test]
    async fn test_batch_recognize() {
        let (app, store) = app();
        let person = store.add_person("Ada").unwrap();
        store.add_record(person, &[png(5)]).unwrap();
        send(&app, json_request("/encodings/regenerate", "{}")).await;

        let good = png(5);
        let (status, body) = send(
            &app,
            form_request(
                "/batch-recognize",
                multipart(&[("images", Some("a.png"), &good), ("images", Some("b.png"), b"junk")]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_images"], 2);
        assert_eq!(body["processed"], 1);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["results"][0]["filename"], "a.png");
        assert_eq!(body["results"][1]["success"], false);
    }

    #[tokio::test]
    async fn test_cache_actions() {
        let (app, store) = app();
        let person = store.add_person("Ada").unwrap();
        let record = store.add_record(person, &[vec![0]]).unwrap();
        store
            .save_encoding(record, &Encoding::new(vec![0.2; ENCODING_DIM]).unwrap().to_bytes())
            .unwrap();

        let (status, body) = send(&app, json_request("/cache", r#"{"action":"clear"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("cleared"));

        let (status, body) = send(&app, json_request("/cache", r#"{"action":"reload"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["encodings_loaded"], 1);

        let (status, body) = send(&app, json_request("/cache", r#"{"action":"flush"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["strategy"], "fallback");
        assert_eq!(body["workers"], 1);
        assert_eq!(body["cached_encodings"], 0);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let (app, _) = app();
        let oversized = vec![0u8; MAX_BODY_BYTES + 1];
        let req = Request::builder()
            .method("POST")
            .uri("/recognize")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .header(header::CONTENT_LENGTH, oversized.len())
            .body(Body::from(oversized))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
