use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::{engine::Engine, handlers};

pub fn app_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health/live", get(handlers::health_live))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&engine),
            handlers::track_api_metrics,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vigil_alert::LogSink;

    use super::*;
    use crate::config::ServerConfig;

    fn test_engine() -> Arc<Engine> {
        Arc::new(Engine::build(&ServerConfig::default(), Vec::new(), Arc::new(LogSink)).unwrap())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition_text() {
        let engine = test_engine();
        let handle = engine
            .registry()
            .register_counter("requests_total", "Requests served", &["status"])
            .unwrap();
        for _ in 0..5 {
            engine.registry().increment(&handle, &["200"], 1.0).unwrap();
        }
        for _ in 0..2 {
            engine.registry().increment(&handle, &["500"], 1.0).unwrap();
        }

        let response = app_router(engine).oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );

        let body = body_text(response).await;
        let ok = body.find("requests_total{status=\"200\"} 5\n").unwrap();
        let failed = body.find("requests_total{status=\"500\"} 2\n").unwrap();
        assert!(ok < failed);
    }

    #[tokio::test]
    async fn liveness_endpoint_answers_ok() {
        let response = app_router(test_engine())
            .oneshot(get_request("/health/live"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn requests_are_counted_by_the_middleware() {
        let engine = test_engine();
        let app = app_router(Arc::clone(&engine));

        app.clone().oneshot(get_request("/health/live")).await.unwrap();
        let body = body_text(app.oneshot(get_request("/metrics")).await.unwrap()).await;

        assert!(body.contains("vigil_http_requests_total{method=\"GET\",status=\"200\"} 1\n"));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let response = app_router(test_engine())
            .oneshot(get_request("/api/v1/query"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
