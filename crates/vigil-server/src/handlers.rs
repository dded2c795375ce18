use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use vigil_metrics::exporter::CONTENT_TYPE;

use crate::engine::Engine;

pub async fn metrics(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let mut response = Response::new(Body::from(engine.scrape()));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    response
}

pub async fn health_live() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn track_api_metrics(
    State(engine): State<Arc<Engine>>,
    request: Request,
    next: Next,
) -> Response {
    let started_at = Instant::now();
    let method = request.method().as_str().to_string();

    let response = next.run(request).await;
    engine
        .http_metrics()
        .record_request(&method, response.status().as_u16(), started_at.elapsed());

    response
}
