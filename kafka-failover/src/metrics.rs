use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router exposing the run metrics and a liveness check.
/// Installs the global recorder, so it may only be called once per process.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    Ok(metrics_router(setup_metrics_recorder()?))
}

pub fn metrics_router(recorder_handle: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .route("/_liveness", get(|| std::future::ready("ok")))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Iteration latency is bounded by the ack timeout plus one consumer poll
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn liveness_answers_ok() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let (status, body) = get_body(metrics_router(recorder.handle()), "/_liveness").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_renders_only_run_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("iterations").increment(3);
        });
        let router = metrics_router(handle);

        // Requests served earlier must not show up as HTTP metrics
        get_body(router.clone(), "/_liveness").await;
        let (status, body) = get_body(router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("iterations 3"));
        assert!(!body.contains("http_requests_total"));
    }
}
