//! 针对本地 HTTP 服务的探测测试

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use n8n_host_agent::domain::health::{AcceptedStatuses, ProbeSettings};
use n8n_host_agent::infra::HttpProbe;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn settings(url: String, attempts: u32) -> ProbeSettings {
    ProbeSettings {
        url,
        max_attempts: attempts,
        interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(2),
        accepted: AcceptedStatuses::default(),
    }
}

#[tokio::test]
async fn redirect_to_login_counts_as_up_without_following() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new()
        .route(
            "/",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/signin")]).into_response() }),
        )
        .route(
            "/signin",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { StatusCode::OK }
            }),
        );
    let base = serve(router).await;

    let report = HttpProbe::new()
        .wait_until_healthy(&settings(format!("{}/", base), 3), &CancellationToken::new())
        .await;

    assert!(report.healthy);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.last_status, Some(302));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn basic_auth_challenge_counts_as_up() {
    let base = serve(Router::new().route("/", get(|| async { StatusCode::UNAUTHORIZED }))).await;

    let report = HttpProbe::new()
        .wait_until_healthy(&settings(base, 1), &CancellationToken::new())
        .await;

    assert!(report.healthy);
    assert_eq!(report.last_status, Some(401));
}

#[tokio::test]
async fn server_errors_exhaust_attempts() {
    let base = serve(Router::new().route("/", get(|| async { StatusCode::BAD_GATEWAY }))).await;

    let report = HttpProbe::new()
        .wait_until_healthy(&settings(base, 3), &CancellationToken::new())
        .await;

    assert!(!report.healthy);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.last_status, Some(502));
    assert!(report.last_error.is_none());
    assert!(report.summary().contains("DOWN (HTTP 502"));
}

#[tokio::test]
async fn recovers_after_startup_errors() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/",
        get(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let base = serve(router).await;

    let report = HttpProbe::new()
        .wait_until_healthy(&settings(base, 10), &CancellationToken::new())
        .await;

    assert!(report.healthy);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.last_status, Some(200));
}

#[tokio::test]
async fn custom_accepted_set_rejects_redirects() {
    let base = serve(Router::new().route("/", get(|| async { StatusCode::FOUND }))).await;
    let mut s = settings(base, 1);
    s.accepted = AcceptedStatuses::parse("200");

    let report = HttpProbe::new()
        .wait_until_healthy(&s, &CancellationToken::new())
        .await;

    assert!(!report.healthy);
    assert_eq!(report.last_status, Some(302));
}
