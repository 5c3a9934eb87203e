//! Single reconcile passes against a real HTTP discovery backend

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;

use apiservice_availability::controller::{Reason, ReconcileOutcome};
use apiservice_availability::Error;

use super::helpers::*;

const NAME: &str = "v1.remote.group";

fn fixed_status(status: StatusCode) -> Router {
    Router::new().route("/apis", get(move || async move { status }))
}

/// Story: a healthy aggregated server is marked available exactly once
///
/// The first pass writes True/Passed. Once that write comes back through the
/// watch, further passes find nothing to change and stay off the API server.
#[tokio::test]
async fn story_healthy_backend_is_marked_available_once() {
    let backend = serve(fixed_status(StatusCode::OK)).await;
    let mut stores = Stores::with_backend();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let ctx = context(stores.state(), backend, status.clone(), test_config());

    let outcome = ctx.reconcile(NAME).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated { available: true });

    let written = status.last().unwrap();
    let condition = condition_of(&written);
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason.as_deref(), Some("Passed"));
    assert_eq!(condition.message.as_deref(), Some("all checks passed"));
    assert!(condition.last_transition_time.is_some());
    assert_eq!(ctx.gauge.value(NAME), Some(0));

    // The watch delivers our own write back
    stores.put_api_service(written);

    let outcome = ctx.reconcile(NAME).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Unchanged { available: true });
    assert_eq!(status.count(), 1);
}

/// Story: the aggregated server answers 403
///
/// The failure is persisted first, then surfaced as a probe error so the
/// worker retries with backoff.
#[tokio::test]
async fn story_forbidden_backend_is_unavailable_and_retried() {
    let backend = serve(fixed_status(StatusCode::FORBIDDEN)).await;
    let mut stores = Stores::with_backend();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let ctx = context(stores.state(), backend, status.clone(), test_config());

    let err = ctx.reconcile(NAME).await.unwrap_err();
    assert!(matches!(err, Error::Probe(_)), "got {:?}", err);

    let condition = condition_of(&status.last().unwrap());
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason.as_deref(), Some("FailedDiscoveryCheck"));
    let message = condition.message.unwrap();
    assert!(message.starts_with("failing or missing response from"));
    assert!(message.contains("403"));
    assert_eq!(ctx.gauge.value(NAME), Some(1));
}

/// Story: the discovery path redirects somewhere healthy
///
/// Redirects are never followed, so a 3xx counts as a failed check.
#[tokio::test]
async fn story_redirect_is_not_followed() {
    let app = Router::new()
        .route("/apis", get(|| async { Redirect::temporary("/healthy") }))
        .route("/healthy", get(|| async { StatusCode::OK }));
    let backend = serve(app).await;
    let mut stores = Stores::with_backend();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let ctx = context(stores.state(), backend, status.clone(), test_config());

    let err = ctx.reconcile(NAME).await.unwrap_err();
    assert!(matches!(err, Error::Probe(_)));
    let condition = condition_of(&status.last().unwrap());
    assert_eq!(condition.reason.as_deref(), Some("FailedDiscoveryCheck"));
    assert!(condition.message.unwrap().contains("307"));
}

/// Story: the aggregated server accepts the connection but never answers
///
/// The pass must give up after the probe timeout instead of pinning a worker.
#[tokio::test]
async fn story_hanging_backend_times_out() {
    let app = Router::new().route(
        "/apis",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            StatusCode::OK
        }),
    );
    let backend = serve(app).await;
    let mut stores = Stores::with_backend();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let mut config = test_config();
    config.probe_timeout = Duration::from_millis(200);
    let ctx = context(stores.state(), backend, status.clone(), config);

    let started = Instant::now();
    let err = ctx.reconcile(NAME).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(err, Error::Probe(_)));
    assert_eq!(
        condition_of(&status.last().unwrap()).reason.as_deref(),
        Some("FailedDiscoveryCheck")
    );
}

/// Story: an outage ends
///
/// The condition flips back to True with a fresh transition time, and the
/// gauge follows.
#[tokio::test]
async fn story_recovery_flips_condition_back() {
    let code = Arc::new(AtomicU16::new(503));
    let served = code.clone();
    let app = Router::new().route(
        "/apis",
        get(move || {
            let served = served.clone();
            async move {
                StatusCode::from_u16(served.load(Ordering::SeqCst))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }),
    );
    let backend = serve(app).await;
    let mut stores = Stores::with_backend();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let ctx = context(stores.state(), backend, status.clone(), test_config());

    assert!(ctx.reconcile(NAME).await.is_err());
    let down = status.last().unwrap();
    let down_since = condition_of(&down).last_transition_time.unwrap();
    assert_eq!(ctx.gauge.value(NAME), Some(1));
    stores.put_api_service(down);

    code.store(200, Ordering::SeqCst);
    let outcome = ctx.reconcile(NAME).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated { available: true });

    let up = condition_of(&status.last().unwrap());
    assert_eq!(up.status, "True");
    assert!(up.last_transition_time.unwrap().0 >= down_since.0);
    assert_eq!(ctx.gauge.value(NAME), Some(0));
    assert_eq!(status.count(), 2);
}

/// Story: the backing Service disappears
///
/// Cache checks fail before any request is made, so the backend never sees
/// traffic and the pass is not retried.
#[tokio::test]
async fn story_missing_service_never_reaches_backend() {
    let hits = Arc::new(AtomicU16::new(0));
    let counted = hits.clone();
    let app = Router::new().route(
        "/apis",
        get(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            async { StatusCode::OK }
        }),
    );
    let backend = serve(app).await;
    let mut stores = Stores::default();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let ctx = context(stores.state(), backend, status.clone(), test_config());

    let outcome = ctx.reconcile(NAME).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated { available: false });
    assert_eq!(
        condition_of(&status.last().unwrap()).message.as_deref(),
        Some(r#"service/bar in "foo" is not present"#)
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

/// Story: local APIServices need no backend at all
#[tokio::test]
async fn story_local_apiservice_is_available() {
    let backend = serve(fixed_status(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let mut stores = Stores::default();
    stores.put_api_service(local_api_service("v1.local.group"));

    let status = Arc::new(RecordingStatusClient::default());
    let ctx = context(stores.state(), backend, status.clone(), test_config());

    ctx.reconcile("v1.local.group").await.unwrap();
    let condition = condition_of(&status.last().unwrap());
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason.as_deref(), Some("Local"));
}

/// Story: a backend that only answers some requests
///
/// Attempts run concurrently and any success is enough: with four attempts
/// and only the fourth request answered, the check still passes.
#[tokio::test]
async fn story_one_successful_attempt_is_enough() {
    const ATTEMPTS: u16 = 4;

    let hits = Arc::new(AtomicU16::new(0));
    let counted = hits.clone();
    let app = Router::new().route(
        "/apis",
        get(move || {
            let seen = counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if seen + 1 < ATTEMPTS {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let backend = serve(app).await;
    let mut stores = Stores::with_backend();
    stores.put_api_service(remote_api_service(NAME, SERVICE));

    let status = Arc::new(RecordingStatusClient::default());
    let mut config = test_config();
    config.probe_attempts = ATTEMPTS as usize;
    let ctx = context(stores.state(), backend, status.clone(), config);

    let outcome = ctx.reconcile(NAME).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated { available: true });
    assert_eq!(
        condition_of(&status.last().unwrap()).reason.as_deref(),
        Some(Reason::Passed.as_str())
    );
    assert_eq!(hits.load(Ordering::SeqCst), ATTEMPTS);
}
