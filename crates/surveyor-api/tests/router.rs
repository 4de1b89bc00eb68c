//! Router tests: exposition, health, and basic auth.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tower::ServiceExt;

use surveyor_api::{BasicAuth, build_router};
use surveyor_core::{NodeIdentity, NodeReport, SurveyScope};
use surveyor_engine::SurveyEngine;
use surveyor_metrics::{CollectorSettings, SurveyCollector};
use surveyor_transport::{LocalBus, Responder};

const SUBJECT: &str = "surveyor/req/server/ping";

async fn server(bus: &LocalBus, id: &str) -> Responder {
    let report = NodeReport::parse(
        format!(r#"{{"server": {{"id": "{id}", "name": "{id}", "cluster": "c1", "host": "127.0.0.1"}}}}"#)
            .as_bytes(),
        None,
    )
    .unwrap();
    let payload = Bytes::from(report.to_json().unwrap());
    bus.respond(SUBJECT, id, move |_| Some(payload.clone()))
        .await
        .unwrap()
}

fn collector(bus: &LocalBus) -> SurveyCollector {
    let engine = SurveyEngine::new(Arc::new(bus.clone()), SUBJECT, SurveyScope::Basic);
    SurveyCollector::new(
        engine,
        CollectorSettings {
            survey_timeout: Duration::from_millis(100),
            min_interval: Duration::ZERO,
            ..CollectorSettings::default()
        },
    )
}

fn get(uri: &str, auth: Option<(&str, &str)>) -> Request<Body> {
    let mut req = Request::builder().uri(uri);
    if let Some((user, password)) = auth {
        let token = STANDARD.encode(format!("{user}:{password}"));
        req = req.header(header::AUTHORIZATION, format!("Basic {token}"));
    }
    req.body(Body::empty()).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn metrics_endpoint_serves_exposition() {
    let bus = LocalBus::new();
    let _a = server(&bus, "A").await;
    let router = build_router(collector(&bus), None);

    let resp = router.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain; version=0.0.4"));

    let body = body_text(resp).await;
    assert!(body.contains("# TYPE nats_up gauge"));
    assert!(body.contains(
        "nats_up{nats_server_cluster=\"c1\",nats_server_host=\"127.0.0.1\",nats_server_id=\"A\"} 1"
    ));
    assert!(!body.contains("nats_core_mem_bytes"));
}

#[tokio::test]
async fn metrics_unavailable_without_transport() {
    let bus = LocalBus::new();
    bus.set_connected(false);
    let router = build_router(collector(&bus), None);

    let resp = router.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_text(resp).await.contains("not connected"));
}

#[tokio::test]
async fn healthz_is_open() {
    let bus = LocalBus::new();
    let router = build_router(collector(&bus), Some(BasicAuth::new("colin", "secret")));

    let resp = router.oneshot(get("/healthz", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "ok");
}

#[tokio::test]
async fn basic_auth_guards_metrics() {
    let bus = LocalBus::new();
    let _a = server(&bus, "A").await;
    let router = build_router(collector(&bus), Some(BasicAuth::new("colin", "secret")));

    let resp = router
        .clone()
        .oneshot(get("/metrics", Some(("colin", "secret"))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    for auth in [None, Some(("foo", "secret")), Some(("colin", "foo"))] {
        let resp = router.clone().oneshot(get("/metrics", auth)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "auth {auth:?}");
        assert_eq!(
            resp.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"surveyor\""
        );
    }
}

#[tokio::test]
async fn unknown_path_is_not_found_even_with_auth() {
    let bus = LocalBus::new();
    let router = build_router(collector(&bus), Some(BasicAuth::new("colin", "secret")));

    let resp = router.oneshot(get("/nope", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn hinted_member_exported_down() {
    let bus = LocalBus::new();
    let engine = SurveyEngine::new(Arc::new(bus.clone()), SUBJECT, SurveyScope::Basic);
    let collector = SurveyCollector::new(
        engine,
        CollectorSettings {
            survey_timeout: Duration::from_millis(50),
            expected_members: vec![NodeIdentity::new("Z", "z", "c9", "10.0.0.26")],
            ..CollectorSettings::default()
        },
    );
    let router = build_router(collector, None);

    let body = body_text(router.oneshot(get("/metrics", None)).await.unwrap()).await;
    assert!(body.contains(
        "nats_up{nats_server_cluster=\"c9\",nats_server_host=\"10.0.0.26\",nats_server_id=\"Z\"} 0"
    ));
}
