mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceExt;

use forcephot_runner::dashboard::{router, DashboardState};
use forcephot_runner::scheduler::{submit_job, SlotAssigner};
use forcephot_runner::store::MemoryJobStore;
use test_harness::*;

fn create_test_app(store: Arc<MemoryJobStore>, slots: Arc<RwLock<SlotAssigner>>) -> Router {
    router(DashboardState { store, slots })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health() {
    let app = create_test_app(
        Arc::new(MemoryJobStore::new()),
        Arc::new(RwLock::new(SlotAssigner::new(8))),
    );
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_slots_endpoint_reports_leases() {
    let store = Arc::new(MemoryJobStore::new());
    let job = insert(&store, coords_job(5)).await;
    let slots = Arc::new(RwLock::new(SlotAssigner::new(8)));
    slots.write().await.assign(3, &job, Utc::now()).unwrap();

    let (status, json) = get_json(create_test_app(store, slots), "/api/slots").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 8);
    assert_eq!(json["free"], 7);
    let slot = &json["slots"][3];
    assert_eq!(slot["state"], "assigned");
    assert_eq!(slot["job_id"], job.id);
    assert_eq!(slot["user_id"], 5);
    assert_eq!(json["slots"][0]["state"], "idle");
}

#[tokio::test]
async fn test_queue_endpoint_lists_jobs_in_order() {
    let store = Arc::new(MemoryJobStore::new());
    submit_job(&*store, coords_job(1)).await.unwrap();
    submit_job(&*store, coords_job(1)).await.unwrap();
    submit_job(&*store, object_job(2, "ceres")).await.unwrap();

    let (status, json) = get_json(
        create_test_app(store, Arc::new(RwLock::new(SlotAssigner::new(8)))),
        "/api/queue",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 3);
    let users: Vec<i64> = jobs.iter().map(|j| j["user_id"].as_i64().unwrap()).collect();
    assert_eq!(users, vec![1, 2, 1]);
    assert_eq!(jobs[1]["target"], "ceres");
    assert_eq!(jobs[1]["kind"], "FP");
    assert_eq!(jobs[1]["status"], "queued");
    assert_eq!(jobs[1]["queue_position"], 1);
}

#[tokio::test]
async fn test_job_endpoint() {
    let store = Arc::new(MemoryJobStore::new());
    let job = insert(&store, coords_job(1)).await;
    let slots = Arc::new(RwLock::new(SlotAssigner::new(8)));

    let (status, json) = get_json(
        create_test_app(store.clone(), slots.clone()),
        &format!("/api/jobs/{}", job.id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], job.id);
    assert_eq!(json["target"], "RA 150 Dec 2.5");

    let (status, json) = get_json(create_test_app(store, slots), "/api/jobs/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("999"));
}
