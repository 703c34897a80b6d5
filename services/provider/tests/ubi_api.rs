mod common;

use cp_provider::model::TaskStatus;
use reqwest::StatusCode;
use serde_json::{json, Value};

use common::{spawn_app, TestApp, NODE_ID};

fn task_body(app: &TestApp, id: u64) -> Value {
    json!({
        "id": id,
        "name": format!("task-{id}"),
        "type": 0,
        "zk_type": "fil-c2-512M",
        "input_param": "https://params/input.json",
        "resource": { "cpu": "2", "memory": "4 GiB", "storage": "10 GiB" },
        "signature": app.task_signature(id),
    })
}

#[tokio::test]
async fn health_and_info() {
    let app = spawn_app().await;

    let health = app.client.get(format!("{}/healthz", app.base_url)).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "computing-provider");

    let ready = app.client.get(format!("{}/readyz", app.base_url)).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let body: Value = ready.json().await.unwrap();
    assert_eq!(body["cluster"]["nodes"], 1);

    let info: Value = app.client.get(app.url("/cp/info")).send().await.unwrap().json().await.unwrap();
    assert_eq!(info["status"], "success");
    assert_eq!(info["data"]["node_id"], NODE_ID);
    assert_eq!(info["data"]["multi_address"], "/ip4/10.0.0.1/tcp/8085");
    assert_eq!(info["data"]["ubi_task"], 1);
}

#[tokio::test]
async fn submitted_task_runs_and_settles_on_callback() {
    let app = spawn_app().await;

    let response = app.client.post(app.url("/cp/ubi")).json(&task_body(&app, 7)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["task_id"], "7");
    assert_eq!(body["data"]["status"], "received");

    let status = app.dispatcher.units().join("7").await.unwrap().unwrap();
    assert_eq!(status, TaskStatus::Running);
    assert!(app.cluster.namespaces().contains(&"ubi-task-7".to_string()));

    let overview: Value = app.client.get(app.url("/cp")).send().await.unwrap().json().await.unwrap();
    let node = &overview["data"][0];
    assert_eq!(node["name"], "worker-1");
    assert_eq!(node["capacity"]["cpu"], 16);
    assert_eq!(node["remainder"]["cpu"], 14);
    assert_eq!(node["accelerators"]["NVIDIA-3090"]["capacity"], 2);

    let callback = json!({
        "task_id": "7",
        "task_type": "0",
        "proof": "deadbeef",
        "zk_type": "fil-c2-512M",
        "name_space": "ubi-task-7",
    });
    let response = app
        .client
        .post(app.url("/cp/docker/receive/ubi"))
        .json(&callback)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert!(body["data"].as_str().unwrap().starts_with("0x"));

    assert!(!app.cluster.namespaces().contains(&"ubi-task-7".to_string()));
    let tasks: Value = app.client.get(app.url("/cp/ubi/tasks")).send().await.unwrap().json().await.unwrap();
    assert_eq!(tasks["data"][0]["task_id"], "7");
    assert_eq!(tasks["data"][0]["status"], "success");
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let app = spawn_app().await;
    let mut body = task_body(&app, 8);
    body["signature"] = json!(app.task_signature(9));

    let response = app.client.post(app.url("/cp/ubi")).json(&body).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "signature_invalid");
    assert!(app.dispatcher.store().task("8").unwrap().is_none());
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(app.url("/cp/ubi"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_json");

    let mut body = task_body(&app, 10);
    body["type"] = json!(3);
    let response = app.client.post(app.url("/cp/ubi")).json(&body).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "validation_failed");
}

#[tokio::test]
async fn failed_tasks_hidden_unless_requested() {
    let app = spawn_app().await;

    // A callback for an unknown task that cannot be parsed still records a failure.
    let response = app
        .client
        .post(app.url("/cp/docker/receive/ubi"))
        .json(&json!({ "task_id": "11", "task_type": "x", "zk_type": "fil-c2-512M", "proof": "p" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let hidden: Value = app.client.get(app.url("/cp/ubi/tasks")).send().await.unwrap().json().await.unwrap();
    assert_eq!(hidden["data"].as_array().unwrap().len(), 0);

    let shown: Value = app
        .client
        .get(app.url("/cp/ubi/tasks?show_failed=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(shown["data"][0]["task_id"], "11");
    assert_eq!(shown["data"][0]["status"], "failed");
}

#[tokio::test]
async fn proof_job_returns_logs() {
    let app = spawn_app().await;
    app.cluster.complete_jobs_with("nonce=42");

    let response = app
        .client
        .post(app.url("/cp/proof"))
        .json(&json!({ "method": "mine", "block_data": "0xabc", "exp": 10 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"], "nonce=42");

    let response = app
        .client
        .post(app.url("/cp/proof"))
        .json(&json!({ "method": "mine", "block_data": "0xabc", "exp": 251 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["detail"], "exp range is [0~250]");
}
