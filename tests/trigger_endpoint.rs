mod common;

use std::net::SocketAddr;

use common::{TestEnvironment, TEST_SECRET};
use portfolio_sync::server::{self, AppState, TRIGGER_PATH};
use portfolio_sync::store::NewProject;
use portfolio_sync::{SyncReconciler, TokenVault, UpstreamRepo};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    fn url(&self, route: &str) -> String {
        format!("http://{}{}", self.addr, route)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start(env: &TestEnvironment, api_url: Option<&str>, cron_secret: Option<&str>) -> RunningServer {
    let config = env.config(api_url);
    let reconciler = SyncReconciler::new(env.open_store(), TokenVault::new(Some(TEST_SECRET)), &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let state = AppState {
        reconciler,
        cron_secret: cron_secret.map(str::to_string),
        shutdown: shutdown.clone(),
    };
    let handle = tokio::spawn(server::serve(listener, state));

    RunningServer {
        addr,
        shutdown,
        handle,
    }
}

fn upstream(id: u64, full_name: &str) -> UpstreamRepo {
    serde_json::from_value(common::repo_json(id, full_name)).unwrap()
}

#[tokio::test]
async fn healthz_answers_ok() {
    let env = TestEnvironment::new();
    let server = start(&env, None, Some("cron")).await;

    let body = reqwest::get(server.url("/healthz")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");

    server.stop().await;
}

#[tokio::test]
async fn missing_or_wrong_bearer_is_unauthorized() {
    let env = TestEnvironment::new();
    let server = start(&env, None, Some("cron")).await;
    let client = reqwest::Client::new();

    let missing = client.get(server.url(TRIGGER_PATH)).send().await.unwrap();
    assert_eq!(missing.status(), 401);
    assert_eq!(missing.json::<Value>().await.unwrap(), json!({ "error": "Unauthorized" }));

    let wrong = client
        .post(server.url(TRIGGER_PATH))
        .bearer_auth("not-the-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    server.stop().await;
}

#[tokio::test]
async fn unconfigured_secret_refuses_every_request() {
    let env = TestEnvironment::new();
    let server = start(&env, None, None).await;

    let response = reqwest::Client::new()
        .get(server.url(TRIGGER_PATH))
        .bearer_auth("anything")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("CRON_SECRET"));

    server.stop().await;
}

#[tokio::test]
async fn no_connection_is_a_server_error() {
    let env = TestEnvironment::new();
    let server = start(&env, None, Some("cron")).await;

    let response = reqwest::Client::new()
        .post(server.url(TRIGGER_PATH))
        .bearer_auth("cron")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("not connected"));

    server.stop().await;
}

#[tokio::test]
async fn authorized_trigger_runs_a_sync() {
    let github = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::user_json("octocat")))
        .mount(&github)
        .await;

    let mut refreshed = common::repo_json(42, "octo/kept");
    refreshed["description"] = json!("Fresh upstream description");
    Mock::given(method("GET"))
        .and(path("/repos/octo/kept"))
        .respond_with(ResponseTemplate::new(200).set_body_json(refreshed))
        .expect(1)
        .mount(&github)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "Not Found" })))
        .expect(1)
        .mount(&github)
        .await;

    let env = TestEnvironment::new();
    let store = env.open_store();
    env.connect(&store, "gho_live");
    let kept = store
        .insert_project(&NewProject::from_upstream(&upstream(42, "octo/kept"), 1))
        .unwrap();
    let gone = store
        .insert_project(&NewProject::from_upstream(&upstream(43, "octo/gone"), 2))
        .unwrap();
    store
        .insert_project(&NewProject::manual("Hand written", "Not from GitHub", 3))
        .unwrap();

    let server = start(&env, Some(&github.uri()), Some("cron")).await;
    let response = reqwest::Client::new()
        .get(server.url(TRIGGER_PATH))
        .bearer_auth("cron")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "success": true, "synced": 1, "hidden": 1 }));

    let kept = store.get_project(kept).unwrap().unwrap();
    assert_eq!(kept.description, "Fresh upstream description");
    assert!(kept.visible);
    assert!(!store.get_project(gone).unwrap().unwrap().visible);

    let connection = store.load_connection().unwrap().unwrap();
    assert!(connection.last_sync_at.is_some());
    assert_eq!(connection.sync_error, None);

    server.stop().await;
}
