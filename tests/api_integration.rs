//! REST API tests: real server on an ephemeral port, real git fixtures

use appdock::api::ApiServer;
use appdock::config::AppDefaults;
use appdock::estate::AppEstate;
use appdock::routing::RoutingTable;
use appdock::runner::RunnerRegistry;
use appdock::sandbox::FileSandbox;
use appdock::store::FileRepoLoader;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::watch;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git must be installed for these tests");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_origin(dir: &Path, files: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.email", "dev@example.com"]);
    git(dir, &["config", "user.name", "Dev Eloper"]);
    for (name, contents) in files {
        std::fs::write(dir.join(name), contents).unwrap();
    }
    git(dir, &["add", "."]);
    git(dir, &["-c", "commit.gpgsign=false", "commit", "-m", "first commit"]);
}

fn test_defaults() -> AppDefaults {
    let mut defaults = AppDefaults::default();
    defaults.daemon_grace_secs = 1;
    defaults.startup_timeout_secs = 5;
    defaults.shutdown_grace_secs = 2;
    defaults
}

async fn spawn_api(root: &Path) -> (SocketAddr, watch::Sender<bool>) {
    let sandbox = FileSandbox::new(root).unwrap();
    let routing = Arc::new(RoutingTable::new());
    let registry = Arc::new(RunnerRegistry::with_defaults(test_defaults()));
    let loader = Arc::new(FileRepoLoader::new(sandbox.registry_file()));
    let estate = Arc::new(AppEstate::new(
        routing,
        registry,
        sandbox,
        loader,
        test_defaults(),
    ));

    let (tx, rx) = watch::channel(false);
    let api = Arc::new(
        ApiServer::bind("127.0.0.1:0".parse().unwrap(), estate, 8080, rx)
            .await
            .unwrap(),
    );
    let addr = api.local_addr();
    tokio::spawn(api.run());
    (addr, tx)
}

#[tokio::test]
async fn app_lifecycle_over_the_rest_api() {
    let tmp = tempfile::tempdir().unwrap();
    let origin = tmp.path().join("origin");
    init_origin(&origin, &[("package.json", "{}\n")]);
    let git_url = origin.to_string_lossy().to_string();

    let (addr, _shutdown) = spawn_api(&tmp.path().join("host")).await;
    let base = format!("http://127.0.0.1:{}", addr.port());
    let client = reqwest::Client::new();

    // Empty estate
    let body: Value = client
        .get(format!("{}/apps", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["appCount"], 0);

    // Missing git URL
    let response = client
        .post(format!("{}/apps", base))
        .json(&serde_json::json!({ "appName": "web" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Register
    let response = client
        .post(format!("{}/apps", base))
        .json(&serde_json::json!({ "gitUrl": git_url, "appName": "web" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.headers().get("location").unwrap(), "/apps/web");
    let descriptor: Value = response.json().await.unwrap();
    assert_eq!(descriptor["name"], "web");
    assert_eq!(descriptor["gitUrl"], git_url.as_str());
    assert_eq!(descriptor["available"], false);
    assert_eq!(descriptor["lastBuild"]["status"], "not-built");
    assert!(descriptor["lastSuccessfulBuild"].is_null());
    assert_eq!(
        descriptor["url"].as_str().unwrap(),
        "http://127.0.0.1:8080/web/"
    );

    // Same name again is a conflict
    let response = client
        .post(format!("{}/apps", base))
        .json(&serde_json::json!({ "gitUrl": git_url, "appName": "web" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // Bad name is rejected up front
    let response = client
        .post(format!("{}/apps", base))
        .json(&serde_json::json!({ "gitUrl": git_url, "appName": "not a name" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Descriptor reads
    let response = client.get(format!("{}/apps/web", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let response = client.get(format!("{}/apps/nope", base)).send().await.unwrap();
    assert_eq!(response.status(), 404);

    // Git URL update
    let response = client
        .put(format!("{}/apps/web", base))
        .json(&serde_json::json!({ "gitUrl": git_url }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = client
        .put(format!("{}/apps/web", base))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let response = client
        .put(format!("{}/apps/nope", base))
        .json(&serde_json::json!({ "gitUrl": git_url }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Stop is 200 for known apps, 404 otherwise
    let response = client
        .put(format!("{}/apps/web/stop", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = client
        .put(format!("{}/apps/nope/stop", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Delete, then the app is gone; a second delete is a bad request
    let response = client
        .delete(format!("{}/apps/web", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = client.get(format!("{}/apps/web", base)).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let response = client
        .delete(format!("{}/apps/web", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn unsupported_projects_are_rejected_with_501() {
    let tmp = tempfile::tempdir().unwrap();
    let origin = tmp.path().join("origin");
    init_origin(&origin, &[("README.md", "docs only\n")]);

    let (addr, _shutdown) = spawn_api(&tmp.path().join("host")).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://127.0.0.1:{}/apps", addr.port()))
        .json(&serde_json::json!({ "gitUrl": origin.to_string_lossy(), "appName": "docs" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 501);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "No suitable runner found for this app");
}

#[tokio::test]
async fn deploy_returns_200_and_streams_the_log_even_when_the_build_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let origin = tmp.path().join("origin");
    init_origin(&origin, &[("package.json", "{}\n")]);

    let (addr, _shutdown) = spawn_api(&tmp.path().join("host")).await;
    let base = format!("http://127.0.0.1:{}", addr.port());
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/apps", base))
        .json(&serde_json::json!({ "gitUrl": origin.to_string_lossy(), "appName": "web" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Deploying an unknown app is the only deploy-time HTTP failure
    let response = client
        .post(format!("{}/apps/nope/deploy", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Make the fetch fail so the attempt fails fast and hermetically
    std::fs::remove_dir_all(&origin).unwrap();

    let response = client
        .post(format!("{}/apps/web/deploy", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("Fetching latest changes from git..."));
    assert!(text.contains("Could not fetch from git:"));

    // JSON mode: same 200, outcome only visible in the status fields
    let response = client
        .post(format!("{}/apps/web/deploy", base))
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let descriptor: Value = response.json().await.unwrap();
    assert_eq!(descriptor["lastBuild"]["status"], "failed");
    assert!(descriptor["lastBuild"]["description"]
        .as_str()
        .unwrap()
        .starts_with("Could not fetch from git:"));

    // The build log endpoint serves the same text
    let log = client
        .get(format!("{}/apps/web/build.log", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(log.contains("Could not fetch from git:"));
}
