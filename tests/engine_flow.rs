use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use romsource_rs::dispatch::ApiAdapter;
use romsource_rs::{
    AdapterContext, AdapterError, CancellationToken, EngineConfig, EngineEvent, ErrorKind,
    EventHandler, RegistryEntry, SourceAdapter, SourceEngine, SourceEngineError, SourceRequest,
    transport::StaticConnectivity,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_package(root: &Path, id: &str, base_url: &str, extra: &str) -> PathBuf {
    let dir = root.join("incoming").join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("source.json"),
        format!(
            r#"{{"id":"{id}","name":"{id}","version":"1.0.0","type":"api","baseUrl":"{base_url}"{extra}}}"#
        ),
    )
    .unwrap();
    std::fs::write(
        dir.join("api_config.json"),
        r#"{"endpoints":{"searchRoms":{"path":"/search"},"getPlatforms":{"path":"/platforms"}}}"#,
    )
    .unwrap();
    dir
}

fn versioned_api_package(root: &Path, id: &str, version: &str, base_url: &str, api_config: &str) -> PathBuf {
    let dir = root.join("incoming").join(format!("{id}-{version}"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("source.json"),
        format!(r#"{{"id":"{id}","name":"{id}","version":"{version}","type":"api","baseUrl":"{base_url}"}}"#),
    )
    .unwrap();
    std::fs::write(dir.join("api_config.json"), api_config).unwrap();
    dir
}

fn engine(root: &Path) -> SourceEngine {
    SourceEngine::builder()
        .with_config(
            EngineConfig::builder()
                .with_sources_dir(root.join("sources"))
                .with_max_retries(0)
                .build(),
        )
        .build()
        .unwrap()
}

#[derive(Default)]
struct Recorder {
    dispatches: Mutex<Vec<(String, bool)>>,
}

impl EventHandler for Recorder {
    fn handle(&self, event: &EngineEvent) {
        if let EngineEvent::Dispatch(dispatch) = event {
            self.dispatches
                .lock()
                .unwrap()
                .push((dispatch.source_id.clone(), dispatch.success));
        }
    }
}

#[tokio::test]
async fn search_all_collects_results_and_failures_per_source() {
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("search_key", "metroid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"slug": "super-metroid"}])))
        .mount(&healthy)
        .await;
    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&broken)
        .await;

    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let engine = SourceEngine::builder()
        .with_config(
            EngineConfig::builder()
                .with_sources_dir(root.path().join("sources"))
                .with_max_retries(0)
                .build(),
        )
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();
    engine
        .install_dir(api_package(root.path(), "alpha", &healthy.uri(), ""))
        .await
        .unwrap();
    engine
        .install_dir(api_package(root.path(), "beta", &broken.uri(), ""))
        .await
        .unwrap();

    let outcome = engine
        .search_all(&SourceRequest::search("metroid"), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].0, "alpha");
    assert_eq!(outcome.results[0].1, json!([{"slug": "super-metroid"}]));
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].0, "beta");
    assert_eq!(outcome.errors[0].1.kind(), ErrorKind::RetriesExhausted);

    let mut seen = recorder.dispatches.lock().unwrap().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![("alpha".to_string(), true), ("beta".to_string(), false)]
    );
}

#[tokio::test]
async fn selected_subset_and_disabled_sources() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/platforms"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["snes"])))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    for id in ["alpha", "beta"] {
        engine
            .install_dir(api_package(root.path(), id, &server.uri(), ""))
            .await
            .unwrap();
    }
    engine.set_enabled("beta", false).await.unwrap();
    let cancel = CancellationToken::new();

    let outcome = engine
        .search_all(&SourceRequest::GetPlatforms, None, &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].0, "alpha");

    let only_beta = ["beta".to_string()];
    let err = engine
        .search_all(&SourceRequest::GetPlatforms, Some(&only_beta[..]), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceEngineError::NoSourcesEnabled));

    let err = engine
        .dispatch("beta", &SourceRequest::GetPlatforms, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceDisabled);
}

#[tokio::test]
async fn offline_requests_never_hit_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let connectivity = Arc::new(StaticConnectivity::offline());
    let engine = SourceEngine::builder()
        .with_config(
            EngineConfig::builder()
                .with_sources_dir(root.path().join("sources"))
                .build(),
        )
        .with_connectivity_probe(connectivity.clone())
        .build()
        .unwrap();
    engine
        .install_dir(api_package(root.path(), "alpha", &server.uri(), ""))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let err = engine
        .dispatch("alpha", &SourceRequest::GetPlatforms, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoConnectivity);
    assert!(server.received_requests().await.unwrap().is_empty());

    connectivity.set_online(true);
    let value = engine
        .dispatch("alpha", &SourceRequest::GetPlatforms, &cancel)
        .await
        .unwrap();
    assert_eq!(value, json!([]));
}

#[tokio::test]
async fn base_client_injects_manifest_referer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boxart"))
        .and(header("referer", "https://vault.example/vault/42"))
        .respond_with(ResponseTemplate::new(200).set_body_string("png"))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    engine
        .install_dir(api_package(
            root.path(),
            "vault",
            &server.uri(),
            r#","imageRefererPattern":"https://vault.example/vault/{id}""#,
        ))
        .await
        .unwrap();

    let client = engine.services().get_base_http_client("vault").unwrap();
    let response = client
        .get(&format!("{}/boxart?id=42", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "png");
}

#[tokio::test]
async fn resolve_download_scans_page_for_declared_patterns() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vault/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "session=s1; Path=/")
                .set_body_raw(
                    r#"<html><body>
                        <a href="/manual.pdf">Manual</a>
                        <a href="/files/Chrono%20Trigger.sfc">Download</a>
                    </body></html>"#,
                    "text/html",
                ),
        )
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    engine
        .install_dir(api_package(
            root.path(),
            "vault",
            &server.uri(),
            r#","downloadInterceptPatterns":["*.sfc"]"#,
        ))
        .await
        .unwrap();

    let result = engine
        .resolve_download(
            "vault",
            &format!("{}/vault/42", server.uri()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert!(result.final_url.unwrap().ends_with("/files/Chrono%20Trigger.sfc"));
    assert_eq!(result.cookies.as_deref(), Some("session=s1"));
}

#[tokio::test]
async fn uninstall_removes_files_and_registry_entry() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    let report = engine
        .install_dir(api_package(root.path(), "alpha", "https://api.example", ""))
        .await
        .unwrap();
    let installed = report.entry.install_dir().to_path_buf();
    assert!(installed.join("source.json").is_file());
    drop(report);

    let removed = engine.uninstall("alpha").await.unwrap();
    assert_eq!(removed.id, "alpha");

    assert!(!installed.exists());
    assert!(engine.sources().is_empty());
    let err = engine
        .dispatch("alpha", &SourceRequest::GetRegions, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceNotFound);
}

#[tokio::test]
async fn reload_picks_up_installed_packages() {
    let root = tempfile::tempdir().unwrap();
    {
        let engine = engine(root.path());
        engine
            .install_dir(api_package(root.path(), "alpha", "https://api.example", ""))
            .await
            .unwrap();
    }

    let engine = engine(root.path());
    assert!(engine.sources().is_empty());
    let skipped = engine.load_installed().await.unwrap();

    assert!(skipped.is_empty());
    assert_eq!(engine.sources().len(), 1);
    assert_eq!(engine.source("alpha").unwrap().source.version, "1.0.0");
}

#[tokio::test]
async fn resolved_snapshot_keeps_its_endpoints_across_upgrade_and_uninstall() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/platforms"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("v1")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/platforms"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("v2")))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    engine
        .install_dir(versioned_api_package(
            root.path(),
            "rest",
            "1.0.0",
            &server.uri(),
            r#"{"endpoints":{"getPlatforms":{"path":"/v1/platforms"}}}"#,
        ))
        .await
        .unwrap();
    let v1 = engine.source("rest").unwrap();
    let v1_dir = v1.install_dir().to_path_buf();

    engine
        .install_dir(versioned_api_package(
            root.path(),
            "rest",
            "2.0.0",
            &server.uri(),
            r#"{"endpoints":{"getPlatforms":{"path":"/v2/platforms"}}}"#,
        ))
        .await
        .unwrap();

    let ctx = AdapterContext {
        services: engine.services(),
        cancel: CancellationToken::new(),
    };
    let request = SourceRequest::GetPlatforms;
    assert_eq!(ApiAdapter::new().execute(&v1, &request, &ctx).await.unwrap(), json!("v1"));
    assert_eq!(
        engine.dispatch("rest", &request, &ctx.cancel).await.unwrap(),
        json!("v2")
    );
    assert!(v1_dir.join("api_config.json").is_file());

    engine.uninstall("rest").await.unwrap();
    assert_eq!(ApiAdapter::new().execute(&v1, &request, &ctx).await.unwrap(), json!("v1"));

    drop(v1);
    assert!(!v1_dir.exists());
}

/// Java stand-in that parks until released, then reads its install dir.
#[derive(Default)]
struct Parked {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl SourceAdapter for Parked {
    fn name(&self) -> &'static str {
        "java"
    }

    async fn execute(
        &self,
        entry: &RegistryEntry,
        _request: &SourceRequest,
        _ctx: &AdapterContext,
    ) -> Result<Value, AdapterError> {
        self.started.notify_one();
        self.release.notified().await;
        let manifest = tokio::fs::read_to_string(entry.install_dir().join("source.json")).await?;
        Ok(json!({ "manifestBytes": manifest.len() }))
    }
}

#[tokio::test]
async fn uninstall_lets_running_calls_finish_before_deleting_files() {
    let root = tempfile::tempdir().unwrap();
    let parked = Arc::new(Parked::default());
    let engine = SourceEngine::builder()
        .with_config(
            EngineConfig::builder()
                .with_sources_dir(root.path().join("sources"))
                .build(),
        )
        .with_java_adapter(parked.clone())
        .build()
        .unwrap();

    let package = root.path().join("incoming/jv");
    std::fs::create_dir_all(&package).unwrap();
    std::fs::write(
        package.join("source.json"),
        r#"{"id":"jv","name":"Jv","version":"1.0","type":"java","mainClass":"dev.Source"}"#,
    )
    .unwrap();
    let installed = engine
        .install_dir(&package)
        .await
        .unwrap()
        .entry
        .install_dir()
        .to_path_buf();
    let cancel = CancellationToken::new();

    let (answer, ()) = tokio::join!(
        engine.dispatch("jv", &SourceRequest::GetPlatforms, &cancel),
        async {
            parked.started.notified().await;
            engine.uninstall("jv").await.unwrap();
            assert!(engine.source("jv").is_none());
            assert!(installed.join("source.json").is_file());
            parked.release.notify_one();
        }
    );

    assert!(answer.unwrap()["manifestBytes"].as_u64().unwrap() > 0);
    assert!(!installed.exists());
}
