//! Provider refreshes swap whole sets or nothing.

use std::sync::{Arc, Mutex};

use rule_tunnel::provider::{ProviderError, UpdateOutcome};
use rule_tunnel::EngineError;

mod common;

const DOC: &str = r#"
    rules = ["MATCH,Asia"]

    [[proxy-groups]]
    name = "Asia"
    type = "select"
    use = ["sub"]
    filter = "hk|sg"

    [proxy-providers.sub]
    type = "file"
    path = "sub.toml"
"#;

fn relays(names: &[&str]) -> String {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(
                "[[proxies]]\nname = \"{}\"\ntype = \"relay\"\nserver = \"127.0.0.1\"\nport = {}\n\n",
                name,
                1000 + i
            )
        })
        .collect()
}

#[tokio::test]
async fn failed_refresh_keeps_previous_set() {
    let home = tempfile::tempdir().unwrap();
    let path = home.path().join("sub.toml");
    std::fs::write(&path, relays(&["hk-1", "us-1", "sg-1"])).unwrap();

    let engine = common::start_engine(DOC, home.path()).await;
    let report = engine.provider("sub").unwrap();
    assert_eq!(report.proxies.len(), 3);
    assert!(report.updated_at.is_some());
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["type"], "Proxy");
    assert_eq!(json["vehicleType"], "File");

    let group = engine.proxy("Asia").unwrap();
    assert_eq!(group.all, Some(vec!["hk-1".to_string(), "sg-1".to_string()]));

    std::fs::write(&path, "[[proxies]\nname = ").unwrap();
    let err = engine.update_provider("sub").await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Parse(_))));
    assert_eq!(engine.provider("sub").unwrap().proxies.len(), 3);

    std::fs::write(&path, "proxies = []\n").unwrap();
    let err = engine.update_provider("sub").await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Empty(_))));
    assert_eq!(engine.provider("sub").unwrap().proxies.len(), 3);
    assert!(engine.provider_proxy("sub", "us-1").is_ok());

    std::fs::write(&path, relays(&["hk-1", "us-1", "sg-1"])).unwrap();
    assert_eq!(engine.update_provider("sub").await.unwrap(), UpdateOutcome::Unchanged);

    std::fs::write(&path, relays(&["hk-2", "jp-1"])).unwrap();
    assert_eq!(engine.update_provider("sub").await.unwrap(), UpdateOutcome::Updated(2));
    assert_eq!(engine.proxy("Asia").unwrap().all, Some(vec!["hk-2".to_string()]));
    assert!(matches!(
        engine.provider_proxy("sub", "us-1"),
        Err(EngineError::NotFound { kind: "proxy", .. })
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn selector_follows_provider_members() {
    let home = tempfile::tempdir().unwrap();
    std::fs::write(home.path().join("sub.toml"), relays(&["hk-1", "sg-1"])).unwrap();

    let engine = common::start_engine(DOC, home.path()).await;
    engine.select("Asia", "sg-1").unwrap();
    assert_eq!(engine.proxy("Asia").unwrap().now.as_deref(), Some("sg-1"));
    assert!(engine.select("Asia", "us-1").is_err());
    engine.shutdown().await;
}

#[tokio::test]
async fn http_provider_caches_its_body() {
    let body = Arc::new(Mutex::new(relays(&["hk-1"])));
    let server = common::start_content_server(body.clone()).await;
    let doc = format!(
        r#"
        rules = ["MATCH,Asia"]

        [[proxy-groups]]
        name = "Asia"
        type = "select"
        use = ["remote"]

        [proxy-providers.remote]
        type = "http"
        url = "http://127.0.0.1:{}/sub"
        path = "cache/remote.toml"
        "#,
        server.port()
    );
    let home = tempfile::tempdir().unwrap();

    let engine = common::start_engine(&doc, home.path()).await;
    let report = engine.provider("remote").unwrap();
    assert_eq!(report.proxies.len(), 1);
    assert_eq!(serde_json::to_value(&report).unwrap()["vehicleType"], "HTTP");
    let cached = std::fs::read_to_string(home.path().join("cache/remote.toml")).unwrap();
    assert!(cached.contains("hk-1"));

    *body.lock().unwrap() = relays(&["hk-1", "hk-2"]);
    assert_eq!(engine.update_provider("remote").await.unwrap(), UpdateOutcome::Updated(2));
    engine.shutdown().await;
    server.stop().await;

    // With the source gone the cached copy is still loaded.
    let restarted = common::start_engine(&doc, home.path()).await;
    assert_eq!(restarted.provider("remote").unwrap().proxies.len(), 2);
    assert!(matches!(
        restarted.update_provider("remote").await,
        Err(EngineError::Provider(ProviderError::Fetch { .. }))
    ));
    assert_eq!(restarted.provider("remote").unwrap().proxies.len(), 2);
    restarted.shutdown().await;
}
