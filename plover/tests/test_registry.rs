#![forbid(unsafe_code)]

use std::time::Duration;

use plover::{
    Registry, Router, Server, ServerConfig,
    registry::{DEFAULT_PATH, SERVER_HEADER, SERVERS_HEADER},
};

async fn start_registry() -> (std::sync::Arc<Registry>, String) {
    let _ = tracing_subscriber::fmt().try_init();

    let registry = Registry::new(DEFAULT_PATH);
    let addr = registry.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (registry, format!("http://{addr}{DEFAULT_PATH}"))
}

#[tokio::test]
async fn test_registry_http() {
    let (registry, url) = start_registry().await;
    let http = reqwest::Client::builder().no_proxy().build().unwrap();

    for addr in ["127.0.0.1:7002", "127.0.0.1:7001"] {
        let rsp = http
            .post(&url)
            .header(SERVER_HEADER, addr)
            .send()
            .await
            .unwrap();
        assert_eq!(rsp.status(), reqwest::StatusCode::OK);
    }

    let rsp = http.get(&url).send().await.unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        rsp.headers()[SERVERS_HEADER],
        "127.0.0.1:7001,127.0.0.1:7002"
    );

    let rsp = http.post(&url).send().await.unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::BAD_REQUEST);

    let rsp = http.put(&url).send().await.unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    let rsp = http.get(url.replace(DEFAULT_PATH, "/")).send().await.unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::NOT_FOUND);

    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_heartbeat() {
    let (registry, url) = start_registry().await;

    let server = Server::create(Router::default(), &ServerConfig::default());
    let addr = server
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
        .to_string();
    server.start_heartbeat(&url, &addr, Duration::from_millis(20));

    for _ in 0..100 {
        if registry.alive_servers() == [addr.clone()] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.alive_servers(), [addr]);

    // servers are never evicted.
    server.stop();
    server.join().await;
    assert_eq!(registry.alive_servers().len(), 1);
}

#[tokio::test]
async fn test_register_to_unreachable_registry() {
    let server = Server::create(Router::default(), &ServerConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}{DEFAULT_PATH}", listener.local_addr().unwrap());
    drop(listener);

    let err = server.register_to(&url, "127.0.0.1:1").await.unwrap_err();
    assert_eq!(err.kind, plover::ErrorKind::HttpRequestFailed);
}
