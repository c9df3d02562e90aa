use std::sync::Arc;
use std::time::Duration;

use plfm_balancer::policy::MethodRouter;
use plfm_balancer::registry::{self, HttpRegistry, Registry, RegistryError};
use plfm_balancer::BackendAddr;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn addrs(raw: &[&str]) -> Vec<BackendAddr> {
    raw.iter().map(|a| a.parse().unwrap()).collect()
}

#[tokio::test]
async fn resolves_method_backends() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/methods/helloworld.Greeter/SayHello"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "method": "helloworld.Greeter/SayHello",
            "backends": ["10.0.0.1:50051", "10.0.0.2:50051"],
            "version": 7
        })))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri()).unwrap();
    let metadata = registry
        .resolve("/helloworld.Greeter/SayHello")
        .await
        .unwrap();

    assert_eq!(metadata.version, 7);
    assert_eq!(
        metadata.backends,
        addrs(&["10.0.0.1:50051", "10.0.0.2:50051"])
    );
}

#[tokio::test]
async fn not_found_is_unknown_method() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri()).unwrap();
    let err = registry.resolve("svc.A/Call").await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownMethod(m) if m == "svc.A/Call"));
}

#[tokio::test]
async fn server_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri()).unwrap();
    match registry.resolve("svc.A/Call").await.unwrap_err() {
        RegistryError::Status { status, body } => {
            assert_eq!(status.as_u16(), 503);
            assert_eq!(body, "draining");
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn invalid_backend_address_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "method": "svc.A/Call",
            "backends": ["missing-port"]
        })))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri()).unwrap();
    assert!(matches!(
        registry.resolve("svc.A/Call").await,
        Err(RegistryError::Http(_))
    ));
}

#[tokio::test]
async fn refresh_applies_successes_and_keeps_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/methods/svc.A/Call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "method": "svc.A/Call",
            "backends": ["10.0.0.1:50051"],
            "version": 2
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/methods/svc.B/Call"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let router = MethodRouter::new(0);
    router.update("svc.B/Call", addrs(&["10.9.9.9:50051"]));

    let registry = HttpRegistry::new(server.uri()).unwrap();
    let methods = vec!["svc.A/Call".to_string(), "svc.B/Call".to_string()];
    let updated = registry::refresh_once(&registry, &router, &methods).await;

    assert_eq!(updated, 1);
    assert_eq!(
        router.backends("svc.A/Call"),
        Some(addrs(&["10.0.0.1:50051"]))
    );
    assert_eq!(
        router.backends("svc.B/Call"),
        Some(addrs(&["10.9.9.9:50051"]))
    );
}

#[tokio::test]
async fn refresh_loop_picks_up_new_methods() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/methods/svc.A/Call"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "method": "svc.A/Call",
            "backends": ["10.0.0.1:50051"]
        })))
        .mount(&server)
        .await;

    let registry: Arc<dyn Registry> = Arc::new(HttpRegistry::new(server.uri()).unwrap());
    let router = Arc::new(MethodRouter::new(0));
    let task = tokio::spawn(registry::run_refresh_loop(
        registry,
        Arc::clone(&router),
        vec!["svc.A/Call".to_string()],
        Duration::from_millis(100),
    ));

    let mut resolved = false;
    for _ in 0..50 {
        if router.backends("svc.A/Call").is_some() {
            resolved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    task.abort();
    assert!(resolved);
}
