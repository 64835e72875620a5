//! ResourceLoader tests against a local mock server

use std::time::Duration;

use bytes::Bytes;
use chaun_net::{Fetcher, LoaderConfig, NetError, Request, ResourceLoader};
use http::{Method, StatusCode};
use url::Url;
use wiremock::matchers::{body_bytes, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn loader() -> ResourceLoader {
    ResourceLoader::new(LoaderConfig::default()).unwrap()
}

fn url(server: &MockServer, p: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
}

#[tokio::test]
async fn fetches_binary_asset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/character_animation/B5entry.glb"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "model/gltf-binary")
                .set_body_bytes(b"glTF\x02\x00".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = loader()
        .fetch(Request::get(url(&server, "/character_animation/B5entry.glb")))
        .await
        .unwrap();

    assert!(response.ok());
    assert!(!response.from_cache);
    assert_eq!(
        response.content_type().map(|m| m.essence_str().to_string()),
        Some("model/gltf-binary".to_string())
    );
    assert_eq!(response.into_bytes(), Bytes::from_static(b"glTF\x02\x00"));
}

#[tokio::test]
async fn non_success_status_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let response = loader()
        .fetch(Request::get(url(&server, "/missing.glb")))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(!response.ok());
}

#[tokio::test]
async fn sends_request_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/records"))
        .and(body_bytes(b"{\"weight\":70}".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let request = Request::post(
        url(&server, "/api/records"),
        Bytes::from_static(b"{\"weight\":70}"),
    );
    assert_eq!(request.method, Method::POST);

    let response = loader().fetch(request).await.unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
}

#[tokio::test]
async fn request_timeout_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let result = loader()
        .fetch(Request::get(url(&server, "/slow.glb")).timeout(Duration::from_millis(100)))
        .await;

    assert!(matches!(result, Err(NetError::Timeout(_))));
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
        .mount(&server)
        .await;

    let loader = ResourceLoader::new(LoaderConfig {
        max_body_bytes: Some(1024),
        ..LoaderConfig::default()
    })
    .unwrap();

    let result = loader.fetch(Request::get(url(&server, "/B5dancing.glb"))).await;
    assert!(matches!(result, Err(NetError::BodyTooLarge { limit: 1024, .. })));
}
