use serde_json::json;
use serverforge_cloud::testing::MockApi;
use serverforge_cloud::{CloudError, CloudProvider, CreateServerRequest, ProviderCredentials};
use serverforge_cloud_digitalocean::DigitalOceanProvider;

fn provider(api: &MockApi) -> DigitalOceanProvider {
    DigitalOceanProvider::with_base_url(api.base_url())
        .with_credentials(ProviderCredentials::new("do-token"))
}

#[tokio::test]
async fn test_validate_credentials() {
    let api = MockApi::start().await;
    api.route("GET", "/account", 200, json!({"account": {"status": "active"}}));
    assert!(provider(&api).validate_credentials().await);

    api.route("GET", "/account", 401, json!({"id": "unauthorized"}));
    assert!(!provider(&api).validate_credentials().await);
}

#[tokio::test]
async fn test_validate_credentials_swallows_transport_errors() {
    let provider = DigitalOceanProvider::with_base_url("http://127.0.0.1:9")
        .with_credentials(ProviderCredentials::new("do-token"));
    assert!(!provider.validate_credentials().await);

    let unconfigured = DigitalOceanProvider::new();
    assert!(!unconfigured.validate_credentials().await);
}

#[tokio::test]
async fn test_list_sizes_filters_unavailable_and_sorts_by_price() {
    let api = MockApi::start().await;
    api.route(
        "GET",
        "/sizes",
        200,
        json!({"sizes": [
            {"slug": "s-2vcpu-4gb", "vcpus": 2, "memory": 4096, "disk": 80, "price_monthly": 24.0, "available": true},
            {"slug": "s-1vcpu-512mb-10gb", "vcpus": 1, "memory": 512, "disk": 10, "price_monthly": 4.0, "available": true},
            {"slug": "s-1vcpu-1gb", "vcpus": 1, "memory": 1024, "disk": 25, "price_monthly": 6.0, "available": false},
            {"slug": "s-1vcpu-2gb", "vcpus": 1, "memory": 2048, "disk": 50, "price_monthly": 12.0, "available": true}
        ]}),
    );

    let sizes = provider(&api).list_sizes().await.unwrap();
    let slugs: Vec<_> = sizes.iter().map(|s| s.slug.as_str()).collect();
    assert_eq!(slugs, vec!["s-1vcpu-512mb-10gb", "s-1vcpu-2gb", "s-2vcpu-4gb"]);
    assert_eq!(sizes[0].memory_mb, 512);
    assert_eq!(sizes[0].description(), "1 vCPU, 512 MB RAM, 10 GB SSD - $4.00/mo");
}

#[tokio::test]
async fn test_list_regions_filters_unavailable() {
    let api = MockApi::start().await;
    api.route(
        "GET",
        "/regions",
        200,
        json!({"regions": [
            {"slug": "nyc3", "name": "New York 3", "available": true},
            {"slug": "ams2", "name": "Amsterdam 2", "available": false},
            {"slug": "fra1", "name": "Frankfurt 1", "available": true}
        ]}),
    );

    let regions = provider(&api).list_regions().await.unwrap();
    let slugs: Vec<_> = regions.iter().map(|r| r.slug.as_str()).collect();
    assert_eq!(slugs, vec!["fra1", "nyc3"]);
}

#[tokio::test]
async fn test_create_server_payload() {
    let api = MockApi::start().await;
    api.route(
        "POST",
        "/droplets",
        202,
        json!({"droplet": {"id": 3164494, "name": "web-1", "status": "new"}}),
    );

    let created = provider(&api)
        .create_server(&CreateServerRequest {
            name: "web-1".into(),
            size: "s-1vcpu-1gb".into(),
            region: "nyc3".into(),
            ssh_key_id: "512189".into(),
        })
        .await
        .unwrap();

    assert_eq!(created.id, "3164494");
    assert_eq!(created.status, "new");

    let request = &api.requests_to("/droplets")[0];
    let body = request.json();
    assert_eq!(body["image"], "ubuntu-22-04-x64");
    assert_eq!(body["ssh_keys"], json!([512189]));
    assert_eq!(body["monitoring"], true);
    assert_eq!(body["tags"], json!(["serverforge"]));
    assert_eq!(request.authorization.as_deref(), Some("Bearer do-token"));
}

#[tokio::test]
async fn test_server_status_extracts_networks() {
    let api = MockApi::start().await;
    api.route(
        "GET",
        "/droplets/7",
        200,
        json!({"droplet": {
            "id": 7, "name": "web-1", "status": "active",
            "networks": {"v4": [
                {"ip_address": "10.0.0.5", "type": "private"},
                {"ip_address": "203.0.113.10", "type": "public"}
            ]}
        }}),
    );

    let status = provider(&api).get_server_status("7").await.unwrap();
    assert!(status.is_reachable());
    assert_eq!(status.ip.as_deref(), Some("203.0.113.10"));
    assert_eq!(status.private_ip.as_deref(), Some("10.0.0.5"));
}

#[tokio::test]
async fn test_delete_absent_resources_succeeds() {
    let api = MockApi::start().await;
    let provider = provider(&api);

    // nothing registered: every path answers 404
    provider.delete_server("404404").await.unwrap();
    provider.delete_ssh_key("512189").await.unwrap();
}

#[tokio::test]
async fn test_delete_server_failure_is_provider_api_error() {
    let api = MockApi::start().await;
    api.route("DELETE", "/droplets/9", 500, json!({"message": "Server Error"}));

    let err = provider(&api).delete_server("9").await.unwrap_err();
    assert!(matches!(err, CloudError::ProviderApi { status: 500, .. }));
    assert_eq!(api.requests_to("/droplets/9").len(), 1);
}

#[tokio::test]
async fn test_create_ssh_key_returns_id() {
    let api = MockApi::start().await;
    api.route(
        "POST",
        "/account/keys",
        201,
        json!({"ssh_key": {"id": 512190, "name": "serverforge-web-1-abcd1234"}}),
    );

    let id = provider(&api)
        .create_ssh_key("serverforge-web-1-abcd1234", "ssh-ed25519 AAAA test")
        .await
        .unwrap();
    assert_eq!(id, "512190");

    let body = api.requests_to("/account/keys")[0].json();
    assert_eq!(body["public_key"], "ssh-ed25519 AAAA test");
}
