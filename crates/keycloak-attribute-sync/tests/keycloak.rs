//! Runs the Keycloak admin API client against a mock HTTP server.

use keycloak_attribute_sync::{
    keycloak::{self, Endpoint, IdentityProvider, KeycloakProvider},
    transport::{Credentials, TrustConfig},
};
use serde_json::json;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, header, method, path, query_param},
};

fn endpoint(base: &str) -> Endpoint {
    Endpoint {
        url: Url::parse(base).unwrap(),
        login_realm: "master".to_owned(),
    }
}

fn credentials() -> Credentials {
    Credentials::new("admin", "hunter2")
}

async fn mount_token(server: &MockServer, prefix: &str) {
    Mock::given(method("POST"))
        .and(path(format!(
            "{prefix}/realms/master/protocol/openid-connect/token"
        )))
        .and(body_string_contains("grant_type=password"))
        .and(body_string_contains("client_id=admin-cli"))
        .and(body_string_contains("username=admin"))
        .and(body_string_contains("password=hunter2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token-123",
            "refresh_token": "refresh-456",
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn lists_users_and_logs_out() {
    let server = MockServer::start().await;
    mount_token(&server, "").await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/customers/users"))
        .and(query_param("max", "-1"))
        .and(query_param("briefRepresentation", "false"))
        .and(header("Authorization", "Bearer token-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "2b3c1f4e",
                "username": "mytestuser",
                "enabled": true,
                "attributes": { "organization": ["Acme", "Globex"] },
            },
            { "id": "9d8e7f6a", "username": "no-attributes" },
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/realms/master/protocol/openid-connect/logout"))
        .and(body_string_contains("client_id=admin-cli"))
        .and(body_string_contains("refresh_token=refresh-456"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let session = KeycloakProvider
        .authenticate(&endpoint(&server.uri()), &credentials(), &TrustConfig::default())
        .await
        .unwrap();
    let users = session.list_users("customers").await.unwrap();
    session.logout().await;

    assert_eq!(users.len(), 2);
    assert_eq!(users[0].username.as_deref(), Some("mytestuser"));
    assert_eq!(users[0].attribute("organization"), Some("Acme"));
    assert_eq!(users[1].attributes, None);
    server.verify().await;
}

#[tokio::test]
async fn keeps_base_path_of_url() {
    let server = MockServer::start().await;
    mount_token(&server, "/auth").await;
    Mock::given(method("GET"))
        .and(path("/auth/admin/realms/customers/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let session = KeycloakProvider
        .authenticate(
            &endpoint(&format!("{}/auth/", server.uri())),
            &credentials(),
            &TrustConfig::default(),
        )
        .await
        .unwrap();

    assert!(session.list_users("customers").await.unwrap().is_empty());
    server.verify().await;
}

#[tokio::test]
async fn rejected_login_fails_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/realms/master/protocol/openid-connect/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid user credentials",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let error = KeycloakProvider
        .authenticate(&endpoint(&server.uri()), &credentials(), &TrustConfig::default())
        .await
        .err()
        .unwrap();

    assert!(
        matches!(&error, keycloak::Error::AuthenticationFailed { realm, .. } if realm == "master"),
        "{error:?}"
    );
}

#[tokio::test]
async fn forbidden_listing_fails_fetch() {
    let server = MockServer::start().await;
    mount_token(&server, "").await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/customers/users"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let session = KeycloakProvider
        .authenticate(&endpoint(&server.uri()), &credentials(), &TrustConfig::default())
        .await
        .unwrap();
    let error = session.list_users("customers").await.unwrap_err();

    assert!(
        matches!(&error, keycloak::Error::FetchFailed { realm, .. } if realm == "customers"),
        "{error:?}"
    );
    server.verify().await;
}

#[tokio::test]
async fn unparsable_user_list_fails_fetch() {
    let server = MockServer::start().await;
    mount_token(&server, "").await;
    Mock::given(method("GET"))
        .and(path("/admin/realms/customers/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let session = KeycloakProvider
        .authenticate(&endpoint(&server.uri()), &credentials(), &TrustConfig::default())
        .await
        .unwrap();

    assert!(matches!(
        session.list_users("customers").await,
        Err(keycloak::Error::FetchFailed { .. })
    ));
}
