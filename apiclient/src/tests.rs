// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use ggvcommon::{
    functions::{CreatePaymentIntentRequest, RedeemReferralRequest},
    identifiers::UserId,
    time::TimeStamp,
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path, query_param},
};

use crate::{ApiClient, ApiClientInitError, auth::AuthError, functions::FunctionError, rest::RestError};

const ANON_KEY: &str = "anon-key";

async fn client(server: &MockServer) -> ApiClient {
    ApiClient::with_default_http_client(server.uri(), ANON_KEY).expect("Failed to initialize client")
}

fn token_body(user_id: UserId) -> serde_json::Value {
    json!({
        "access_token": "new-access",
        "token_type": "bearer",
        "expires_in": 3600,
        "expires_at": 1_900_000_000,
        "refresh_token": "new-refresh",
        "user": { "id": user_id, "email": "resident@example.com" }
    })
}

#[test]
fn initialize_rejects_bad_input() {
    let http = ApiClient::new_http_client().unwrap();
    assert!(matches!(
        ApiClient::initialize(http.clone(), "https://project.example.com", " "),
        Err(ApiClientInitError::MissingAnonKey)
    ));
    assert!(matches!(
        ApiClient::initialize(http.clone(), "http://", ANON_KEY),
        Err(ApiClientInitError::UrlParsingError(_) | ApiClientInitError::NoHostname(_))
    ));
    let client = ApiClient::initialize(http, "project.example.com", ANON_KEY).unwrap();
    assert_eq!(
        client.realtime_url().unwrap().as_str(),
        "wss://project.example.com/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
    );
}

#[tokio::test]
async fn sign_in_returns_session() {
    let server = MockServer::start().await;
    let user_id = UserId::random();
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .and(header("apikey", ANON_KEY))
        .and(body_json(json!({ "email": "resident@example.com", "password": "secret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(user_id)))
        .expect(1)
        .mount(&server)
        .await;

    let session = client(&server)
        .await
        .sign_in_with_password("resident@example.com", "secret")
        .await
        .unwrap();
    assert_eq!(session.user_id(), user_id);
    assert_eq!(session.access_token, "new-access");
    assert_eq!(session.expires_at, TimeStamp::from_unix_seconds(1_900_000_000).unwrap());
}

#[tokio::test]
async fn refresh_with_revoked_token_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid Refresh Token: Already Used"
        })))
        .mount(&server)
        .await;

    let error = client(&server)
        .await
        .refresh_session("used")
        .await
        .unwrap_err();
    assert!(error.is_unauthorized(), "{error}");
    assert!(error.to_string().contains("Already Used"));
}

#[tokio::test]
async fn get_user_uses_access_token() {
    let server = MockServer::start().await;
    let user_id = UserId::random();
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .and(header("authorization", "Bearer user-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": user_id, "email": null })),
        )
        .mount(&server)
        .await;

    let client = client(&server).await;
    assert!(matches!(client.get_user().await, Err(AuthError::NotSignedIn)));
    let user = client.with_access_token("user-token").get_user().await.unwrap();
    assert_eq!(user.id, user_id);
}

#[tokio::test]
async fn select_decodes_database_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/coin_transactions"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "code": "42501",
            "message": "permission denied for table coin_transactions",
            "details": null,
            "hint": null
        })))
        .mount(&server)
        .await;

    let error = client(&server)
        .await
        .coin_transactions(UserId::random(), 20)
        .await
        .unwrap_err();
    match error {
        RestError::Database { error, .. } => assert!(error.is_permission_denied()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn active_header_messages_drop_expired_rows() {
    let server = MockServer::start().await;
    let now = TimeStamp::now();
    let past = now - ggvcommon::time::Duration::minutes(1);
    let future = now + ggvcommon::time::Duration::hours(1);
    Mock::given(method("GET"))
        .and(path("/rest/v1/header_messages"))
        .and(query_param("order", "created_at.desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "11111111-1111-4111-8111-111111111111",
                "content": "still visible",
                "user_id": null,
                "created_at": now,
                "expires_at": future
            },
            {
                "id": "22222222-2222-4222-8222-222222222222",
                "content": "clock skew",
                "user_id": null,
                "created_at": past,
                "expires_at": past
            },
            {
                "id": "33333333-3333-4333-8333-333333333333",
                "content": "forever",
                "user_id": null,
                "created_at": past,
                "expires_at": null
            }
        ])))
        .mount(&server)
        .await;

    let messages = client(&server)
        .await
        .active_header_messages(now)
        .await
        .unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["still visible", "forever"]);
}

#[tokio::test]
async fn redeem_referral_code_reports_function_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/redeem-referral-code"))
        .and(body_json(json!({ "code": "GGV-1" })))
        .respond_with(
            ResponseTemplate::new(409).set_body_json(json!({ "error": "Code already redeemed" })),
        )
        .mount(&server)
        .await;

    let request = RedeemReferralRequest::new("ggv-1").unwrap();
    let client = client(&server).await;
    assert!(matches!(
        client.redeem_referral_code(&request).await,
        Err(FunctionError::NotSignedIn)
    ));
    match client
        .with_access_token("user-token")
        .redeem_referral_code(&request)
        .await
    {
        Err(FunctionError::Failed { message, status, .. }) => {
            assert_eq!(status.as_u16(), 409);
            assert_eq!(message, "Code already redeemed");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn create_payment_intent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/create-payment-intent"))
        .and(body_json(json!({ "coins": 100 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "clientSecret": "pi_1_secret",
            "transactionId": "44444444-4444-4444-8444-444444444444"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .await
        .with_access_token("user-token")
        .create_payment_intent(&CreatePaymentIntentRequest::new(100).unwrap())
        .await
        .unwrap();
    assert_eq!(response.client_secret, "pi_1_secret");
}
