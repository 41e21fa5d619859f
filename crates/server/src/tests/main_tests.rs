use super::*;
use axum::{body, body::Body, http::Request};
use serde_json::json;
use tower::ServiceExt;

async fn test_app(require_auth: bool) -> (Router, ApiContext) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext {
        storage,
        auth: AuthConfig {
            jwt_secret: "route-secret".into(),
            token_ttl_seconds: 60,
        },
    };
    let app = build_router(Arc::new(AppState {
        api: api.clone(),
        require_auth,
    }));
    (app, api)
}

async fn seed_user(api: &ApiContext, email: &str, role: &str) {
    create_record(
        api,
        Caller::Operator,
        "users",
        json!({ "email": email, "role": role, "password": "route-pass-1" }),
    )
    .await
    .expect("user");
}

async fn login_token(app: &Router, email: &str) -> String {
    login_as(app, email).await.token
}

async fn login_as(app: &Router, email: &str) -> LoginResponse {
    let request = Request::post("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "email": email, "password": "route-pass-1" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    serde_json::from_slice(&read_body(response).await).expect("json")
}

async fn read_body(response: Response) -> Vec<u8> {
    body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _api) = test_app(true).await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, b"ok");
}

#[tokio::test]
async fn entity_routes_require_bearer_token() {
    let (app, _api) = test_app(true).await;
    let request = Request::get("/entities/proposals")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::get("/entities/proposals")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let err: ApiError = serde_json::from_slice(&read_body(response).await).expect("json");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn wrong_password_login_is_unauthorized() {
    let (app, api) = test_app(true).await;
    seed_user(&api, "admin@crm.test", "admin").await;

    let request = Request::post("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "email": "admin@crm.test", "password": "nope-nope" }).to_string(),
        ))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn crud_round_trip_with_filters_and_merge_patch() {
    let (app, api) = test_app(true).await;
    seed_user(&api, "admin@crm.test", "admin").await;
    let token = login_token(&app, "admin@crm.test").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/entities/clients",
            Some(&token),
            json!({ "name": "Acme", "email": "ops@acme.test" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let client: Value = serde_json::from_slice(&read_body(response).await).expect("json");
    let client_id = client["id"].as_i64().expect("id");

    for (title, status) in [("One", "draft"), ("Two", "sent")] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/entities/proposals",
                Some(&token),
                json!({ "client_id": client_id, "title": title, "total_fee": 10000.0, "status": status }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let request = Request::get("/entities/proposals?status=sent")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let sent: Vec<Value> = serde_json::from_slice(&read_body(response).await).expect("json");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["title"], "Two");
    let sent_id = sent[0]["id"].as_i64().expect("id");

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/entities/proposals/{sent_id}"),
            Some(&token),
            json!({ "status": "declined" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let patched: Value = serde_json::from_slice(&read_body(response).await).expect("json");
    assert_eq!(patched["status"], "declined");
    assert_eq!(patched["title"], "Two");

    let response = app
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/entities/proposals/{sent_id}"),
            Some(&token),
            Value::Null,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let request = Request::get(format!("/entities/proposals/{sent_id}"))
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn validation_errors_map_to_bad_request() {
    let (app, _api) = test_app(false).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/entities/clients",
            None,
            json!({ "name": "No email" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = serde_json::from_slice(&read_body(response).await).expect("json");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn only_admins_may_send_acting_as_header() {
    let (app, api) = test_app(true).await;
    seed_user(&api, "staff@crm.test", "user").await;
    seed_user(&api, "admin@crm.test", "admin").await;

    let staff = login_token(&app, "staff@crm.test").await;
    let request = Request::get("/entities/projects")
        .header("authorization", format!("Bearer {staff}"))
        .header(ACTING_AS_HEADER, "1")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = login_token(&app, "admin@crm.test").await;
    let request = Request::get("/entities/projects")
        .header("authorization", format!("Bearer {admin}"))
        .header(ACTING_AS_HEADER, "1")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn staff_cannot_promote_themselves_or_take_over_users() {
    let (app, api) = test_app(true).await;
    seed_user(&api, "admin@crm.test", "admin").await;
    seed_user(&api, "staff@crm.test", "user").await;
    let admin = login_as(&app, "admin@crm.test").await;
    let staff = login_as(&app, "staff@crm.test").await;
    let admin_id = admin.user.id.0;
    let staff_id = staff.user.id.0;

    let attempts = [
        (staff_id, json!({ "role": "admin" }), StatusCode::FORBIDDEN),
        (admin_id, json!({ "password": "taken-over-1" }), StatusCode::FORBIDDEN),
        (staff_id, json!({ "password_hash": "$argon2id$forged" }), StatusCode::BAD_REQUEST),
    ];
    for (id, patch, expected) in attempts {
        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/entities/users/{id}"),
                Some(&staff.token),
                patch,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), expected);
    }

    let request = Request::get("/entities/users?password_hash=x")
        .header("authorization", format!("Bearer {}", staff.token))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let relogin = login_token(&app, "staff@crm.test").await;
    let request = Request::get("/entities/projects")
        .header("authorization", format!("Bearer {relogin}"))
        .header(ACTING_AS_HEADER, admin_id.to_string())
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(json_request(
            "PATCH",
            &format!("/entities/users/{staff_id}"),
            Some(&admin.token),
            json!({ "role": "admin" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn public_proposal_rejects_mismatched_email() {
    let (app, api) = test_app(true).await;
    let client = create_record(
        &api,
        Caller::Operator,
        "clients",
        json!({ "name": "Acme", "email": "ops@acme.test" }),
    )
    .await
    .expect("client");
    let proposal = create_record(
        &api,
        Caller::Operator,
        "proposals",
        json!({ "client_id": client["id"], "title": "Site", "total_fee": 5000.0, "status": "sent" }),
    )
    .await
    .expect("proposal");
    let id = proposal["id"].as_i64().expect("id");

    let request = Request::get(format!("/public/proposals/{id}?email=other@else.test"))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::post(format!("/public/proposals/{id}/accept"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "email": "ops@acme.test" }).to_string()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let accepted: Proposal = serde_json::from_slice(&read_body(response).await).expect("json");
    assert_eq!(accepted.status, shared::domain::ProposalStatus::Accepted);

    let request = Request::post(format!("/public/proposals/{id}/accept"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "email": "ops@acme.test" }).to_string()))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn llm_route_answers_with_fenced_output() {
    let (app, _api) = test_app(false).await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/integrations/llm",
            None,
            json!({ "prompt": "Testing phase for Site" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let dto: LlmResponse = serde_json::from_slice(&read_body(response).await).expect("json");
    assert!(dto.output.as_str().expect("text").starts_with("```json"));
}

#[tokio::test]
async fn auth_me_returns_token_owner() {
    let (app, api) = test_app(true).await;
    seed_user(&api, "staff@crm.test", "user").await;
    let token = login_token(&app, "staff@crm.test").await;

    let request = Request::get("/auth/me")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let user: User = serde_json::from_slice(&read_body(response).await).expect("json");
    assert_eq!(user.email, "staff@crm.test");
}
