use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Extension, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use server_api::{
    actions, auth, create_record, delete_record, get_record, list_records, public, update_record,
    ApiContext, AuthConfig, Caller, Claims,
};
use shared::{
    domain::{Proposal, Role, User, UserInvitation},
    error::{ApiError, ErrorCode},
    protocol::{
        DashboardStats, EmailReceipt, InvitationAcceptRequest, LlmRequest, LlmResponse,
        LoginRequest, LoginResponse, OutboundEmail, PublicAccessQuery,
    },
};
use storage::Storage;
use tracing::{error, info, warn};

mod config;

use config::{load_settings, normalize_database_url};

const ACTING_AS_HEADER: &str = "x-acting-as";

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    require_auth: bool,
}

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    if !settings.require_auth {
        warn!("bearer authentication is disabled for record routes");
    }
    let api = ApiContext {
        storage,
        auth: AuthConfig {
            jwt_secret: settings.jwt_secret,
            token_ttl_seconds: settings.token_ttl_seconds,
        },
    };

    let state = AppState {
        api,
        require_auth: settings.require_auth,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route(
            "/entities/:collection",
            get(http_list_records).post(http_create_record),
        )
        .route(
            "/entities/:collection/:id",
            get(http_get_record)
                .patch(http_update_record)
                .delete(http_delete_record),
        )
        .route("/integrations/email", post(http_send_email))
        .route("/functions/send_gmail", post(http_send_gmail))
        .route("/integrations/llm", post(http_generate_text))
        .route("/functions/dashboard_stats", get(http_dashboard_stats))
        .route("/auth/me", get(current_user))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(login))
        .route("/public/proposals/:id", get(http_public_proposal))
        .route("/public/proposals/:id/accept", post(http_accept_proposal))
        .route("/public/invitations/:id", get(http_public_invitation))
        .route("/public/invitations/:id/accept", post(http_accept_invitation))
        .merge(protected)
        .with_state(state)
}

/// Rejects requests without a valid bearer token. Only admins may act on
/// behalf of another user through the acting-as header.
async fn require_bearer(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        if !state.require_auth {
            return Ok(next.run(req).await);
        }
        return Err(http_error(ApiError::new(
            ErrorCode::Unauthorized,
            "missing bearer token",
        )));
    };
    let claims = auth::verify_token(&state.api.auth, token).map_err(http_error)?;

    if let Some(acting_as) = req.headers().get(ACTING_AS_HEADER) {
        if claims.role != Role::Admin {
            return Err(http_error(ApiError::new(
                ErrorCode::Forbidden,
                "only admins may act as another user",
            )));
        }
        let acting_as = acting_as.to_str().unwrap_or_default();
        info!(user_id = claims.sub, acting_as, "request made while impersonating");
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Requests without claims only get this far when bearer auth is disabled.
fn caller(claims: &Option<Extension<Claims>>) -> Caller<'_> {
    match claims {
        Some(Extension(claims)) => Caller::Signed(claims),
        None => Caller::Operator,
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        http_error(ApiError::new(ErrorCode::Internal, e.to_string()))
    })?;
    Ok("ok")
}

async fn current_user(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<Claims>>,
) -> Result<Json<User>, HttpError> {
    let Some(Extension(claims)) = claims else {
        return Err(http_error(ApiError::new(
            ErrorCode::Unauthorized,
            "missing bearer token",
        )));
    };
    let user = auth::current_user(&state.api, &claims)
        .await
        .map_err(http_error)?;
    Ok(Json(user))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let response = auth::login(&state.api, &req).await.map_err(http_error)?;
    Ok(Json(response))
}

async fn http_list_records(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(filters): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Value>>, HttpError> {
    let records = list_records(&state.api, &collection, &filters)
        .await
        .map_err(http_error)?;
    Ok(Json(records))
}

async fn http_get_record(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, i64)>,
) -> Result<Json<Value>, HttpError> {
    let record = get_record(&state.api, &collection, id)
        .await
        .map_err(http_error)?;
    Ok(Json(record))
}

async fn http_create_record(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<Claims>>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), HttpError> {
    let record = create_record(&state.api, caller(&claims), &collection, body)
        .await
        .map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn http_update_record(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<Claims>>,
    Path((collection, id)): Path<(String, i64)>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    let record = update_record(&state.api, caller(&claims), &collection, id, patch)
        .await
        .map_err(http_error)?;
    Ok(Json(record))
}

async fn http_delete_record(
    State(state): State<Arc<AppState>>,
    claims: Option<Extension<Claims>>,
    Path((collection, id)): Path<(String, i64)>,
) -> Result<StatusCode, HttpError> {
    delete_record(&state.api, caller(&claims), &collection, id)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_send_email(
    State(state): State<Arc<AppState>>,
    Json(email): Json<OutboundEmail>,
) -> Result<Json<EmailReceipt>, HttpError> {
    let receipt = actions::send_email(&state.api, &email)
        .await
        .map_err(http_error)?;
    Ok(Json(receipt))
}

async fn http_send_gmail(
    State(state): State<Arc<AppState>>,
    Json(email): Json<OutboundEmail>,
) -> Result<Json<EmailReceipt>, HttpError> {
    let receipt = actions::send_gmail(&state.api, &email)
        .await
        .map_err(http_error)?;
    Ok(Json(receipt))
}

async fn http_generate_text(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LlmRequest>,
) -> Result<Json<LlmResponse>, HttpError> {
    let response = actions::generate_text(&state.api, &req)
        .await
        .map_err(http_error)?;
    Ok(Json(response))
}

async fn http_dashboard_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardStats>, HttpError> {
    let stats = actions::dashboard_stats(&state.api)
        .await
        .map_err(http_error)?;
    Ok(Json(stats))
}

async fn http_public_proposal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<PublicAccessQuery>,
) -> Result<Json<Proposal>, HttpError> {
    let proposal = public::public_proposal(&state.api, id, &q.email)
        .await
        .map_err(http_error)?;
    Ok(Json(proposal))
}

async fn http_accept_proposal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PublicAccessQuery>,
) -> Result<Json<Proposal>, HttpError> {
    let proposal = public::accept_public_proposal(&state.api, id, &req.email)
        .await
        .map_err(http_error)?;
    Ok(Json(proposal))
}

async fn http_public_invitation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<PublicAccessQuery>,
) -> Result<Json<UserInvitation>, HttpError> {
    let invitation = public::public_invitation(&state.api, id, &q.email)
        .await
        .map_err(http_error)?;
    Ok(Json(invitation))
}

async fn http_accept_invitation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<InvitationAcceptRequest>,
) -> Result<Json<UserInvitation>, HttpError> {
    let invitation = public::accept_invitation(&state.api, id, &req)
        .await
        .map_err(http_error)?;
    Ok(Json(invitation))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
