//! HTTP server and API endpoints for the claim portal.

use crate::{
    admin::GasSettingsUpdate,
    config::ClaimConfig,
    distribution::TokenHealth,
    error::{ClaimError, ClaimResult},
    model::ClaimStatus,
    otp::SessionGrant,
    session::{bearer_token, Session},
    state::AppState,
    store::BindingChange,
    wallet::WalletChallenge,
};
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Shared application state
pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize, Validate)]
pub struct EmailRequest {
    #[validate(length(min = 1, max = 320))]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CodeExchangeRequest {
    #[validate(length(min = 1, max = 320))]
    pub email: String,
    #[validate(length(min = 1, max = 16))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChallengeRequest {
    #[validate(length(min = 1, max = 64))]
    pub address: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignatureRequest {
    #[validate(length(min = 1, max = 64))]
    pub address: String,
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
    #[validate(length(min = 1, max = 4096))]
    pub message: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    #[validate(length(min = 1, max = 64))]
    pub recipient_address: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CsvUploadRequest {
    #[validate(length(min = 1))]
    pub csv_data: String,
}

/// JSON body that is also checked with its `validator` rules
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ClaimError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ClaimError::InvalidRequest(e.body_text()))?;
        value
            .validate()
            .map_err(|e| ClaimError::InvalidRequest(e.to_string()))?;
        Ok(Self(value))
    }
}

/// Bearer session issued by the code exchange
pub struct SessionAuth(pub Session);

#[async_trait]
impl FromRequestParts<SharedState> for SessionAuth {
    type Rejection = ClaimError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(ClaimError::Unauthorized)?;
        Ok(Self(state.sessions.verify(token)?))
    }
}

/// Basic-auth admin; carries the username for audit entries
pub struct AdminAuth(pub String);

#[async_trait]
impl FromRequestParts<SharedState> for AdminAuth {
    type Rejection = ClaimError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        Ok(Self(state.admin.authenticate(header)?))
    }
}

/// Caller address: the socket peer, or the proxy headers when the deployment trusts them
pub struct ClientIp(pub String);

#[async_trait]
impl FromRequestParts<SharedState> for ClientIp {
    type Rejection = ClaimError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(client_ip(&parts.headers, peer, state.trust_proxy_headers)))
    }
}

fn client_ip(headers: &HeaderMap, peer: Option<String>, trust_proxy_headers: bool) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let forwarded = if trust_proxy_headers {
        header("x-forwarded-for").or_else(|| header("x-real-ip"))
    } else {
        None
    };
    forwarded.or(peer).unwrap_or_else(|| "unknown".to_string())
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/request-email-code", post(request_email_code))
        .route("/api/exchange-email-code", post(exchange_email_code))
        .route("/api/get-sign-challenge", post(get_sign_challenge))
        .route("/api/submit-signature", post(submit_signature))
        .route("/api/claim/status", get(claim_status))
        .route("/api/claim", post(claim))
        .route("/api/health/token", get(token_health))
        .route("/api/admin/upload-csv", post(upload_csv))
        .route("/api/admin/stats", get(admin_stats))
        .route("/api/admin/gas-settings", get(get_gas_settings).post(update_gas_settings))
        .route("/api/admin/reset-rate-limits", post(reset_rate_limits))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "Claim Server",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /api/request-email-code": "Email a verification code",
            "POST /api/exchange-email-code": "Exchange a code for a session",
            "POST /api/get-sign-challenge": "Wallet ownership challenge",
            "POST /api/submit-signature": "Bind a wallet with a signed challenge",
            "GET /api/claim/status": "Allocation and claim history",
            "POST /api/claim": "Claim the allocation to a wallet",
            "GET /api/health/token": "Token contract health",
        }
    }))
}

async fn request_email_code(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    ValidJson(request): ValidJson<EmailRequest>,
) -> ClaimResult<Json<Value>> {
    debug!("Code request from {}", ip);
    state.otp.request_code(&request.email, &ip).await?;

    Ok(Json(json!({
        "success": true,
        "message": "If this email is eligible, a verification code has been sent.",
    })))
}

async fn exchange_email_code(
    State(state): State<SharedState>,
    ValidJson(request): ValidJson<CodeExchangeRequest>,
) -> ClaimResult<Json<SessionGrant>> {
    Ok(Json(state.otp.verify_code(&request.email, &request.code).await?))
}

async fn get_sign_challenge(
    State(state): State<SharedState>,
    SessionAuth(session): SessionAuth,
    ValidJson(request): ValidJson<ChallengeRequest>,
) -> ClaimResult<Json<WalletChallenge>> {
    Ok(Json(
        state
            .wallet
            .issue_challenge(&session.identifier, &request.address)
            .await?,
    ))
}

async fn submit_signature(
    State(state): State<SharedState>,
    SessionAuth(session): SessionAuth,
    ValidJson(request): ValidJson<SignatureRequest>,
) -> ClaimResult<Json<Value>> {
    let change = state
        .wallet
        .submit_proof(
            &session.identifier,
            &request.address,
            &request.signature,
            &request.message,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "address": request.address,
        "rebound": matches!(change, BindingChange::Rebound { .. }),
    })))
}

async fn claim_status(
    State(state): State<SharedState>,
    SessionAuth(session): SessionAuth,
) -> ClaimResult<Json<ClaimStatus>> {
    Ok(Json(state.distribution.status(&session.identifier).await?))
}

async fn claim(
    State(state): State<SharedState>,
    SessionAuth(session): SessionAuth,
    ValidJson(request): ValidJson<ClaimRequest>,
) -> ClaimResult<Json<Value>> {
    let receipt = state
        .distribution
        .claim(&session.identifier, &request.recipient_address)
        .await?;

    Ok(Json(json!({
        "success": true,
        "txHash": receipt.tx_hash,
        "alreadyClaimed": receipt.already_claimed,
    })))
}

async fn token_health(State(state): State<SharedState>) -> (StatusCode, Json<TokenHealth>) {
    let health = state.distribution.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn upload_csv(
    State(state): State<SharedState>,
    AdminAuth(actor): AdminAuth,
    ValidJson(request): ValidJson<CsvUploadRequest>,
) -> ClaimResult<Json<Value>> {
    let report = state.ingestion.upload_csv(&request.csv_data, &actor).await?;

    Ok(Json(json!({
        "success": true,
        "inserted": report.inserted,
        "updated": report.updated,
        "skipped": report.skipped,
        "total": report.total,
    })))
}

async fn admin_stats(State(state): State<SharedState>, AdminAuth(_): AdminAuth) -> ClaimResult<impl IntoResponse> {
    Ok(Json(state.admin.stats().await?))
}

async fn get_gas_settings(State(state): State<SharedState>, AdminAuth(_): AdminAuth) -> ClaimResult<impl IntoResponse> {
    Ok(Json(state.admin.gas_settings().await?))
}

async fn update_gas_settings(
    State(state): State<SharedState>,
    AdminAuth(actor): AdminAuth,
    ValidJson(update): ValidJson<GasSettingsUpdate>,
) -> ClaimResult<Json<Value>> {
    let settings = state.admin.update_gas_settings(update, &actor).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Gas settings updated",
        "settings": settings,
    })))
}

async fn reset_rate_limits(State(state): State<SharedState>, AdminAuth(actor): AdminAuth) -> ClaimResult<Json<Value>> {
    let cleared = state.admin.reset_rate_limits(&actor).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Rate limits reset ({} keys cleared)", cleared),
    })))
}

/// Start the HTTP server
pub async fn start_server(config: &ClaimConfig) -> ClaimResult<()> {
    info!("Starting claim server...");

    let state: SharedState = Arc::new(AppState::from_config(config)?);

    info!("Checking token contract...");
    let health = state.distribution.health().await;
    match &health.reason {
        None => info!(
            "Token {} healthy ({} decimals)",
            health.symbol.as_deref().unwrap_or("?"),
            health.decimals.unwrap_or_default()
        ),
        Some(reason) => warn!("Token contract unhealthy at startup: {}", reason),
    }

    // Housekeeping
    let cleanup_state = state.clone();
    let cleanup_interval = Duration::from_secs(config.security.cleanup_interval_minutes.max(1) * 60);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = cleanup_state.cleanup().await {
                error!("Cleanup failed: {}", e);
            }
        }
    });

    let app = create_router(state);

    let bind_addr = format!("{}:{}", config.http.bind_address, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e)))?;

    info!("Claim server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Server error: {}", e)))?;

    Ok(())
}
