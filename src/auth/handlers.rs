use actix_web::http::Method;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::auth::admission::{AuthLevel, RouteRule};
use crate::auth::service::Identity;
use crate::error::AppError;
use crate::AppState;

const MAX_KICK_BATCH: usize = 50;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct KickRequest {
    pub device_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<crate::device::DeviceView>,
}

pub async fn refresh(
    req: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    match state.sessions.refresh(&req.refresh_token).await {
        Ok(tokens) => Ok(HttpResponse::Ok().json(tokens)),
        Err(e) => {
            info!(code = e.code(), "refresh rejected");
            Err(e)
        }
    }
}

pub async fn logout(
    identity: Identity,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.sessions.logout(&identity).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Successfully logged out"
    })))
}

pub async fn list_devices(
    identity: Identity,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let devices = state.registry.list_devices(identity.user_id).await?;
    Ok(HttpResponse::Ok().json(DeviceListResponse { devices }))
}

pub async fn kick(
    identity: Identity,
    req: web::Json<KickRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    if req.device_ids.is_empty() || req.device_ids.len() > MAX_KICK_BATCH {
        return Err(AppError::ValidationError(format!(
            "device_ids must contain between 1 and {} entries",
            MAX_KICK_BATCH
        )));
    }

    match state.registry.kick(identity.user_id, &req.device_ids).await {
        Ok(report) => Ok(HttpResponse::Ok().json(report)),
        Err(e) => {
            error!(user_id = identity.user_id, error = %e, "kick failed");
            Err(e)
        }
    }
}

/// Admission rules for the routes registered by [`configure`].
pub fn route_rules() -> Vec<(Method, &'static str, RouteRule)> {
    vec![
        (Method::GET, "/health", RouteRule::new("api", AuthLevel::Public)),
        (Method::POST, "/auth/refresh", RouteRule::new("login", AuthLevel::Public)),
        (
            Method::POST,
            "/auth/logout",
            RouteRule::new("api", AuthLevel::Token).without_heartbeat(),
        ),
        (Method::GET, "/devices", RouteRule::new("api", AuthLevel::Token)),
        (Method::POST, "/devices/kick", RouteRule::new("api", AuthLevel::DeviceLive)),
    ]
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(crate::health_check))
        .route("/auth/refresh", web::post().to(refresh))
        .route("/auth/logout", web::post().to(logout))
        .route("/devices", web::get().to(list_devices))
        .route("/devices/kick", web::post().to(kick));
}
