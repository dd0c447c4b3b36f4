use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::db::models::{Device, DeviceType, Session};
use crate::db::store::SessionStore;
use crate::device::identity::validate_device_id;
use crate::device::registry::{DeviceRegistry, LoginDevice};
use crate::error::{AppError, AuthError, DeviceError};
use crate::reaper::Reaper;
use crate::sources::{Clock, RandomSource};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // User ID
    pub did: String,        // Device ID
    pub dty: DeviceType,    // Device type
    pub sid: String,        // Session token
    pub kind: TokenKind,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

/// The caller behind a verified access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: i64,
    pub device_id: String,
    pub device_type: DeviceType,
    pub session_id: String,
}

impl TryFrom<&Claims> for Identity {
    type Error = AppError;

    fn try_from(claims: &Claims) -> Result<Self> {
        let user_id = claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::AuthError(AuthError::InvalidToken))?;
        Ok(Self {
            user_id,
            device_id: claims.did.clone(),
            device_type: claims.dty,
            session_id: claims.sid.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub device: Device,
    /// Device id that was signed out to make room, if any.
    pub evicted_device_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub liveness_timeout: std::time::Duration,
    pub sweep_interval: std::time::Duration,
}

impl SessionConfig {
    pub fn from_settings(auth: &AuthConfig) -> Self {
        Self {
            jwt_secret: auth.jwt_secret.clone(),
            issuer: auth.issuer.clone(),
            access_ttl: Duration::minutes(auth.access_token_ttl_minutes),
            refresh_ttl: Duration::days(auth.refresh_token_ttl_days),
            liveness_timeout: std::time::Duration::from_millis(auth.liveness_timeout_ms),
            sweep_interval: std::time::Duration::from_secs(auth.session_sweep_interval_secs),
        }
    }
}

/// Issues, validates and rotates token pairs bound to (user, device, session).
///
/// Sessions store SHA-256 digests of the tokens they issued, never the tokens.
pub struct SessionManager {
    registry: Arc<DeviceRegistry>,
    sessions: Arc<dyn SessionStore>,
    config: SessionConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    reaper: Reaper,
}

impl SessionManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<dyn SessionStore>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        let reaper = Reaper::new("expired-session-sweep", config.sweep_interval);
        Self {
            registry,
            sessions,
            config,
            encoding_key,
            decoding_key,
            clock,
            random,
            reaper,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Called by the credential layer once the user is verified.
    pub async fn login(&self, user_id: i64, login: &LoginDevice) -> Result<LoginOutcome> {
        let registration = self.registry.register_login(user_id, login).await?;
        let device = registration.device;

        let session_token = self.new_session_token();
        let tokens = self.issue_token_pair(user_id, &device, &session_token)?;
        self.store_session(user_id, &device.device_id, &session_token, &tokens)
            .await?;

        info!(
            user_id = user_id,
            device_id = %device.device_id,
            created = registration.created,
            "session opened"
        );
        Ok(LoginOutcome {
            tokens,
            device,
            evicted_device_id: registration.evicted.map(|d| d.device_id),
        })
    }

    pub fn issue_token_pair(&self, user_id: i64, device: &Device, session_id: &str) -> Result<TokenPair> {
        if user_id <= 0 {
            return Err(AppError::ValidationError("user id must be positive".into()));
        }
        if device.user_id != user_id {
            return Err(AuthError::SessionMismatch.into());
        }
        if session_id.is_empty() {
            return Err(AppError::ValidationError("session id must not be empty".into()));
        }
        if !validate_device_id(&device.device_id) {
            return Err(DeviceError::InvalidDeviceId("malformed device id".into()).into());
        }

        let now = self.clock.now();
        let access_token = self.generate_token(TokenKind::Access, user_id, device, session_id, now)?;
        let refresh_token = self.generate_token(TokenKind::Refresh, user_id, device, session_id, now)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.config.access_ttl.num_seconds(),
            refresh_expires_in: self.config.refresh_ttl.num_seconds(),
        })
    }

    /// Stateless check for the hot path: signature, issuer, kind and expiry.
    pub fn validate_access(&self, token: &str) -> Result<Identity> {
        let claims = self.decode_token(token, TokenKind::Access)?;
        Identity::try_from(&claims)
    }

    /// Rotates a refresh token. The device is re-read from the store first;
    /// a valid signature alone never earns a new pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.decode_token(refresh_token, TokenKind::Refresh)?;
        let identity = Identity::try_from(&claims)?;

        let device = self.live_device(&identity).await?;
        let session = self.current_session(&identity).await?;
        if session.refresh_token != digest(refresh_token) {
            warn!(user_id = identity.user_id, device_id = %identity.device_id, "refresh token does not match its session");
            return Err(AuthError::InvalidToken.into());
        }

        // Consume the old session. Losing this race means the token was reused.
        if !self.sessions.delete_by_token(&session.session_token).await? {
            warn!(user_id = identity.user_id, device_id = %identity.device_id, "refresh token reused");
            return Err(AuthError::InvalidToken.into());
        }

        let session_token = self.new_session_token();
        let tokens = self.issue_token_pair(identity.user_id, &device, &session_token)?;
        self.store_session(identity.user_id, &device.device_id, &session_token, &tokens)
            .await?;

        // An eviction that ran after the first check deletes the device before
        // its sessions, so a missing device here means the new session is orphaned.
        if let Err(e) = self.live_device(&identity).await {
            self.sessions.delete_by_token(&session_token).await?;
            return Err(e);
        }

        // A rotation counts as device activity.
        if let Err(e) = self
            .registry
            .heartbeat(identity.user_id, &identity.device_id, None, None)
            .await
        {
            warn!(device_id = %identity.device_id, error = %e, "activity update after refresh failed");
        }

        info!(user_id = identity.user_id, device_id = %identity.device_id, "refresh token rotated");
        Ok(tokens)
    }

    /// Strong check for sensitive routes: the session still exists and the
    /// device is live. Bounded by the liveness timeout.
    pub async fn verify_session(&self, identity: &Identity) -> Result<Device> {
        let device = self.live_device(identity).await?;
        self.current_session(identity).await?;
        Ok(device)
    }

    pub async fn logout(&self, identity: &Identity) -> Result<()> {
        let removed = self.sessions.delete_by_token(&identity.session_id).await?;
        if let Err(e) = self.registry.mark_offline(&identity.device_id).await {
            warn!(device_id = %identity.device_id, error = %e, "failed to mark device offline at logout");
        }
        info!(
            user_id = identity.user_id,
            device_id = %identity.device_id,
            session_found = removed,
            "session closed"
        );
        Ok(())
    }

    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = self.sessions.delete_expired(self.clock.now()).await?;
        debug!(removed = removed, "expired sessions swept");
        Ok(removed)
    }

    pub fn start(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        self.reaper.start(move || {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    if let Err(e) = manager.sweep_expired().await {
                        warn!(error = %e, "expired session sweep failed");
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        self.reaper.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.reaper.is_running()
    }

    async fn live_device(&self, identity: &Identity) -> Result<Device> {
        let check = self
            .registry
            .verify_device_live(identity.user_id, &identity.device_id);
        match tokio::time::timeout(self.config.liveness_timeout, check).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    user_id = identity.user_id,
                    device_id = %identity.device_id,
                    timeout_ms = self.config.liveness_timeout.as_millis() as u64,
                    "device liveness check timed out"
                );
                Err(AuthError::LivenessUnavailable.into())
            }
        }
    }

    async fn current_session(&self, identity: &Identity) -> Result<Session> {
        let session = self
            .sessions
            .get_by_token(&identity.session_id)
            .await?
            .ok_or(AppError::AuthError(AuthError::InvalidToken))?;
        if session.user_id != identity.user_id || session.device_id != identity.device_id {
            return Err(AuthError::SessionMismatch.into());
        }
        if session.is_expired_at(self.clock.now()) {
            return Err(AuthError::SessionExpired.into());
        }
        Ok(session)
    }

    async fn store_session(
        &self,
        user_id: i64,
        device_id: &str,
        session_token: &str,
        tokens: &TokenPair,
    ) -> Result<Session> {
        let now = self.clock.now();
        let session = Session {
            session_token: session_token.to_string(),
            user_id,
            device_id: device_id.to_string(),
            access_token: digest(&tokens.access_token),
            refresh_token: digest(&tokens.refresh_token),
            created_at: now,
            expires_at: now + self.config.refresh_ttl,
        };
        self.sessions.create_session(&session).await
    }

    fn new_session_token(&self) -> String {
        let mut bytes = [0u8; 32];
        self.random.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn generate_token(
        &self,
        kind: TokenKind,
        user_id: i64,
        device: &Device,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let ttl = match kind {
            TokenKind::Access => self.config.access_ttl,
            TokenKind::Refresh => self.config.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id.to_string(),
            did: device.device_id.clone(),
            dty: device.device_type,
            sid: session_id.to_string(),
            kind,
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }

    fn decode_token(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)?.claims;
        if claims.kind != expected {
            return Err(AuthError::InvalidToken.into());
        }
        if claims.exp <= self.clock.now().timestamp() {
            return Err(AuthError::SessionExpired.into());
        }
        Ok(claims)
    }
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
