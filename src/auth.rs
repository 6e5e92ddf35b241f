// Authentication: password hashing, temporary credentials, JWT tokens and role extractors.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── JWT ──────────────────────────────────────────────────────────────

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_COMPANY: &str = "company";
pub const ROLE_TEAM: &str = "team";

/// Signing keys derived from the configured secret.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: i64, // 0 for the admin
    pub role: String,
    pub exp: usize, // expiry (unix timestamp)
    #[serde(default)]
    pub reset_required: bool,
}

pub fn create_token(
    keys: &JwtKeys,
    subject: i64,
    role: &str,
    ttl: chrono::Duration,
    reset_required: bool,
) -> Result<String, String> {
    let expiration = chrono::Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| "Token expiry out of range".to_string())?
        .timestamp() as usize;

    let claims = Claims {
        sub: subject,
        role: role.to_string(),
        exp: expiration,
        reset_required,
    };

    encode(&Header::default(), &claims, &keys.encoding)
        .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(keys: &JwtKeys, token: &str) -> Result<Claims, String> {
    decode::<Claims>(token, &keys.decoding, &Validation::default())
        .map(|data| data.claims)
        .map_err(|e| format!("Invalid token: {e}"))
}

// ── Password hashing ─────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Random alphanumeric password handed out by mail.
pub fn generate_temporary_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// ── Axum extractors ──────────────────────────────────────────────────

type Rejection = (StatusCode, Json<serde_json::Value>);

fn reject(status: StatusCode, msg: &str) -> Rejection {
    (status, Json(serde_json::json!({ "error": msg })))
}

/// Validate the bearer token against the keys placed in request extensions.
fn bearer_claims(parts: &Parts) -> Result<Claims, Rejection> {
    let auth_header = parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        reject(
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format",
        )
    })?;

    let keys = parts.extensions.get::<Arc<JwtKeys>>().ok_or_else(|| {
        tracing::error!("JWT keys missing from request extensions");
        reject(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    verify_token(keys, token).map_err(|_| reject(StatusCode::UNAUTHORIZED, "Invalid token"))
}

fn require_role(claims: &Claims, role: &str) -> Result<(), Rejection> {
    if claims.role == role {
        Ok(())
    } else {
        Err(reject(StatusCode::FORBIDDEN, "Access denied"))
    }
}

/// An authenticated administrator.
#[derive(Debug, Clone)]
pub struct AdminUser(pub Claims);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts)?;
        require_role(&claims, ROLE_ADMIN)?;
        Ok(AdminUser(claims))
    }
}

/// A company whose temporary password has been replaced.
/// Companies still on a temporary password are refused with `PASSWORD_RESET_REQUIRED`.
#[derive(Debug, Clone)]
pub struct CompanyUser(pub Claims);

impl<S> FromRequestParts<S> for CompanyUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts)?;
        require_role(&claims, ROLE_COMPANY)?;
        if claims.reset_required {
            return Err(reject(StatusCode::FORBIDDEN, "PASSWORD_RESET_REQUIRED"));
        }
        Ok(CompanyUser(claims))
    }
}

/// A company in any credential state. Only the password change route uses this.
#[derive(Debug, Clone)]
pub struct AnyCompanyUser(pub Claims);

impl<S> FromRequestParts<S> for AnyCompanyUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts)?;
        require_role(&claims, ROLE_COMPANY)?;
        Ok(AnyCompanyUser(claims))
    }
}

/// An authenticated team.
#[derive(Debug, Clone)]
pub struct TeamUser(pub Claims);

impl<S> FromRequestParts<S> for TeamUser
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = bearer_claims(parts)?;
        require_role(&claims, ROLE_TEAM)?;
        Ok(TeamUser(claims))
    }
}
