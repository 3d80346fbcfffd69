//! Password hashing, session tokens, and the request extractors that
//! resolve the signed-in user.
//!
//! Tokens are HS256 JWTs carried in the `auth_token` cookie or an
//! `Authorization: Bearer` header. Passwords are stored as PBKDF2-SHA256
//! PHC strings (`$pbkdf2-sha256$i=...,l=32$<salt>$<hash>`).

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use cookie::time::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::Pbkdf2;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::api::{ApiError, SharedState};
use super::models::{Permission, Role, User};
use crate::errors::ShopError;

pub const AUTH_COOKIE: &str = "auth_token";
pub const REF_COOKIE: &str = "ref_code";

const PBKDF2_ROUNDS: u32 = if cfg!(test) { 1_000 } else { 100_000 };
const MIN_PASSWORD_LEN: usize = 8;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

// ── Passwords ────────────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| anyhow!("Failed to encode password salt: {}", e))?;
    let params = pbkdf2::Params {
        rounds: PBKDF2_ROUNDS,
        output_length: 32,
    };
    let hash = Pbkdf2
        .hash_password_customized(password.as_bytes(), None, None, params, &salt)
        .map_err(|e| anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored hash. Malformed hashes never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok())
        .unwrap_or(false)
}

pub fn validate_password(password: &str) -> Result<(), ShopError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ShopError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), ShopError> {
    if !EMAIL_RE.is_match(email.trim()) {
        return Err(ShopError::Validation(format!("'{}' is not a valid email", email)));
    }
    Ok(())
}

// ── Tokens ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies session tokens.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenKeys {
    pub fn new(secret: &str, ttl_hours: u32) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_secs: i64::from(ttl_hours) * 3600,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn issue(&self, user: &User) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        self.sign(&Claims {
            sub: user.id,
            role: user.role,
            iat: now,
            exp: now + self.ttl_secs,
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| anyhow!("Failed to sign session token: {}", e))
    }

    /// Verify signature and expiry; any failure is `Unauthorized`.
    pub fn verify(&self, token: &str) -> Result<Claims, ShopError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| ShopError::Unauthorized)
    }
}

// ── Cookies ──────────────────────────────────────────────────────────

pub fn session_cookie(token: String, max_age_secs: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(Duration::seconds(max_age_secs))
        .build()
}

pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    session_cookie(String::new(), 0, secure)
}

pub fn referral_cookie(code: String, days: u32) -> Cookie<'static> {
    Cookie::build((REF_COOKIE, code))
        .path("/")
        .same_site(SameSite::Lax)
        .max_age(Duration::days(i64::from(days)))
        .build()
}

/// Non-empty value of cookie `name`.
pub fn cookie_value(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

// ── Extractors ───────────────────────────────────────────────────────

/// The signed-in, active user. Rejects with 401 or 403.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| cookie_value(&CookieJar::from_headers(&parts.headers), AUTH_COOKIE))
            .ok_or(ShopError::Unauthorized)?;
        let claims = state.tokens.verify(&token)?;
        let user = state
            .db
            .call(move |db| db.get_user(claims.sub))
            .await?
            .ok_or(ShopError::Unauthorized)?;
        if !user.active {
            return Err(ShopError::Forbidden("Account is disabled".into()).into());
        }
        Ok(AuthUser(user))
    }
}

impl AuthUser {
    /// Require a back-office permission.
    pub async fn require(&self, state: &SharedState, permission: Permission) -> Result<(), ApiError> {
        let user = self.0.clone();
        let allowed = state
            .db
            .call(move |db| db.has_permission(&user, permission))
            .await?;
        if !allowed {
            return Err(ShopError::Forbidden(format!("Missing '{}' permission", permission)).into());
        }
        Ok(())
    }

    /// Require an admin or staff account.
    pub fn require_back_office(&self) -> Result<(), ApiError> {
        if !self.0.role.is_back_office() {
            return Err(ShopError::Forbidden("Back-office access only".into()).into());
        }
        Ok(())
    }

    /// Require a role that may own affiliate links.
    pub fn require_referrer(&self) -> Result<(), ApiError> {
        if !self.0.role.can_refer() {
            return Err(ShopError::Forbidden("Affiliate program members only".into()).into());
        }
        Ok(())
    }
}
