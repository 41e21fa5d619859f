//! Email/password login and bearer tokens for the record service.
//!
//! Passwords are stored as Argon2id PHC strings in the `password_hash` field of
//! user records. Tokens are HS256 JWTs naming the user id and role.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Role, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{LoginRequest, LoginResponse},
};
use tracing::{info, warn};

use crate::{decode_body, internal, ApiContext, PASSWORD_HASH_FIELD};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId(self.sub)
    }
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// `Ok(false)` on mismatch; `Err` only when the stored hash is unreadable.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn validate_password_strength(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("password must be at least {MIN_PASSWORD_LEN} characters long"),
        ));
    }
    Ok(())
}

pub fn issue_token(cfg: &AuthConfig, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.0,
        role: user.role,
        iat: now.timestamp(),
        exp: (now + Duration::seconds(cfg.token_ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
}

pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|err| ApiError::new(ErrorCode::Unauthorized, format!("invalid token: {err}")))
}

pub async fn login(ctx: &ApiContext, req: &LoginRequest) -> Result<LoginResponse, ApiError> {
    let rejected = || ApiError::new(ErrorCode::Unauthorized, "invalid email or password");

    let email = req.email.trim().to_ascii_lowercase();
    let records = ctx
        .storage
        .list_records("users")
        .await
        .map_err(internal)?;
    let record = records
        .into_iter()
        .find(|record| {
            record
                .body
                .get("email")
                .and_then(|value| value.as_str())
                .is_some_and(|candidate| candidate.eq_ignore_ascii_case(&email))
        })
        .ok_or_else(rejected)?;

    let Some(hash) = record
        .body
        .get(PASSWORD_HASH_FIELD)
        .and_then(|value| value.as_str())
        .map(str::to_owned)
    else {
        warn!(user_id = record.id, "login attempted for user without password");
        return Err(rejected());
    };
    let matches = verify_password(&req.password, &hash)
        .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string()))?;
    if !matches {
        return Err(rejected());
    }

    let user: User = decode_body("users", record.body)?;
    let token = issue_token(&ctx.auth, &user)
        .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string()))?;
    info!(user_id = user.id.0, "user logged in");
    Ok(LoginResponse { token, user })
}

/// The user a verified token was issued to.
pub async fn current_user(ctx: &ApiContext, claims: &Claims) -> Result<User, ApiError> {
    let record = ctx
        .storage
        .load_record("users", claims.sub)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "token user no longer exists"))?;
    decode_body("users", record.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".into(),
            token_ttl_seconds: 60,
        }
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("correct-horse-battery").expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct-horse-battery", &hash).expect("verify"));
        assert!(!verify_password("wrong-password", &hash).expect("verify"));
    }

    #[test]
    fn short_passwords_are_rejected() {
        let err = validate_password_strength("short").expect_err("too short");
        assert_eq!(err.code, ErrorCode::Validation);
        assert!(validate_password_strength("long-enough").is_ok());
    }

    #[test]
    fn issued_token_verifies_with_same_secret_only() {
        let user = User {
            id: UserId(9),
            email: "admin@example.test".into(),
            full_name: "Admin".into(),
            role: Role::Admin,
        };
        let token = issue_token(&config(), &user).expect("token");
        let claims = verify_token(&config(), &token).expect("claims");
        assert_eq!(claims.user_id(), UserId(9));
        assert_eq!(claims.role, Role::Admin);

        let other = AuthConfig {
            jwt_secret: "other-secret".into(),
            token_ttl_seconds: 60,
        };
        let err = verify_token(&other, &token).expect_err("wrong secret");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }
}
