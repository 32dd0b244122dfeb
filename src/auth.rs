//! Dashboard accounts and signed session tokens.
//!
//! Passwords are stored as `hex(sha256^N(salt || password))` with a random
//! per-user salt. Tokens have the form `<hex(username)>.<expiry>.<signature>`
//! where the signature is HMAC-SHA256 over the first two parts.

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::db;

type HmacSha256 = Hmac<Sha256>;

const HASH_ROUNDS: usize = 10_000;

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..HASH_ROUNDS {
        digest = Sha256::new()
            .chain_update(salt.as_bytes())
            .chain_update(digest)
            .finalize();
    }
    hex::encode(digest)
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    let actual = hash_password(password, salt);
    // Constant-time comparison over equal-length hex strings
    actual.len() == expected_hash.len()
        && actual
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn new_mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid token secret: {}", e))
}

fn sign(secret: &str, payload: &str) -> Result<Vec<u8>> {
    let mut mac = new_mac(secret)?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn issue_token(secret: &str, username: &str, expires_at: i64) -> Result<String> {
    let payload = format!("{}.{}", hex::encode(username), expires_at);
    let signature = sign(secret, &payload)?;
    Ok(format!("{}.{}", payload, hex::encode(signature)))
}

/// Returns the username when the token is authentic and unexpired.
pub fn verify_token(secret: &str, token: &str, now: i64) -> Result<String> {
    let mut parts = token.splitn(3, '.');
    let (Some(user_hex), Some(expiry), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed token");
    };

    let mut mac = new_mac(secret)?;
    mac.update(format!("{}.{}", user_hex, expiry).as_bytes());
    let signature = hex::decode(signature)?;
    if mac.verify_slice(&signature).is_err() {
        bail!("invalid token signature");
    }

    let expires_at: i64 = expiry.parse()?;
    if expires_at < now {
        bail!("token expired");
    }
    Ok(String::from_utf8(hex::decode(user_hex)?)?)
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserInfo,
}

pub async fn create_user(pool: &SqlitePool, username: &str, password: &str) -> Result<()> {
    let salt = Uuid::new_v4().simple().to_string();
    let hash = hash_password(password, &salt);
    sqlx::query(
        "INSERT INTO users (username, password_hash, salt, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(username)
    .bind(hash)
    .bind(salt)
    .bind(db::now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

/// Seeds the bootstrap account when it does not exist yet.
pub async fn ensure_admin(pool: &SqlitePool, config: &AuthConfig) -> Result<()> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE username = ?")
        .bind(&config.admin_username)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        create_user(pool, &config.admin_username, &config.admin_password).await?;
        info!(username = %config.admin_username, "created bootstrap account");
    }
    Ok(())
}

/// `None` when the credentials do not match.
pub async fn login(
    pool: &SqlitePool,
    config: &AuthConfig,
    username: &str,
    password: &str,
) -> Result<Option<LoginResponse>> {
    let row = sqlx::query("SELECT id, username, password_hash, salt FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let hash: String = row.get("password_hash");
    let salt: String = row.get("salt");
    if !verify_password(password, &salt, &hash) {
        return Ok(None);
    }

    let expires_at = chrono::Utc::now().timestamp() + config.token_ttl_secs;
    let user = UserInfo {
        id: row.get("id"),
        username: row.get("username"),
    };
    let token = issue_token(&config.secret(), &user.username, expires_at)?;
    Ok(Some(LoginResponse { token, user }))
}
