//! Per-request identity: bearer sessions, role checks and admin impersonation.
//!
//! Handlers call [`authenticate`] and thread the returned [`AuthContext`] through
//! whatever they do next. Nothing about the caller is kept outside that value.

use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap,
};
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::{distr::Alphanumeric, Rng, RngCore};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::AppError;
use crate::models::{Child, Profile};
use crate::store::Store;

pub const IMPERSONATION_COOKIE: &str = "impersonation_token";
const PBKDF2_ROUNDS: u32 = 100_000;
const TEMPORARY_PASSWORD_LEN: usize = 14;

/// Verified against when no account matches, so unknown emails cost the same PBKDF2 work.
pub const DUMMY_PASSWORD_HASH: &str = concat!(
    "pbkdf2-sha256$100000$",
    "5f1d0c2a9e8b7d6c5f4e3d2c1b0a9f8e$",
    "0000000000000000000000000000000000000000000000000000000000000000",
);

#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The signed-in account.
    pub actor: Profile,
    /// Who requests act as; differs from `actor` only while impersonating.
    pub effective: Profile,
    pub impersonating: bool,
}

impl AuthContext {
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.actor.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    pub fn can_view_child(&self, child: &Child) -> bool {
        child.parent_id == self.effective.id || (!self.impersonating && self.actor.role.is_admin())
    }
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Tokens are only ever stored as their SHA-256 digest.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn generate_temporary_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TEMPORARY_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub fn hash_password(password: &str) -> String {
    hash_password_with_rounds(password, PBKDF2_ROUNDS)
}

pub(crate) fn hash_password_with_rounds(password: &str, rounds: u32) -> String {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut key);
    format!(
        "pbkdf2-sha256${rounds}${}${}",
        hex::encode(salt),
        hex::encode(key)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, rounds, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != "pbkdf2-sha256" {
        return false;
    }
    let (Ok(rounds), Ok(salt), Ok(expected)) =
        (rounds.parse::<u32>(), hex::decode(salt), hex::decode(expected))
    else {
        return false;
    };

    let mut key = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut key);
    key.iter()
        .zip(expected.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
        && !expected.is_empty()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

pub fn impersonation_cookie(token: &str, max_age_secs: i64) -> String {
    format!(
        "{IMPERSONATION_COOKIE}={token}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={max_age_secs}"
    )
}

pub fn clear_impersonation_cookie() -> String {
    format!("{IMPERSONATION_COOKIE}=; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=0")
}

async fn impersonated_profile(
    store: &dyn Store,
    headers: &HeaderMap,
    actor: &Profile,
    now: DateTime<Utc>,
) -> Result<Option<Profile>, AppError> {
    if !actor.role.is_admin() {
        return Ok(None);
    }
    let Some(token) = cookie_value(headers, IMPERSONATION_COOKIE) else {
        return Ok(None);
    };
    let Some(grant) = store.find_impersonation(&hash_token(&token)).await? else {
        debug!(admin = %actor.id, "ignoring unknown impersonation token");
        return Ok(None);
    };
    if grant.revoked || grant.expires_at <= now || grant.admin_id != actor.id {
        debug!(admin = %actor.id, "ignoring stale impersonation token");
        return Ok(None);
    }
    Ok(store.find_profile(grant.target_user_id).await?)
}

pub async fn authenticate(
    store: &dyn Store,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<AuthContext, AppError> {
    let token = bearer_token(headers).ok_or(AppError::Unauthorized)?;
    let session = store
        .find_session(&hash_token(token))
        .await?
        .filter(|s| s.expires_at > now)
        .ok_or(AppError::Unauthorized)?;
    let actor = store
        .find_profile(session.user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    match impersonated_profile(store, headers, &actor, now).await? {
        Some(effective) => Ok(AuthContext {
            actor,
            effective,
            impersonating: true,
        }),
        None => Ok(AuthContext {
            effective: actor.clone(),
            actor,
            impersonating: false,
        }),
    }
}
