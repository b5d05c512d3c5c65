use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::{self, IMPERSONATION_COOKIE},
    error::{parse_body, AppError, FieldIssue},
    models::{Child, ExamType, ImpersonationGrant, Profile, Role, Subscription, SubscriptionTier},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateUserRequest {
    pub email: String,
    pub full_name: String,
    pub child_name: String,
    pub year_group: i16,
    pub exam_type: String,
    pub subscription_tier: Option<String>,
}

/// Checked form of [`CreateUserRequest`].
struct NewAccount {
    email: String,
    full_name: String,
    child_name: String,
    year_group: i16,
    exam_type: ExamType,
    tier: SubscriptionTier,
}

impl CreateUserRequest {
    fn validate(self) -> Result<NewAccount, AppError> {
        let mut issues = Vec::new();
        let email = self.email.trim().to_lowercase();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            issues.push(FieldIssue::new("email", "must be a valid email address"));
        }
        let full_name = self.full_name.trim().to_string();
        if full_name.is_empty() || full_name.len() > 100 {
            issues.push(FieldIssue::new("fullName", "must be 1 to 100 characters"));
        }
        let child_name = self.child_name.trim().to_string();
        if child_name.is_empty() || child_name.len() > 50 {
            issues.push(FieldIssue::new("childName", "must be 1 to 50 characters"));
        }
        if !(3..=6).contains(&self.year_group) {
            issues.push(FieldIssue::new("yearGroup", "must be between 3 and 6"));
        }
        let exam_type = self.exam_type.parse::<ExamType>().map_err(|e| {
            issues.push(FieldIssue::new("examType", e.to_string()));
        });
        let tier = match self.subscription_tier.as_deref() {
            None => Ok(SubscriptionTier::Free),
            Some(raw) => raw.parse::<SubscriptionTier>().map_err(|e| {
                issues.push(FieldIssue::new("subscriptionTier", e.to_string()));
            }),
        };

        match (exam_type, tier) {
            (Ok(exam_type), Ok(tier)) if issues.is_empty() => Ok(NewAccount {
                email,
                full_name,
                child_name,
                year_group: self.year_group,
                exam_type,
                tier,
            }),
            _ => Err(AppError::Validation(issues)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImpersonationRequest {
    pub user_id: Uuid,
}

pub async fn login_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: LoginRequest = parse_body(&body)?;
    let email = request.email.trim().to_lowercase();

    let user = state.store.find_auth_user_by_email(&email).await?;
    let stored = user
        .as_ref()
        .map_or(auth::DUMMY_PASSWORD_HASH, |u| u.password_hash.as_str())
        .to_string();
    let verified = tokio::task::spawn_blocking(move || auth::verify_password(&request.password, &stored))
        .await
        .context("password verification task failed")?;
    let user = match user {
        Some(user) if verified => user,
        Some(user) => {
            info!(user = %user.id, "login rejected");
            return Err(AppError::Unauthorized);
        }
        None => {
            info!("login rejected for unknown email");
            return Err(AppError::Unauthorized);
        }
    };
    let profile = state
        .store
        .find_profile(user.id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let token = auth::generate_token();
    let expires_at = Utc::now() + Duration::hours(state.config.session_ttl_hours);
    state
        .store
        .create_session(&auth::hash_token(&token), user.id, expires_at)
        .await?;
    info!(user = %user.id, email = %user.email, role = %profile.role, "login succeeded");

    Ok(Json(json!({
        "success": true,
        "token": token,
        "expiresAt": expires_at,
        "user": profile,
    })))
}

pub async fn create_user_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = auth::authenticate(state.store.as_ref(), &headers, Utc::now()).await?;
    ctx.require_admin()?;
    let account = parse_body::<CreateUserRequest>(&body)?.validate()?;

    if state
        .store
        .find_auth_user_by_email(&account.email)
        .await?
        .is_some()
    {
        return Err(AppError::invalid("email", "an account with this email already exists"));
    }

    let temporary_password = auth::generate_temporary_password();
    let to_hash = temporary_password.clone();
    let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&to_hash))
        .await
        .context("password hashing task failed")?;
    let user_id = state
        .store
        .create_auth_user(&account.email, &password_hash)
        .await?;

    let mut subscription = Subscription::free();
    subscription.tier = account.tier;
    let profile = Profile {
        id: user_id,
        full_name: account.full_name,
        email: account.email,
        role: Role::Parent,
        subscription,
    };
    let child = Child {
        id: Uuid::new_v4(),
        parent_id: user_id,
        name: account.child_name,
        year_group: account.year_group,
        exam_type: account.exam_type,
        avatar: None,
        is_active: true,
        created_at: Utc::now(),
    };

    let provisioned = async {
        state.store.insert_profile(&profile).await?;
        state.store.insert_child(&child).await
    }
    .await;
    if let Err(e) = provisioned {
        // Only the auth user is rolled back; a profile written before the failure stays behind.
        error!(user = %user_id, error = ?e, "user provisioning failed, removing auth user");
        if let Err(cleanup) = state.store.delete_auth_user(user_id).await {
            warn!(user = %user_id, error = ?cleanup, "rollback of auth user failed");
        }
        return Err(e.into());
    }

    info!(admin = %ctx.actor.id, user = %user_id, "provisioned parent account");
    Ok(Json(json!({
        "success": true,
        "user": profile,
        "child": child,
        "temporaryPassword": temporary_password,
    })))
}

pub async fn start_impersonation_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let now = Utc::now();
    let ctx = auth::authenticate(state.store.as_ref(), &headers, now).await?;
    ctx.require_admin()?;
    let request: ImpersonationRequest = parse_body(&body)?;

    if request.user_id == ctx.actor.id {
        return Err(AppError::invalid("userId", "cannot impersonate yourself"));
    }
    let target = state
        .store
        .find_profile(request.user_id)
        .await?
        .ok_or(AppError::NotFound("User"))?;
    if target.role.is_admin() && ctx.actor.role != Role::SuperAdmin {
        warn!(admin = %ctx.actor.id, target = %target.id, "admin tried to impersonate an admin");
        return Err(AppError::Forbidden);
    }

    let token = auth::generate_token();
    let ttl = Duration::minutes(state.config.impersonation_ttl_minutes);
    let grant = ImpersonationGrant {
        admin_id: ctx.actor.id,
        target_user_id: target.id,
        expires_at: now + ttl,
        revoked: false,
    };
    state
        .store
        .create_impersonation(&auth::hash_token(&token), &grant)
        .await?;
    info!(admin = %ctx.actor.id, target = %target.id, "impersonation started");

    let body = Json(json!({
        "success": true,
        "impersonating": target,
        "expiresAt": grant.expires_at,
    }));
    Ok((
        [(SET_COOKIE, auth::impersonation_cookie(&token, ttl.num_seconds()))],
        body,
    )
        .into_response())
}

pub async fn stop_impersonation_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let ctx = auth::authenticate(state.store.as_ref(), &headers, Utc::now()).await?;
    ctx.require_admin()?;

    let revoked = match auth::cookie_value(&headers, IMPERSONATION_COOKIE) {
        Some(token) => state.store.revoke_impersonation(&auth::hash_token(&token)).await?,
        None => false,
    };
    info!(admin = %ctx.actor.id, revoked, "impersonation ended");

    Ok((
        [(SET_COOKIE, auth::clear_impersonation_cookie())],
        Json(json!({"success": true, "revoked": revoked})),
    )
        .into_response())
}
