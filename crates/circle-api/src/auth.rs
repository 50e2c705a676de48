use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use jsonwebtoken::{EncodingKey, Header, encode};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use circle_db::migrations::DEFAULT_ROLE_NAME;
use circle_db::{Database, users};
use circle_types::api::{ApiResponse, AuthResponse, AuthUser, Claims, LoginRequest, RegisterRequest};

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

const MIN_PASSWORD_LEN: usize = 8;
const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=64;
const MAX_DISPLAY_NAME_LEN: usize = 100;

/// Token settings shared by sign-up and sign-in.
pub struct TokenConfig<'a> {
    pub secret: &'a str,
    pub ttl_hours: i64,
}

pub fn register_user(
    db: &Database,
    tokens: &TokenConfig<'_>,
    req: RegisterRequest,
) -> ApiResult<AuthResponse> {
    let email = req.email.trim().to_lowercase();
    if !looks_like_email(&email) {
        return Err(ApiError::validation("A valid email is required"));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let username = match req.username.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => derive_username(&email),
    };
    if !USERNAME_LEN.contains(&username.chars().count()) {
        return Err(ApiError::validation("Username must be between 3 and 64 characters"));
    }

    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    if display_name.is_some_and(|name| name.chars().count() > MAX_DISPLAY_NAME_LEN) {
        return Err(ApiError::validation("Display name must be at most 100 characters"));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();

    let user_id = Uuid::new_v4();
    let role = db.with_tx(|tx| {
        users::insert_user(
            tx,
            &users::NewUser {
                id: user_id,
                username: &username,
                display_name,
                email: &email,
                password_hash: &password_hash,
            },
        )?;
        let role = users::find_role_by_name(tx, DEFAULT_ROLE_NAME)?
            .ok_or_else(|| anyhow::anyhow!("default role {} is missing", DEFAULT_ROLE_NAME))?;
        users::assign_role(tx, user_id, role.id)?;
        Ok::<_, ApiError>(role)
    })?;

    info!("Registered {} ({})", username, user_id);

    let roles = vec![role.name];
    let token = create_token(tokens, user_id, &username, &roles)?;

    Ok(AuthResponse {
        token,
        user: AuthUser {
            id: user_id,
            username,
            email,
            display_name: display_name.map(str::to_string),
            roles,
        },
    })
}

pub fn login_user(
    db: &Database,
    tokens: &TokenConfig<'_>,
    req: LoginRequest,
) -> ApiResult<AuthResponse> {
    let invalid = || ApiError::Unauthorized("Invalid username or password".into());

    let (user, roles) = db.with_conn(|conn| {
        let Some(user) = users::find_user_by_username(conn, req.username.trim())? else {
            return Ok::<_, ApiError>((None, vec![]));
        };
        let roles = users::populate_roles(conn, users::role_refs(conn, user.id)?)?;
        Ok((Some(user), roles))
    })?;
    let user = user.ok_or_else(invalid)?;

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("stored hash for {} is unreadable: {}", user.id, e))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| invalid())?;

    if user.is_deleted {
        return Err(ApiError::forbidden("This account has been deleted"));
    }
    if user.is_locked {
        return Err(ApiError::forbidden("This account is locked"));
    }

    let roles: Vec<String> = roles
        .iter()
        .filter_map(|role| role.name().map(str::to_string))
        .collect();
    let token = create_token(tokens, user.id, &user.username, &roles)?;

    Ok(AuthResponse {
        token,
        user: AuthUser {
            id: user.id,
            username: user.username,
            email: user.email,
            display_name: user.display_name,
            roles,
        },
    })
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let response = blocking(move || {
        let tokens = TokenConfig {
            secret: &state.jwt_secret,
            ttl_hours: state.token_ttl_hours,
        };
        register_user(&state.db, &tokens, req)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok_with_message("Account created", response)),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let response = blocking(move || {
        let tokens = TokenConfig {
            secret: &state.jwt_secret,
            ttl_hours: state.token_ttl_hours,
        };
        login_user(&state.db, &tokens, req)
    })
    .await?;

    Ok(Json(ApiResponse::ok(response)))
}

/// `user-<n>` where n is the first 32 bits of SHA-256(email).
pub fn derive_username(email: &str) -> String {
    let digest = Sha256::digest(email.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("user-{}", n)
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

fn create_token(
    tokens: &TokenConfig<'_>,
    user_id: Uuid,
    username: &str,
    roles: &[String],
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        roles: roles.to_vec(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(tokens.ttl_hours)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(tokens.secret.as_bytes()),
    )?;

    Ok(token)
}
