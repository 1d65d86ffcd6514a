/*!
 * JWT authentication with rotating refresh tokens.
 *
 * Access tokens are short-lived and stateless. Refresh tokens are
 * single-use: each user row stores the id of the one refresh token that
 * is currently valid, and a refresh rotates it. Logout clears the stored
 * id, which invalidates any refresh token still in the wild.
 */

use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{
    extract::FromRef,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{user, User, UserModel, UserRole},
    errors::ServiceError,
    events::{Event, EventSender},
};

const TOKEN_USE_ACCESS: &str = "access";
const TOKEN_USE_REFRESH: &str = "refresh";

/// Claims carried by both access and refresh tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: UserRole,
    pub token_use: String,
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

/// Token pair response
#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

/// A signed-in user together with fresh tokens
#[derive(Debug, Serialize)]
pub struct AuthSession {
    pub user: UserModel,
    pub tokens: TokenPair,
}

/// Authentication configuration
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub admin_signup_key: Option<String>,
}

impl AuthConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            jwt_secret: config.jwt_secret.clone(),
            access_ttl_secs: config.jwt_expiration as i64,
            refresh_ttl_secs: config.refresh_token_expiration as i64,
            admin_signup_key: config.admin_signup_key.clone(),
        }
    }
}

/// Signup, login, refresh and logout against the users table.
#[derive(Clone)]
pub struct AuthService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    admin_signup_key: Option<String>,
}

impl AuthService {
    pub fn new(
        config: AuthConfig,
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            event_sender,
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
            admin_signup_key: config.admin_signup_key,
        }
    }

    /// Register a new account.
    ///
    /// Presenting the configured admin signup key grants the admin role;
    /// anything else, including no key at all, registers a regular user.
    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn signup(&self, input: SignupInput) -> Result<AuthSession, ServiceError> {
        let email = normalize_email(&input.email);

        let existing = User::find()
            .filter(user::Column::Email.eq(email.as_str()))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "an account with this email already exists".to_string(),
            ));
        }

        let role = if self
            .admin_signup_key
            .as_deref()
            .is_some_and(|key| input.admin_key.as_deref() == Some(key))
        {
            UserRole::Admin
        } else {
            UserRole::User
        };

        let password_hash = hash_password(&input.password)?;

        let now = Utc::now();
        let created = user::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email),
            password_hash: Set(password_hash),
            role: Set(role),
            refresh_token_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(user_id = %created.id, role = ?created.role, "Registered new user");
        self.event_sender
            .send_or_log(Event::UserRegistered(created.id))
            .await;

        let tokens = self.issue_token_pair(&created).await?;
        Ok(AuthSession {
            user: created,
            tokens,
        })
    }

    /// Exchange credentials for a token pair.
    ///
    /// Unknown email and wrong password produce the same answer so the
    /// endpoint cannot be used to probe which addresses have accounts.
    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn login(&self, input: LoginInput) -> Result<AuthSession, ServiceError> {
        let email = normalize_email(&input.email);

        let account = User::find()
            .filter(user::Column::Email.eq(email.as_str()))
            .one(&*self.db)
            .await?;

        let Some(account) = account else {
            return Err(invalid_credentials());
        };
        if !verify_password(&input.password, &account.password_hash)? {
            return Err(invalid_credentials());
        }

        info!(user_id = %account.id, "User logged in");
        let tokens = self.issue_token_pair(&account).await?;
        Ok(AuthSession {
            user: account,
            tokens,
        })
    }

    /// Trade a refresh token for a fresh pair, rotating the stored id.
    ///
    /// A refresh token that was already rotated out, or that survived a
    /// logout, no longer matches the stored id and is refused.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ServiceError> {
        let claims = self.decode_claims(refresh_token)?;
        if claims.token_use != TOKEN_USE_REFRESH {
            return Err(ServiceError::Unauthorized(
                "not a refresh token".to_string(),
            ));
        }

        let account = User::find_by_id(claims.sub)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("invalid refresh token".to_string()))?;

        if account.refresh_token_id != Some(claims.jti) {
            return Err(ServiceError::Unauthorized(
                "refresh token is no longer valid".to_string(),
            ));
        }

        info!(user_id = %account.id, "Rotated refresh token");
        self.issue_token_pair(&account).await
    }

    /// Drop the stored refresh token id so outstanding refresh tokens die.
    /// Succeeds whether or not the user had one.
    #[instrument(skip(self))]
    pub async fn logout(&self, user_id: Uuid) -> Result<(), ServiceError> {
        User::update_many()
            .col_expr(user::Column::RefreshTokenId, Expr::value(None::<Uuid>))
            .filter(user::Column::Id.eq(user_id))
            .exec(&*self.db)
            .await?;

        info!(user_id = %user_id, "User logged out");
        Ok(())
    }

    /// Validate an access token for request authentication.
    pub fn validate_access_token(&self, token: &str) -> Result<Claims, ServiceError> {
        let claims = self.decode_claims(token)?;
        if claims.token_use != TOKEN_USE_ACCESS {
            return Err(ServiceError::Unauthorized(
                "not an access token".to_string(),
            ));
        }
        Ok(claims)
    }

    async fn issue_token_pair(&self, account: &UserModel) -> Result<TokenPair, ServiceError> {
        let refresh_jti = Uuid::new_v4();

        let access_token =
            self.sign_claims(account, TOKEN_USE_ACCESS, self.access_ttl_secs, Uuid::new_v4())?;
        let refresh_token =
            self.sign_claims(account, TOKEN_USE_REFRESH, self.refresh_ttl_secs, refresh_jti)?;

        let mut active: user::ActiveModel = account.clone().into();
        active.refresh_token_id = Set(Some(refresh_jti));
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl_secs,
            refresh_expires_in: self.refresh_ttl_secs,
        })
    }

    fn sign_claims(
        &self,
        account: &UserModel,
        token_use: &str,
        ttl_secs: i64,
        jti: Uuid,
    ) -> Result<String, ServiceError> {
        let now = Utc::now();
        let claims = Claims {
            sub: account.id,
            email: account.email.clone(),
            role: account.role,
            token_use: token_use.to_string(),
            jti,
            iat: now.timestamp(),
            exp: (now + ChronoDuration::seconds(ttl_secs)).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ServiceError::InternalError(format!("token creation failed: {}", e)))
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, ServiceError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ServiceError::Unauthorized("token has expired".to_string())
                }
                _ => ServiceError::Unauthorized("invalid authentication token".to_string()),
            })
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn invalid_credentials() -> ServiceError {
    ServiceError::Unauthorized("invalid email or password".to_string())
}

fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServiceError::HashError(e.to_string()))
}

fn verify_password(password: &str, stored_hash: &str) -> Result<bool, ServiceError> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| ServiceError::HashError(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Signup request payload
#[derive(Debug, Deserialize)]
pub struct SignupInput {
    pub email: String,
    pub password: String,
    pub admin_key: Option<String>,
}

/// Login request payload
#[derive(Debug, Deserialize)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

/// Authenticated user extracted from a bearer token
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    Arc<AuthService>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = Arc::<AuthService>::from_ref(state);
        let token = bearer_token(parts)?;
        let claims = auth.validate_access_token(token)?;

        Ok(AuthUser {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }
}

/// Extractor that additionally requires the admin role
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    Arc<AuthService>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ServiceError::Forbidden(
                "admin access required".to_string(),
            ));
        }
        Ok(AdminUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, ServiceError> {
    let header = parts
        .headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ServiceError::Unauthorized("missing authentication token".to_string()))?;

    let value = header
        .to_str()
        .map_err(|_| ServiceError::Unauthorized("invalid authorization header".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized("invalid authorization header".to_string()))
}
