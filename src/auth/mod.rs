// Authentication: stored user tokens, the device-code flow that creates
// them, and Google service accounts.

pub mod credential_store;
pub mod device_code;
pub mod oauth;
pub mod service_account;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{AppError, AppResult};

pub use credential_store::{Credential, CredentialStore, TOKEN_EXPIRY_SKEW_SECS};
pub use device_code::DeviceCode;
pub use oauth::{OAuthClient, OAuthEndpoints, TokenManager};
pub use service_account::{ServiceAccountAuth, ServiceAccountKey};

/// Anything that can hand the orchestrator a usable credential.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn credential(&self, now: DateTime<Utc>) -> AppResult<Credential>;
}

/// A fixed credential: used as-is while valid, never refreshed.
#[async_trait]
impl AccessTokenSource for Option<Credential> {
    async fn credential(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        match self {
            None => Err(AppError::auth("No credential available")),
            Some(credential) if credential.is_valid(now) => Ok(credential.clone()),
            Some(_) => Err(AppError::auth("Access token expired")),
        }
    }
}

#[async_trait]
impl AccessTokenSource for Credential {
    async fn credential(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        Some(self.clone()).credential(now).await
    }
}
