use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};
use crate::models::ProviderKind;

/// Tokens this close to expiry are treated as already expired.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub provider: ProviderKind,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        provider: ProviderKind,
        access_token: &str,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider,
            access_token: Some(access_token.to_string()),
            refresh_token,
            expires_at,
        }
    }

    /// Valid iff an access token is present and `now < expires_at - skew`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let has_token = self
            .access_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        has_token && now < self.expires_at - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    pub fn bearer(&self) -> AppResult<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::auth("Credential has no access token"))
    }
}

/// On-disk token layout. `expires_at` is unix seconds; unknown fields from
/// raw token responses are ignored.
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: f64,
}

/// Persists one provider's credential as a JSON token file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    provider: ProviderKind,
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(provider: ProviderKind, path: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            path: path.into(),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> AppResult<Option<Credential>> {
        if !self.path.exists() {
            log::debug!("No token file at {}", self.path.display());
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)?;
        let token: TokenFile = match serde_json::from_str(&contents) {
            Ok(token) => token,
            Err(e) => {
                log::error!(
                    "Failed to parse token file {}: {}",
                    self.path.display(),
                    e
                );
                return Ok(None);
            }
        };

        // A missing expiry reads as the epoch, i.e. already expired
        let expires_at =
            DateTime::from_timestamp_millis((token.expires_at * 1000.0).round() as i64)
                .unwrap_or_default();

        log::info!("Tokens loaded from {}", self.path.display());
        Ok(Some(Credential {
            provider: self.provider,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at,
        }))
    }

    /// Written to a sibling `.json.tmp` file, then renamed over the old one.
    pub fn save(&self, credential: &Credential) -> AppResult<()> {
        if credential.provider != self.provider {
            return Err(AppError::Internal(format!(
                "Refusing to store a {} credential in the {} token file",
                credential.provider, self.provider
            )));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let token = TokenFile {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            expires_at: credential.expires_at.timestamp_millis() as f64 / 1000.0,
        };
        let contents = serde_json::to_string_pretty(&token)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;

        log::info!("Tokens saved to {}", self.path.display());
        Ok(())
    }

    pub fn clear(&self) -> AppResult<bool> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            log::info!("Removed token file {}", self.path.display());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
