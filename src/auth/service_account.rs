use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::credential_store::Credential;
use super::oauth::{OAuthErrorBody, TokenResponse};
use super::AccessTokenSource;
use crate::errors::{AppError, AppResult};
use crate::models::ProviderKind;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The subset of a Google service-account key file we need.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Err(AppError::config(format!(
                "Service account key file not found at {}. Please download it from Google Cloud Console.",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> AppResult<Self> {
        let raw: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| AppError::config(format!("Service account key is not JSON: {}", e)))?;

        let required_fields = ["type", "client_email", "token_uri", "private_key"];
        let missing: Vec<&str> = required_fields
            .iter()
            .copied()
            .filter(|field| raw.get(field).and_then(|v| v.as_str()).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::config(format!(
                "Service account key is invalid. Missing fields: {:?}",
                missing
            )));
        }

        let key: ServiceAccountKey = serde_json::from_value(raw)?;
        if key.key_type != "service_account" {
            return Err(AppError::config(format!(
                "Expected a service_account key, found '{}'",
                key.key_type
            )));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Mints short-lived Drive tokens from a service-account key. There is no
/// refresh token; every expiry is handled by signing a new assertion.
#[derive(Debug, Clone)]
pub struct ServiceAccountAuth {
    http: reqwest::Client,
    key: ServiceAccountKey,
    scope: String,
}

impl ServiceAccountAuth {
    pub fn new(http: reqwest::Client, key: ServiceAccountKey) -> Self {
        Self {
            http,
            key,
            scope: DRIVE_FILE_SCOPE.to_string(),
        }
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> AppResult<String> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
        };

        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| AppError::config(format!("Invalid service account private key: {}", e)))?;

        encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| AppError::auth(format!("Failed to sign service account assertion: {}", e)))
    }

    pub async fn fetch_token(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        let assertion = self.signed_assertion(now)?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AppError::auth(format!("Service account token request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::auth(format!(
                "Service account token rejected ({}): {}",
                status,
                OAuthErrorBody::parse(&body).describe()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::auth(format!("Malformed token response: {}", e)))?;

        log::info!(
            "Google Drive API authenticated as {}",
            self.key.client_email
        );
        Ok(Credential::new(
            ProviderKind::GoogleDrive,
            &token.access_token,
            None,
            now + Duration::seconds(token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS)),
        ))
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountAuth {
    async fn credential(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        self.fetch_token(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_missing_fields_is_config_error() {
        let err = ServiceAccountKey::from_json(r#"{"type":"service_account","client_email":"a@b"}"#)
            .unwrap_err();
        match err {
            AppError::Config(message) => {
                assert!(message.contains("token_uri"));
                assert!(message.contains("private_key"));
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_key_wrong_type_is_rejected() {
        let err = ServiceAccountKey::from_json(
            r#"{"type":"authorized_user","client_email":"a","token_uri":"b","private_key":"c"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServiceAccountKey::from_file(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.is_batch_fatal());
    }

    #[test]
    fn test_bad_private_key_fails_before_network() {
        let key = ServiceAccountKey::from_json(
            r#"{"type":"service_account","client_email":"bot@proj.iam.gserviceaccount.com","token_uri":"http://127.0.0.1:9/token","private_key":"not a pem"}"#,
        )
        .unwrap();
        let auth = ServiceAccountAuth::new(reqwest::Client::new(), key);
        assert!(matches!(
            auth.signed_assertion(Utc::now()),
            Err(AppError::Config(_))
        ));
    }
}
