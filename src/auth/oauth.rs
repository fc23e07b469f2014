use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::credential_store::{Credential, CredentialStore};
use super::AccessTokenSource;
use crate::config::ProviderApp;
use crate::errors::{AppError, AppResult};
use crate::models::ProviderKind;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct OAuthEndpoints {
    pub device_code_url: String,
    pub token_url: String,
    pub scope: String,
}

impl OAuthEndpoints {
    pub fn for_provider(provider: ProviderKind) -> Self {
        match provider {
            ProviderKind::GoogleDrive => Self {
                device_code_url: "https://oauth2.googleapis.com/device/code".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                scope: "https://www.googleapis.com/auth/drive.file".to_string(),
            },
            ProviderKind::OneDrive => Self {
                device_code_url:
                    "https://login.microsoftonline.com/common/oauth2/v2.0/devicecode".to_string(),
                token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
                scope: "Files.ReadWrite.All offline_access".to_string(),
            },
        }
    }

    /// Same paths rooted at `base`; used against a local mock server.
    pub fn with_base(base: &str, provider: ProviderKind) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            device_code_url: format!("{}/devicecode", base),
            token_url: format!("{}/token", base),
            scope: Self::for_provider(provider).scope,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OAuthErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorBody {
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    pub fn describe(&self) -> String {
        match &self.error_description {
            Some(description) if !description.is_empty() => {
                format!("{}: {}", self.error, description)
            }
            _ => self.error.clone(),
        }
    }
}

/// Talks to one provider's OAuth endpoints on behalf of a registered app.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub(crate) http: reqwest::Client,
    pub(crate) provider: ProviderKind,
    pub(crate) endpoints: OAuthEndpoints,
    pub(crate) app: ProviderApp,
    pub(crate) slow_down_step: std::time::Duration,
    pub(crate) min_poll_interval: std::time::Duration,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, provider: ProviderKind, app: ProviderApp) -> Self {
        Self {
            http,
            provider,
            endpoints: OAuthEndpoints::for_provider(provider),
            app,
            slow_down_step: std::time::Duration::from_secs(5),
            min_poll_interval: std::time::Duration::from_secs(1),
        }
    }

    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// How much to add to the poll interval on `slow_down`.
    pub fn with_slow_down_step(mut self, step: std::time::Duration) -> Self {
        self.slow_down_step = step;
        self
    }

    /// Floor for the device-code poll interval, whatever the provider sends.
    pub fn with_min_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// Form fields identifying the app, secret included only when set.
    pub(crate) fn client_form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("client_id", self.app.client_id.clone())];
        if !self.app.client_secret.is_empty() {
            form.push(("client_secret", self.app.client_secret.clone()));
        }
        form
    }

    pub(crate) fn credential_from_response(
        &self,
        response: TokenResponse,
        previous_refresh_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Credential {
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Credential::new(
            self.provider,
            &response.access_token,
            response
                .refresh_token
                .filter(|t| !t.is_empty())
                .or(previous_refresh_token),
            now + Duration::seconds(expires_in),
        )
    }

    /// Exchange the refresh token for a fresh access token. Does not touch
    /// any stored state; on failure the caller still holds the old credential.
    pub async fn refresh(&self, credential: &Credential, now: DateTime<Utc>) -> AppResult<Credential> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::auth("Token expired and no refresh token available"))?;

        let mut form = self.client_form();
        form.push(("grant_type", "refresh_token".to_string()));
        form.push(("refresh_token", refresh_token.to_string()));

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::auth(format!("Failed to refresh access token: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::auth(format!("Failed to read refresh response: {}", e)))?;

        if !status.is_success() {
            let error = OAuthErrorBody::parse(&body);
            return Err(AppError::auth(format!(
                "Token refresh rejected ({}): {}",
                status,
                error.describe()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::auth(format!("Malformed refresh response: {}", e)))?;

        Ok(self.credential_from_response(token, credential.refresh_token.clone(), now))
    }
}

/// Stored credential plus the client needed to keep it fresh.
#[derive(Debug, Clone)]
pub struct TokenManager {
    store: CredentialStore,
    oauth: OAuthClient,
}

impl TokenManager {
    pub fn new(store: CredentialStore, oauth: OAuthClient) -> Self {
        Self { store, oauth }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    /// Refresh and persist immediately. The token file is only written once
    /// the provider has answered successfully.
    pub async fn refresh(&self, credential: &Credential, now: DateTime<Utc>) -> AppResult<Credential> {
        log::info!(
            "{} access token expired, refreshing...",
            self.oauth.provider().display_name()
        );
        let refreshed = self.oauth.refresh(credential, now).await?;
        self.store.save(&refreshed)?;
        log::info!("{} access token refreshed", self.oauth.provider().display_name());
        Ok(refreshed)
    }

    /// A usable credential, refreshing it first when it has expired.
    pub async fn current_credential(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        let credential = self.store.load()?.ok_or_else(|| {
            AppError::auth(format!(
                "No {} token found. Run the auth command first.",
                self.oauth.provider().display_name()
            ))
        })?;

        if credential.is_valid(now) {
            return Ok(credential);
        }

        if !credential.can_refresh() {
            return Err(AppError::auth("Token expired and no refresh token available"));
        }

        self.refresh(&credential, now).await
    }

    pub async fn get_access_token(&self, now: DateTime<Utc>) -> AppResult<String> {
        let credential = self.current_credential(now).await?;
        Ok(credential.bearer()?.to_string())
    }
}

#[async_trait]
impl AccessTokenSource for TokenManager {
    async fn credential(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        self.current_credential(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OAuthClient {
        OAuthClient::new(
            reqwest::Client::new(),
            ProviderKind::OneDrive,
            ProviderApp {
                client_id: "cid".to_string(),
                client_secret: String::new(),
                service_account_key_file: None,
            },
        )
    }

    #[test]
    fn test_default_poll_interval_floor() {
        assert_eq!(client().min_poll_interval, std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_client_form_omits_empty_secret() {
        let form = client().client_form();
        assert_eq!(form, vec![("client_id", "cid".to_string())]);
    }

    #[test]
    fn test_response_keeps_previous_refresh_token() {
        let now = Utc::now();
        let response = TokenResponse {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_in: None,
        };

        let credential = client().credential_from_response(response, Some("old-r".to_string()), now);
        assert_eq!(credential.refresh_token.as_deref(), Some("old-r"));
        assert_eq!(credential.expires_at, now + Duration::seconds(DEFAULT_EXPIRES_IN_SECS));
    }

    #[test]
    fn test_error_body_description() {
        let body = OAuthErrorBody::parse(
            r#"{"error":"invalid_grant","error_description":"AADSTS70000: expired"}"#,
        );
        assert_eq!(body.describe(), "invalid_grant: AADSTS70000: expired");
        assert_eq!(OAuthErrorBody::parse("not json").error, "");
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails_fast() {
        let credential = Credential::new(
            ProviderKind::OneDrive,
            "a",
            None,
            Utc::now() - Duration::seconds(10),
        );
        let err = client().refresh(&credential, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }
}
