use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::credential_store::Credential;
use super::oauth::{OAuthClient, OAuthErrorBody, TokenResponse};
use crate::errors::{AppError, AppResult};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    /// Microsoft says `verification_uri`, Google says `verification_url`.
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DeviceCode {
    pub fn instructions(&self, provider_name: &str) -> String {
        let rule = "=".repeat(50);
        format!(
            "\n{rule}\n{provider_name} Authentication Required\n{rule}\n\
             1. Go to: {}\n2. Enter the code: {}\n3. Approve the request.\n{rule}\n",
            self.verification_uri, self.user_code
        )
    }
}

/// What one poll of the token endpoint told us.
#[derive(Debug)]
enum PollOutcome {
    Granted(TokenResponse),
    Pending,
    SlowDown,
}

impl OAuthClient {
    pub async fn request_device_code(&self) -> AppResult<DeviceCode> {
        let form = [
            ("client_id", self.app.client_id.clone()),
            ("scope", self.endpoints.scope.clone()),
        ];

        let response = self
            .http
            .post(&self.endpoints.device_code_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::auth(format!("Failed to initiate auth flow: {}", e)))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::auth(format!(
                "Device code request rejected ({}): {}",
                status,
                OAuthErrorBody::parse(&body).describe()
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| AppError::auth(format!("Malformed device code response: {}", e)))
    }

    async fn poll_once(&self, device_code: &DeviceCode) -> AppResult<PollOutcome> {
        let mut form = self.client_form();
        form.push(("grant_type", DEVICE_CODE_GRANT.to_string()));
        form.push(("device_code", device_code.device_code.clone()));

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::auth(format!("Token polling failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let token: TokenResponse = serde_json::from_str(&body)
                .map_err(|e| AppError::auth(format!("Malformed token response: {}", e)))?;
            return Ok(PollOutcome::Granted(token));
        }

        // Microsoft answers 400, Google 428/403; the error code is what counts
        let error = OAuthErrorBody::parse(&body);
        match error.error.as_str() {
            "authorization_pending" => Ok(PollOutcome::Pending),
            "slow_down" => Ok(PollOutcome::SlowDown),
            "expired_token" => Err(AppError::auth("Authentication timed out. Please try again.")),
            "authorization_declined" | "access_denied" => {
                Err(AppError::auth("Authorization was declined."))
            }
            "" => Err(AppError::auth(format!(
                "Unexpected error during token polling: {} - {}",
                status,
                body.trim()
            ))),
            _ => Err(AppError::auth(format!(
                "Authentication error: {}",
                error.describe()
            ))),
        }
    }

    /// Poll until the user approves, declines, or the code expires.
    pub async fn poll_for_token(
        &self,
        device_code: &DeviceCode,
        now: impl Fn() -> DateTime<Utc>,
    ) -> AppResult<Credential> {
        let mut interval = Duration::from_secs(device_code.interval.unwrap_or(DEFAULT_INTERVAL_SECS))
            .max(self.min_poll_interval);
        // An expiry too far out to represent means no deadline
        let deadline = device_code
            .expires_in
            .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));

        loop {
            match self.poll_once(device_code).await? {
                PollOutcome::Granted(token) => {
                    log::info!("{} authorization granted", self.provider.display_name());
                    return Ok(self.credential_from_response(token, None, now()));
                }
                PollOutcome::Pending => {
                    log::debug!("Authorization pending, polling again in {:?}", interval);
                }
                PollOutcome::SlowDown => {
                    interval = interval.saturating_add(self.slow_down_step);
                    log::debug!("Provider asked to slow down; interval now {:?}", interval);
                }
            }

            if let Some(deadline) = deadline {
                let next_poll = Instant::now().checked_add(interval);
                if next_poll.map_or(true, |next| next >= deadline) {
                    return Err(AppError::auth("Authentication timed out. Please try again."));
                }
            }

            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_google_verification_url_alias() {
        let code: DeviceCode = serde_json::from_str(
            r#"{"device_code":"d","user_code":"ABCD-EFGH","verification_url":"https://www.google.com/device","expires_in":1800,"interval":5}"#,
        )
        .unwrap();
        assert_eq!(code.verification_uri, "https://www.google.com/device");
        assert_eq!(code.interval, Some(5));
    }

    #[test]
    fn test_instructions_mention_code_and_uri() {
        let code = DeviceCode {
            device_code: "d".to_string(),
            user_code: "XYZ".to_string(),
            verification_uri: "https://microsoft.com/devicelogin".to_string(),
            expires_in: None,
            interval: None,
            message: None,
        };
        let text = code.instructions("OneDrive");
        assert!(text.contains("OneDrive Authentication Required"));
        assert!(text.contains("XYZ"));
        assert!(text.contains("https://microsoft.com/devicelogin"));
    }
}
