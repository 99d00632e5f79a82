//! HTTP client for the external account service.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vaste_core::server::Server;

/// Seconds between heartbeats to the account service.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// An error from the account service.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The account service did not answer.
    #[error("account service unreachable")]
    FailedResponse,
    /// The token was rejected, or the user record was incomplete.
    #[error("token rejected by account service")]
    InvalidToken,
    /// The response body did not match the expected shape.
    #[error("failed to parse account service response")]
    FailedParse,
    /// Any other status code.
    #[error("unexpected account service status {0}")]
    UnknownStatusCode(StatusCode),
}

/// A verified user record.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedUser {
    /// Account id; non-empty for a valid token.
    pub id: String,
    /// Stable account uuid.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Display name; non-empty for a valid token.
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    data: Option<VerifyData>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    user: VerifiedUser,
}

/// The license record returned by `validate-license`.
#[derive(Debug, Clone, Deserialize)]
pub struct LicenseInfo {
    /// The licensed server name.
    pub name: String,
    /// Expiry timestamp, if the license expires.
    #[serde(default)]
    pub license_expires_at: Option<String>,
    /// Player cap granted by the license.
    #[serde(default)]
    pub max_players: Option<u32>,
    /// Optional server description.
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateLicenseResponse {
    valid: bool,
    server: Option<LicenseInfo>,
}

#[derive(Debug, Serialize)]
struct LicenseKeyBody<'a> {
    license_key: &'a str,
}

#[derive(Debug, Serialize)]
struct HeartbeatBody<'a> {
    license_key: &'a str,
    current_players: usize,
}

#[derive(Debug, Serialize)]
struct SyncSettingsBody<'a> {
    license_key: &'a str,
    max_players: u32,
    current_players: usize,
}

/// Client for the account backend. All calls are opaque HTTP; the core
/// only depends on the `verify` response shape.
pub struct AccountClient {
    base_url: String,
    http: reqwest::Client,
}

impl AccountClient {
    /// Creates a client against the given base URL.
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Validates a bearer token. A token is valid iff the service
    /// returns a user record with a non-empty id and username.
    pub async fn verify(&self, token: &str) -> Result<VerifiedUser, AuthError> {
        let response = self
            .http
            .get(format!("{}/verify", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|_| AuthError::FailedResponse)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidToken)?,
            other => Err(AuthError::UnknownStatusCode(other))?,
        }

        let body: VerifyResponse = response.json().await.map_err(|_| AuthError::FailedParse)?;
        let user = match body {
            VerifyResponse {
                success: true,
                data: Some(data),
            } => data.user,
            _ => return Err(AuthError::InvalidToken),
        };
        if user.id.is_empty() || user.username.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(user)
    }

    /// Validates the configured license at startup.
    pub async fn validate_license(&self, license_key: &str) -> Result<LicenseInfo, AuthError> {
        let response = self
            .http
            .post(format!("{}/validate-license", self.base_url))
            .json(&LicenseKeyBody { license_key })
            .send()
            .await
            .map_err(|_| AuthError::FailedResponse)?;

        if response.status() != StatusCode::OK {
            return Err(AuthError::UnknownStatusCode(response.status()));
        }
        let body: ValidateLicenseResponse =
            response.json().await.map_err(|_| AuthError::FailedParse)?;
        match body {
            ValidateLicenseResponse {
                valid: true,
                server: Some(info),
            } => Ok(info),
            _ => Err(AuthError::InvalidToken),
        }
    }

    /// Reports the current player count. Failures are the caller's to
    /// log; they are never fatal.
    pub async fn heartbeat(&self, license_key: &str, current_players: usize) -> Result<(), AuthError> {
        self.http
            .post(format!("{}/heartbeat", self.base_url))
            .json(&HeartbeatBody {
                license_key,
                current_players,
            })
            .send()
            .await
            .map_err(|_| AuthError::FailedResponse)?
            .error_for_status()
            .map_err(|_| AuthError::FailedResponse)?;
        Ok(())
    }

    /// Pushes the capacity settings after boot and on capacity changes.
    pub async fn sync_settings(
        &self,
        license_key: &str,
        max_players: u32,
        current_players: usize,
    ) -> Result<(), AuthError> {
        self.http
            .post(format!("{}/sync-settings", self.base_url))
            .json(&SyncSettingsBody {
                license_key,
                max_players,
                current_players,
            })
            .send()
            .await
            .map_err(|_| AuthError::FailedResponse)?
            .error_for_status()
            .map_err(|_| AuthError::FailedResponse)?;
        Ok(())
    }
}

/// Spawns the periodic heartbeat task.
pub fn spawn_heartbeat(
    account: Arc<AccountClient>,
    server: Arc<Server>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    let license_key = server.config().license_key.clone();
                    if let Err(e) = account
                        .heartbeat(&license_key, server.session_count())
                        .await
                    {
                        log::warn!("heartbeat failed: {e}");
                    }
                }
            }
        }
    });
}
