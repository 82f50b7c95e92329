//! Module d'authentification et de statut du compte Schedules Direct

use super::{ApiCall, SdApi};
use crate::error::Result;
use crate::payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Réponse de l'endpoint /token
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "serverID", default)]
    pub server_id: String,
    #[serde(default)]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token: String,
}

/// Informations du compte
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_lineups: i64,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// Lineup souscrit par le compte
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineupInfo {
    pub lineup: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// Réponse de l'endpoint /status
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub account: AccountInfo,
    #[serde(default)]
    pub lineups: Vec<LineupInfo>,
    #[serde(default)]
    pub last_data_update: Option<String>,
    #[serde(default)]
    pub system_status: Vec<SystemStatus>,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl StatusResponse {
    /// Lineups encore actifs
    pub fn active_lineups(&self) -> impl Iterator<Item = &LineupInfo> {
        self.lineups.iter().filter(|l| !l.is_deleted)
    }
}

/// Hash SHA-1 hexadécimal attendu par /token
///
/// Une valeur déjà hashée (40 caractères hexadécimaux) est renvoyée telle quelle.
pub fn hash_password(password: &str) -> String {
    if password.len() == 40 && password.chars().all(|c| c.is_ascii_hexdigit()) {
        return password.to_ascii_lowercase();
    }
    hex::encode(Sha1::digest(password.as_bytes()))
}

impl SdApi {
    /// Obtient un token de session et le mémorise pour les appels suivants
    ///
    /// # Errors
    ///
    /// * `EpgError::Api` - identifiants refusés (codes 4001..4009)
    /// * `EpgError::Unauthorized` - réponse HTTP 401/403
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<LoginResponse> {
        info!("Logging in to Schedules Direct as {}", username);

        let body = serde_json::json!({
            "username": username,
            "password": hash_password(password),
        });
        let raw = self.send_json(&ApiCall::Login, &body, cancel).await?;
        let response: LoginResponse = payload::decode_envelope("login", &raw)?;

        debug!(server = %response.server_id, "Session token received");
        self.set_token(Some(response.token.clone()));
        Ok(response)
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some_and(|t| !t.is_empty())
    }

    pub fn logout(&self) {
        self.set_token(None);
    }

    /// Statut du compte et du service ; journalise l'expiration et l'état système
    pub async fn status(&self, cancel: &CancellationToken) -> Result<StatusResponse> {
        let raw = self.send(&ApiCall::Status, None, cancel).await?;
        let status: StatusResponse = payload::decode_envelope("status", &raw)?;

        if let Some(expires) = status.account.expires {
            info!(
                expires = %expires,
                lineups = status.lineups.len(),
                max_lineups = status.account.max_lineups,
                "Account status"
            );
            if expires < Utc::now() {
                warn!("Schedules Direct account expired on {}", expires);
            }
        }
        for system in &status.system_status {
            info!(status = %system.status, date = %system.date, "{}", system.message);
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password() {
        // sha1("password")
        assert_eq!(
            hash_password("password"),
            "5baa61e4c9b93f3f0682250b6cf8331b7ee68fd8"
        );
        assert_eq!(
            hash_password("5BAA61E4C9B93F3F0682250B6CF8331B7EE68FD8"),
            "5baa61e4c9b93f3f0682250b6cf8331b7ee68fd8"
        );
    }

    #[test]
    fn test_status_response() {
        let status: StatusResponse = serde_json::from_str(
            r#"{
                "account": {"expires": "2030-01-01T00:00:00Z", "maxLineups": 4, "messages": []},
                "lineups": [
                    {"lineup": "USA-NY12345-X", "modified": "2026-10-01T00:00:00Z", "uri": "/20141201/lineups/USA-NY12345-X"},
                    {"lineup": "USA-OLD-X", "isDeleted": true}
                ],
                "lastDataUpdate": "2026-10-15T00:00:00Z",
                "systemStatus": [{"date": "2026-10-15T00:00:00Z", "status": "Online", "message": "No known issues."}],
                "code": 0
            }"#,
        )
        .unwrap();
        let active: Vec<_> = status.active_lineups().map(|l| l.lineup.as_str()).collect();
        assert_eq!(active, vec!["USA-NY12345-X"]);
        assert_eq!(status.account.max_lineups, 4);
    }
}
