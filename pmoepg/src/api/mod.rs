//! Couche d'accès à l'API JSON Schedules Direct
//!
//! [`SdApi`] envoie les requêtes à travers un seau à jetons partagé
//! ([`rate_limit::TokenBucket`]) et réessaie les erreurs transitoires avec
//! un backoff exponentiel ([`retry::RetryPolicy`]). Chaque appel est décrit
//! par une variante de [`ApiCall`], qui porte sa méthode HTTP, son endpoint
//! et la vérification de son code d'erreur applicatif.

pub mod auth;
pub mod rate_limit;
pub mod retry;

use crate::error::{EpgError, Result};
use crate::models::{LineupRoster, ScheduleRequest};
use crate::payload;
use rate_limit::{RateLimitConfig, TokenBucket};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Method};
use retry::RetryPolicy;
use serde::Serialize;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use auth::{AccountInfo, LineupInfo, LoginResponse, StatusResponse, SystemStatus};

/// URL de base de l'API Schedules Direct
pub const DEFAULT_API_BASE: &str = "https://json.schedulesdirect.org/20141201/";

/// Timeout par requête HTTP
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// User-Agent envoyé à Schedules Direct
pub const DEFAULT_USER_AGENT: &str = concat!("pmoguide/", env!("CARGO_PKG_VERSION"));

/// Appels supportés par le client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Login,
    Status,
    LineupList,
    StationList(String),
    Schedules,
    Programs,
    Metadata,
}

impl ApiCall {
    pub fn method(&self) -> Method {
        match self {
            ApiCall::Status | ApiCall::LineupList | ApiCall::StationList(_) => Method::GET,
            ApiCall::Login | ApiCall::Schedules | ApiCall::Programs | ApiCall::Metadata => {
                Method::POST
            }
        }
    }

    /// Endpoint relatif à l'URL de base
    pub fn endpoint(&self) -> String {
        match self {
            ApiCall::Login => "token".to_string(),
            ApiCall::Status => "status".to_string(),
            ApiCall::LineupList => "lineups".to_string(),
            ApiCall::StationList(lineup) => format!("lineups/{lineup}"),
            ApiCall::Schedules => "schedules".to_string(),
            ApiCall::Programs => "programs".to_string(),
            ApiCall::Metadata => "metadata/programs".to_string(),
        }
    }

    /// Contexte utilisé dans les messages d'erreur
    pub fn name(&self) -> &'static str {
        match self {
            ApiCall::Login => "login",
            ApiCall::Status => "status",
            ApiCall::LineupList => "lineup list",
            ApiCall::StationList(_) => "station list",
            ApiCall::Schedules => "schedules",
            ApiCall::Programs => "programs",
            ApiCall::Metadata => "metadata",
        }
    }

    /// Program and artwork batches may come back gzip-compressed
    pub fn compressed(&self) -> bool {
        matches!(self, ApiCall::Programs | ApiCall::Metadata)
    }

    pub fn needs_token(&self) -> bool {
        !matches!(self, ApiCall::Login)
    }

    /// Whether the answer is a JSON array of per-entity objects
    pub fn is_batch(&self) -> bool {
        matches!(self, ApiCall::Schedules | ApiCall::Programs | ApiCall::Metadata)
    }

    /// Checks the application-level error code of an (inflated) answer
    ///
    /// Envelope answers carry a `code` field that must be zero. Batch
    /// answers must be an array; an object in its place is a whole-request
    /// error.
    pub fn inspect(&self, body: &[u8]) -> Result<()> {
        let context = self.name();
        if self.is_batch() {
            let first = body.iter().find(|b| !b.is_ascii_whitespace());
            if first == Some(&b'[') {
                return Ok(());
            }
            return payload::split_batch(context, body).map(|_| ());
        }
        payload::decode_envelope::<Value>(context, body).map(|_| ())
    }
}

/// Client HTTP bas-niveau pour Schedules Direct
///
/// Partagé entre les tâches d'une synchronisation (`Arc<SdApi>`) : le seau à
/// jetons et le token de session sont communs à tous les appels.
#[derive(Debug)]
pub struct SdApi {
    client: Client,
    api_base: String,
    limiter: TokenBucket,
    retry: RetryPolicy,
    token: RwLock<Option<String>>,
}

impl SdApi {
    /// Crée un client avec la configuration par défaut
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> SdApiBuilder {
        SdApiBuilder::default()
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Token de session courant
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn url(&self, call: &ApiCall) -> String {
        format!("{}{}", self.api_base, call.endpoint())
    }

    /// Envoie un appel et renvoie le corps (décompressé) de la réponse
    ///
    /// Attend un jeton du limiteur avant chaque tentative. Les erreurs
    /// transitoires (transport, 429, 5xx) sont réessayées jusqu'à
    /// `max_attempts`, puis remontées dans [`EpgError::RetriesExhausted`].
    /// Les autres erreurs sont renvoyées immédiatement.
    ///
    /// # Errors
    ///
    /// * `EpgError::Cancelled` - annulation pendant une attente
    /// * `EpgError::Unauthorized` - pas de token, ou 401/403
    /// * `EpgError::Api` - code d'erreur applicatif dans la réponse
    pub async fn send(
        &self,
        call: &ApiCall,
        body: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let token = if call.needs_token() {
            Some(self.token().ok_or_else(|| {
                EpgError::Unauthorized(format!("no session token for {}", call.name()))
            })?)
        } else {
            None
        };

        let mut attempt = 0;
        loop {
            self.limiter.acquire(cancel).await?;
            attempt += 1;

            match self.attempt(call, body, token.as_deref()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    if attempt >= self.retry.max_attempts {
                        warn!(call = call.name(), attempts = attempt, "Giving up: {}", e);
                        return Err(EpgError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        call = call.name(),
                        attempt,
                        "Transient error, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EpgError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        call: &ApiCall,
        body: Option<&[u8]>,
        token: Option<&str>,
    ) -> Result<Vec<u8>> {
        let url = self.url(call);
        trace!("{} {}", call.method(), url);

        let mut request = self
            .client
            .request(call.method(), &url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.header("token", token);
        }
        if call.compressed() {
            request = request.header(ACCEPT_ENCODING, "deflate,gzip");
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EpgError::from_status_code(status.as_u16(), message));
        }

        let raw = response.bytes().await.map_err(EpgError::Body)?;
        let body = payload::inflate(call.name(), &raw)?.into_owned();
        debug!(call = call.name(), bytes = body.len(), "Response received");

        call.inspect(&body)?;
        Ok(body)
    }

    /// Envoie un appel avec un corps JSON
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        call: &ApiCall,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(body).map_err(|e| EpgError::decode(call.name(), e))?;
        self.send(call, Some(&body), cancel).await
    }

    /// Liste des lineups du compte
    pub async fn lineups(&self, cancel: &CancellationToken) -> Result<Vec<LineupInfo>> {
        #[derive(serde::Deserialize)]
        struct LineupsResponse {
            #[serde(default)]
            lineups: Vec<LineupInfo>,
        }

        let raw = self.send(&ApiCall::LineupList, None, cancel).await?;
        let response: LineupsResponse = payload::decode_envelope("lineup list", &raw)?;
        Ok(response.lineups)
    }

    /// Stations et plan de numérotation d'un lineup
    pub async fn stations(&self, lineup: &str, cancel: &CancellationToken) -> Result<LineupRoster> {
        let call = ApiCall::StationList(lineup.to_string());
        let raw = self.send(&call, None, cancel).await?;
        payload::decode_envelope("station list", &raw)
    }

    /// Lot de grilles ; la réponse brute est fusionnée par le cache
    pub async fn schedules(
        &self,
        request: &[ScheduleRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.send_json(&ApiCall::Schedules, request, cancel).await
    }

    /// Lot de programmes
    pub async fn programs(&self, ids: &[String], cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.send_json(&ApiCall::Programs, ids, cancel).await
    }

    /// Lot d'illustrations, par racine de programme
    pub async fn metadata(&self, roots: &[String], cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.send_json(&ApiCall::Metadata, roots, cancel).await
    }
}

/// Builder du client [`SdApi`]
#[derive(Debug)]
pub struct SdApiBuilder {
    client: Option<Client>,
    api_base: String,
    request_timeout: Duration,
    user_agent: String,
    rate_limit: RateLimitConfig,
    retry: RetryPolicy,
    token: Option<String>,
}

impl Default for SdApiBuilder {
    fn default() -> Self {
        Self {
            client: None,
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            token: None,
        }
    }
}

impl SdApiBuilder {
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the API base URL (a trailing `/` is added when missing)
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.api_base = url;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Reuse a session token obtained earlier
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<SdApi> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(&self.user_agent)
                .timeout(self.request_timeout)
                .build()?,
        };

        Ok(SdApi {
            client,
            api_base: self.api_base,
            limiter: TokenBucket::new(self.rate_limit),
            retry: self.retry,
            token: RwLock::new(self.token),
        })
    }
}
