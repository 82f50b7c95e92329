//! Orchestrateur de synchronisation incrémentale
//!
//! Une synchronisation enchaîne quatre phases strictement séquentielles :
//!
//! ```text
//! login/status ─► lineups ─► schedules ─► programs ─► metadata ─► snapshot
//! ```
//!
//! Les phases `schedules`, `programs` et `metadata` découpent le travail en
//! lots, les envoient à travers un pool borné de tâches (`Semaphore` +
//! `JoinSet`) puis fusionnent chaque réponse dans le [`GuideCache`]. Un lot
//! dont l'appel échoue est journalisé et ignoré ; une erreur de fusion fait
//! échouer la synchronisation une fois tous les lots de la phase terminés,
//! tout comme un corps reçu mais illisible (gzip corrompu, JSON invalide).
//! Seuls les identifiants absents du cache sont demandés.

use crate::api::{SdApi, StatusResponse};
use crate::cache::{GuideCache, MergeKind, MergeReport, MetadataPolicy};
use crate::error::{EpgError, Result};
use crate::models::{Channel, ScheduleRequest};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Station choisie par l'utilisateur
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedStation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Restreint la sélection à un lineup ; toutes si absent
    #[serde(default)]
    pub lineup: Option<String>,
}

/// Compte Schedules Direct
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Réglages d'une synchronisation
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub schedule_days: u32,
    /// stations × jours par requête de grilles
    pub schedule_batch_size: usize,
    pub program_batch_size: usize,
    pub metadata_batch_size: usize,
    pub max_concurrency: usize,
    pub metadata_policy: MetadataPolicy,
    pub refresh_changed_programs: bool,
    pub download_errors: bool,
    pub stations: Vec<SelectedStation>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            schedule_days: 7,
            schedule_batch_size: 5000,
            program_batch_size: 500,
            metadata_batch_size: 500,
            max_concurrency: 4,
            metadata_policy: MetadataPolicy::Missing,
            refresh_changed_programs: true,
            download_errors: false,
            stations: Vec::new(),
        }
    }
}

impl SyncSettings {
    /// Whether `station_id` from `lineup` belongs to the selection
    pub fn is_selected(&self, lineup: &str, station_id: &str) -> bool {
        self.stations.iter().any(|s| {
            s.id == station_id && s.lineup.as_deref().is_none_or(|l| l == lineup)
        })
    }

    /// Stations per schedule request, so that stations × days stays under the batch size
    pub fn stations_per_schedule_batch(&self) -> usize {
        (self.schedule_batch_size / self.schedule_days.max(1) as usize).max(1)
    }
}

/// `days` consecutive dates starting at `today`, formatted `YYYY-MM-DD`
pub fn schedule_dates(today: NaiveDate, days: u32) -> Vec<String> {
    today
        .iter_days()
        .take(days as usize)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect()
}

/// Bilan d'une phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    /// Identifiants (stations, programmes, racines) à traiter
    pub requested: usize,
    pub batches: usize,
    /// Lots ignorés après un échec de l'appel
    pub skipped: usize,
    pub merged: usize,
    /// Objets d'erreur reçus à la place d'entités
    pub rejected: usize,
    /// Lots jamais envoyés à cause d'une annulation
    pub not_dispatched: usize,
}

impl PhaseReport {
    fn absorb(&mut self, report: &MergeReport) {
        self.merged += report.merged;
        self.rejected += report.rejected.len();
    }
}

/// Bilan d'une synchronisation réussie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub lineups: PhaseReport,
    pub schedules: PhaseReport,
    pub programs: PhaseReport,
    pub metadata: PhaseReport,
    pub invalidated_programs: usize,
    pub elapsed_ms: u128,
}

enum BatchOutcome {
    Merged(MergeReport),
    Skipped,
}

/// One request of a batched phase
enum Batch {
    Schedules(Vec<ScheduleRequest>),
    Programs(Vec<String>),
    Metadata(Vec<String>),
}

impl Batch {
    fn kind(&self) -> MergeKind {
        match self {
            Batch::Schedules(_) => MergeKind::Schedule,
            Batch::Programs(_) => MergeKind::Program,
            Batch::Metadata(_) => MergeKind::Metadata,
        }
    }

    async fn fetch(&self, api: &SdApi, cancel: &CancellationToken) -> Result<Vec<u8>> {
        match self {
            Batch::Schedules(requests) => api.schedules(requests, cancel).await,
            Batch::Programs(ids) => api.programs(ids, cancel).await,
            Batch::Metadata(roots) => api.metadata(roots, cancel).await,
        }
    }
}

/// Pilote une synchronisation entre Schedules Direct et le cache
pub struct GuideSync {
    api: Arc<SdApi>,
    cache: Arc<GuideCache>,
    settings: SyncSettings,
    credentials: Option<Credentials>,
}

impl GuideSync {
    pub fn new(api: Arc<SdApi>, cache: Arc<GuideCache>, settings: SyncSettings) -> Self {
        Self {
            api,
            cache,
            settings,
            credentials: None,
        }
    }

    /// Identifiants utilisés quand aucun token de session n'est disponible
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<GuideCache> {
        &self.cache
    }

    /// Runs every phase, then writes the cache snapshot
    ///
    /// The snapshot is written even when a phase fails or the run is
    /// cancelled, so completed phases are reused by the next run.
    ///
    /// # Errors
    ///
    /// * `EpgError::Cancelled` - `cancel` fired; in-flight batches were drained
    /// * `EpgError::Unauthorized` / `EpgError::Api` - login or status refused
    /// * `EpgError::Decode` - a batch payload could not be merged
    /// * `EpgError::Persistence` - the snapshot could not be written
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::default();

        self.cache.begin_run();
        let outcome = self.run_phases(&mut report, cancel).await;

        let persisted = if self.cache.path().is_some() {
            self.cache.snapshot()
        } else {
            Ok(())
        };

        report.elapsed_ms = started.elapsed().as_millis();
        match (outcome, persisted) {
            (Ok(()), Ok(())) => {
                info!(
                    schedules = report.schedules.merged,
                    programs = report.programs.merged,
                    metadata = report.metadata.merged,
                    elapsed_ms = report.elapsed_ms as u64,
                    "Guide synchronisation complete"
                );
                Ok(report)
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), persisted) => {
                if let Err(snapshot_error) = persisted {
                    error!("Failed to write cache snapshot: {}", snapshot_error);
                }
                Err(e)
            }
        }
    }

    async fn run_phases(&self, report: &mut SyncReport, cancel: &CancellationToken) -> Result<()> {
        let status = self.connect(cancel).await?;

        report.lineups = self.lineup_phase(&status, cancel).await?;
        check_cancelled(cancel)?;

        report.schedules = self.schedule_phase(cancel).await?;
        check_cancelled(cancel)?;

        if self.settings.refresh_changed_programs {
            report.invalidated_programs = self.cache.invalidate_changed_programs();
        }
        report.programs = self.program_phase(cancel).await?;
        check_cancelled(cancel)?;

        report.metadata = self.metadata_phase(cancel).await?;
        check_cancelled(cancel)
    }

    async fn login(&self, cancel: &CancellationToken) -> Result<()> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            EpgError::Unauthorized("no session token and no credentials configured".to_string())
        })?;
        self.api
            .login(&credentials.username, &credentials.password, cancel)
            .await?;
        Ok(())
    }

    /// Ensures a session token, then fetches the account status
    ///
    /// A status call refused for authentication triggers one new login.
    async fn connect(&self, cancel: &CancellationToken) -> Result<StatusResponse> {
        if !self.api.is_authenticated() {
            self.login(cancel).await?;
        }

        match self.api.status(cancel).await {
            Err(e) if e.is_auth_error() && self.credentials.is_some() => {
                warn!("Session token refused, logging in again: {}", e);
                self.api.logout();
                self.login(cancel).await?;
                self.api.status(cancel).await
            }
            other => other,
        }
    }

    async fn lineup_phase(
        &self,
        status: &StatusResponse,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport> {
        let lineups: Vec<&str> = status.active_lineups().map(|l| l.lineup.as_str()).collect();
        let mut phase = PhaseReport {
            requested: lineups.len(),
            ..PhaseReport::default()
        };
        if self.settings.stations.is_empty() {
            warn!("No station selected, the guide will be empty");
        }

        self.cache.clear_channels();
        for lineup in lineups {
            check_cancelled(cancel)?;
            phase.batches += 1;

            let roster = match self.api.stations(lineup, cancel).await {
                Ok(roster) => roster,
                Err(EpgError::Cancelled) => return Err(EpgError::Cancelled),
                Err(e) => {
                    error!(lineup, "Failed to get lineup: {}", e);
                    phase.skipped += 1;
                    continue;
                }
            };

            let numbers: HashMap<&str, &str> = roster
                .map
                .iter()
                .filter_map(|m| m.channel.as_deref().map(|c| (m.station_id.as_str(), c)))
                .collect();
            let channels: Vec<Channel> = roster
                .stations
                .iter()
                .filter(|s| self.settings.is_selected(lineup, &s.station_id))
                .map(|s| Channel {
                    lineup: Some(lineup.to_string()),
                    channel_number: numbers.get(s.station_id.as_str()).map(|c| c.to_string()),
                    ..s.clone()
                })
                .collect();

            let merged = self.cache.merge_channels(channels);
            debug!(lineup, merged, "Added stations to cache");
            phase.merged += merged;
        }

        // un lineup en échec garde les grilles de ses stations
        if phase.skipped == 0 {
            let dropped = self.cache.drop_unselected_schedules();
            if dropped > 0 {
                info!(stations = dropped, "Dropped schedules of deselected stations");
            }
        }

        info!(lineups = phase.requested, channels = phase.merged, "Lineups processed");
        Ok(phase)
    }

    async fn schedule_phase(&self, cancel: &CancellationToken) -> Result<PhaseReport> {
        let stations: Vec<String> = self.cache.read(|data| data.channels.keys().cloned().collect());
        let dates = schedule_dates(Local::now().date_naive(), self.settings.schedule_days.max(1));

        let batches: Vec<Batch> = stations
            .chunks(self.settings.stations_per_schedule_batch())
            .map(|chunk| {
                Batch::Schedules(
                    chunk
                        .iter()
                        .map(|station| ScheduleRequest {
                            station_id: station.clone(),
                            date: dates.clone(),
                        })
                        .collect(),
                )
            })
            .collect();

        info!(stations = stations.len(), days = dates.len(), "Downloading schedules");
        let mut phase = self
            .run_batches(MergeKind::Schedule, batches, cancel)
            .await?;
        phase.requested = stations.len();
        Ok(phase)
    }

    async fn program_phase(&self, cancel: &CancellationToken) -> Result<PhaseReport> {
        let required: Vec<String> = self.cache.required_program_ids().into_iter().collect();
        let referenced = self.cache.referenced_program_ids().len();
        info!(
            new = required.len(),
            cached = referenced.saturating_sub(required.len()),
            total = referenced,
            "Downloading programs"
        );

        let batches: Vec<Batch> = chunk_ids(&required, self.settings.program_batch_size)
            .into_iter()
            .map(Batch::Programs)
            .collect();
        let mut phase = self
            .run_batches(MergeKind::Program, batches, cancel)
            .await?;
        phase.requested = required.len();
        Ok(phase)
    }

    async fn metadata_phase(&self, cancel: &CancellationToken) -> Result<PhaseReport> {
        let required: Vec<String> = self
            .cache
            .required_metadata_ids(self.settings.metadata_policy)
            .into_iter()
            .collect();
        info!(count = required.len(), policy = ?self.settings.metadata_policy, "Downloading metadata");

        let batches: Vec<Batch> = chunk_ids(&required, self.settings.metadata_batch_size)
            .into_iter()
            .map(Batch::Metadata)
            .collect();
        let mut phase = self
            .run_batches(MergeKind::Metadata, batches, cancel)
            .await?;
        phase.requested = required.len();
        Ok(phase)
    }

    /// Dispatches `batches` through the worker pool and merges the answers
    ///
    /// Every dispatched batch runs to completion. Results are collected in
    /// dispatch order and the first merge error is returned after the join.
    async fn run_batches(
        &self,
        kind: MergeKind,
        batches: Vec<Batch>,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport> {
        let mut phase = PhaseReport {
            batches: batches.len(),
            ..PhaseReport::default()
        };
        if batches.is_empty() {
            debug!(phase = kind.as_str(), "Nothing to fetch, phase skipped");
            return Ok(phase);
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let total = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                phase.not_dispatched = total - index;
                warn!(phase = kind.as_str(), remaining = phase.not_dispatched, "Dispatch stopped");
                break;
            };

            let api = Arc::clone(&self.api);
            let cache = Arc::clone(&self.cache);
            let cancel = cancel.clone();
            let download_errors = self.settings.download_errors;

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = fetch_and_merge(&api, cache, &batch, download_errors, &cancel, index).await;
                (index, outcome)
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => results.push((
                    usize::MAX,
                    Err(EpgError::Other(format!("{} batch task failed: {}", kind.as_str(), e))),
                )),
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let mut first_error = None;
        for (_, outcome) in results {
            match outcome {
                Ok(BatchOutcome::Merged(report)) => phase.absorb(&report),
                Ok(BatchOutcome::Skipped) => phase.skipped += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            phase = kind.as_str(),
            batches = phase.batches,
            merged = phase.merged,
            skipped = phase.skipped,
            rejected = phase.rejected,
            "Phase complete"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(phase),
        }
    }
}

/// Fetches one batch and merges it
///
/// A failed call skips the batch; a body that cannot be inflated or decoded
/// is returned as an error.
async fn fetch_and_merge(
    api: &SdApi,
    cache: Arc<GuideCache>,
    batch: &Batch,
    download_errors: bool,
    cancel: &CancellationToken,
    index: usize,
) -> Result<BatchOutcome> {
    let kind = batch.kind();
    let raw = match batch.fetch(api, cancel).await {
        Ok(raw) => raw,
        Err(e) if e.is_malformed_payload() => {
            error!(phase = kind.as_str(), batch = index, "Malformed batch payload: {}", e);
            return Err(e);
        }
        Err(e) => {
            if !e.is_cancelled() {
                error!(phase = kind.as_str(), batch = index, "Failed to get batch: {}", e);
            }
            return Ok(BatchOutcome::Skipped);
        }
    };

    let report = tokio::task::spawn_blocking(move || cache.merge(kind, &raw))
        .await
        .map_err(|e| EpgError::Other(format!("{} merge task failed: {}", kind.as_str(), e)))??;

    for rejected in &report.rejected {
        if download_errors {
            warn!(
                phase = kind.as_str(),
                id = %rejected.program_id,
                code = rejected.code(),
                "SD API error: {}",
                rejected.message()
            );
        } else {
            debug!(id = %rejected.program_id, code = rejected.code(), "SD API error: {}", rejected.message());
        }
    }
    Ok(BatchOutcome::Merged(report))
}

fn chunk_ids(ids: &[String], size: usize) -> Vec<Vec<String>> {
    ids.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EpgError::Cancelled)
    } else {
        Ok(())
    }
}
