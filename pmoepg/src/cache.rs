//! Cache du guide : chaînes, grilles, programmes et illustrations
//!
//! [`GuideCache`] possède les quatre tables et les protège par un unique
//! `RwLock`, pris à la granularité d'une méthode. Le décodage des réponses
//! se fait hors du verrou ; seule l'insertion des entités décodées le tient.
//!
//! ## Persistance
//!
//! Le cache est sérialisé en un seul document JSON (les quatre tables et la
//! date d'expiration), écrit dans un fichier temporaire puis renommé.
//!
//! ```text
//! {
//!   "Channel":  { "<stationID>": Channel },
//!   "Schedule": { "<stationID>": [ScheduleSlot, ...] },
//!   "Program":  { "<programID>": Program },
//!   "Metadata": { "<programID[..10]>": ArtworkSet },
//!   "expiration": "<RFC 3339>"
//! }
//! ```

use crate::error::{EpgError, Result};
use crate::models::{ArtworkSet, Channel, EntityError, Program, ScheduleSlot, StationSchedule, artwork_root};
use crate::payload::{self, Entry};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Durée de vie par défaut du cache complet
pub const DEFAULT_CACHE_TTL_HOURS: i64 = 24;

/// Rétention par défaut des programmes (date de première diffusion)
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Kind of batch payload handed to [`GuideCache::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeKind {
    Schedule,
    Program,
    Metadata,
}

impl MergeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeKind::Schedule => "schedules",
            MergeKind::Program => "programs",
            MergeKind::Metadata => "metadata",
        }
    }
}

/// Outcome of one merge call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Entities upserted (schedule slots for [`MergeKind::Schedule`])
    pub merged: usize,
    /// Error objects found in place of records
    pub rejected: Vec<EntityError>,
}

/// Which artwork roots the metadata phase asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataPolicy {
    /// Only roots absent from the metadata map
    #[default]
    Missing,
    /// Every referenced root, every run
    All,
}

/// What [`GuideCache::expire_and_prune`] removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub slots: usize,
    pub stations: usize,
    pub programs: usize,
}

/// Map sizes and expiration, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub channels: usize,
    pub stations: usize,
    pub slots: usize,
    pub programs: usize,
    pub metadata: usize,
    pub expiration: Option<DateTime<Utc>>,
}

/// The serialized content of the cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    #[serde(rename = "Channel", default)]
    pub channels: BTreeMap<String, Channel>,
    /// Slots per station, sorted by air time, unique per air time
    #[serde(rename = "Schedule", default)]
    pub schedules: BTreeMap<String, Vec<ScheduleSlot>>,
    #[serde(rename = "Program", default)]
    pub programs: BTreeMap<String, Program>,
    /// Artwork keyed by the 10-character root of the program id
    #[serde(rename = "Metadata", default)]
    pub metadata: BTreeMap<String, ArtworkSet>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl CacheData {
    fn empty(expiration: DateTime<Utc>) -> Self {
        Self {
            expiration: Some(expiration),
            ..Self::default()
        }
    }

    /// Program ids referenced by at least one schedule slot
    pub fn referenced_program_ids(&self) -> BTreeSet<String> {
        self.schedules
            .values()
            .flatten()
            .map(|slot| slot.program_id.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    data: CacheData,
    /// Stations whose slot list was already replaced during this run
    touched: HashSet<String>,
}

/// Cache du guide, partagé entre l'orchestrateur et la façade de requête
#[derive(Debug)]
pub struct GuideCache {
    path: Option<PathBuf>,
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl GuideCache {
    /// Cache vide, persisté dans `path`
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::build(Some(path.into()), ttl)
    }

    /// Cache vide sans fichier associé
    pub fn in_memory(ttl: Duration) -> Self {
        Self::build(None, ttl)
    }

    fn build(path: Option<PathBuf>, ttl: Duration) -> Self {
        Self {
            path,
            ttl,
            state: RwLock::new(CacheState {
                data: CacheData::empty(Utc::now() + ttl),
                touched: HashSet::new(),
            }),
        }
    }

    /// Ouvre le cache de `path` et restaure son contenu
    pub fn open(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let cache = Self::new(path, ttl);
        cache.restore(Utc::now())?;
        Ok(cache)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // Chaque mutation est un upsert complet : un verrou empoisonné reste cohérent
    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| EpgError::Other("cache has no snapshot path".to_string()))
    }

    // ============ Persistence ============

    /// Reloads the snapshot
    ///
    /// A missing file or an expired snapshot leaves an empty cache. On
    /// success the expiration is pushed to `now + ttl`.
    ///
    /// # Errors
    ///
    /// * `EpgError::Persistence` - the file exists but cannot be read
    /// * `EpgError::Decode` - the file is not a valid snapshot
    pub fn restore(&self, now: DateTime<Utc>) -> Result<()> {
        let fresh_expiration = now + self.ttl;
        let Some(path) = self.path.as_deref() else {
            self.write_state().data.expiration = Some(fresh_expiration);
            return Ok(());
        };

        let mut data = match std::fs::read(path) {
            Ok(bytes) => {
                let data: CacheData = serde_json::from_slice(&bytes)
                    .map_err(|e| EpgError::decode("cache snapshot", e))?;
                if data.expiration.is_some_and(|expiration| now > expiration) {
                    info!(path = %path.display(), "Cache expired, reinitializing");
                    CacheData::default()
                } else {
                    data
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                CacheData::default()
            }
            Err(e) => return Err(EpgError::persistence(path, e)),
        };
        data.expiration = Some(fresh_expiration);

        let mut state = self.write_state();
        state.data = data;
        state.touched.clear();
        Ok(())
    }

    /// Writes the whole cache to its snapshot file (temp file, then rename)
    pub fn snapshot(&self) -> Result<()> {
        let path = self.require_path()?;
        let bytes = {
            let state = self.read_state();
            serde_json::to_vec_pretty(&state.data).map_err(|e| EpgError::decode("cache snapshot", e))?
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| EpgError::persistence(dir, e))?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, &bytes).map_err(|e| EpgError::persistence(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(EpgError::persistence(path, e));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "Cache snapshot written");
        Ok(())
    }

    /// Deletes the snapshot file and empties the cache
    pub fn remove(&self) -> Result<()> {
        let path = self.require_path()?;
        info!(path = %path.display(), "Removing cache file");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EpgError::persistence(path, e)),
        }

        let mut state = self.write_state();
        state.data = CacheData::empty(Utc::now() + self.ttl);
        state.touched.clear();
        Ok(())
    }

    // ============ Expiration ============

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.read_state().data.expiration
    }

    /// True iff `now` is after the stored expiration
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration().is_some_and(|expiration| now > expiration)
    }

    // ============ Merges ============

    /// Starts a sync run: the next schedule merge for each station replaces
    /// its slot list instead of extending it
    pub fn begin_run(&self) {
        self.write_state().touched.clear();
    }

    pub fn clear_channels(&self) {
        self.write_state().data.channels.clear();
    }

    /// Removes the slot lists of stations absent from the Channel map
    ///
    /// Returns the number of stations dropped.
    pub fn drop_unselected_schedules(&self) -> usize {
        let mut state = self.write_state();
        let CacheData {
            channels, schedules, ..
        } = &mut state.data;
        let before = schedules.len();
        schedules.retain(|station, _| channels.contains_key(station));
        before - schedules.len()
    }

    /// Upserts channels by station id
    pub fn merge_channels(&self, channels: impl IntoIterator<Item = Channel>) -> usize {
        let mut state = self.write_state();
        let mut merged = 0;
        for channel in channels {
            state.data.channels.insert(channel.station_id.clone(), channel);
            merged += 1;
        }
        merged
    }

    /// Decodes a batch payload and upserts its entities
    ///
    /// The payload may be gzip-compressed. Error objects in place of
    /// records are returned in [`MergeReport::rejected`].
    ///
    /// # Errors
    ///
    /// * `EpgError::Decode` / `EpgError::Inflate` - malformed payload; nothing is merged
    /// * `EpgError::Api` - whole-request error object instead of an array
    pub fn merge(&self, kind: MergeKind, raw: &[u8]) -> Result<MergeReport> {
        let report = match kind {
            MergeKind::Schedule => {
                let (records, rejected) = split(payload::decode_batch::<StationSchedule>(kind.as_str(), raw)?);
                let merged = self.merge_schedules(records);
                MergeReport { merged, rejected }
            }
            MergeKind::Program => {
                let (records, rejected) = split(payload::decode_batch::<Program>(kind.as_str(), raw)?);
                let mut state = self.write_state();
                let merged = records.len();
                for program in records {
                    state.data.programs.insert(program.program_id.clone(), program);
                }
                MergeReport { merged, rejected }
            }
            MergeKind::Metadata => {
                let (records, rejected) = split(payload::decode_batch::<ArtworkSet>(kind.as_str(), raw)?);
                let mut state = self.write_state();
                let merged = records.len();
                for artwork in records {
                    let root = artwork_root(&artwork.program_id).to_string();
                    state.data.metadata.insert(root, artwork);
                }
                MergeReport { merged, rejected }
            }
        };

        debug!(
            kind = kind.as_str(),
            merged = report.merged,
            rejected = report.rejected.len(),
            "Batch merged"
        );
        Ok(report)
    }

    fn merge_schedules(&self, schedules: Vec<StationSchedule>) -> usize {
        let mut state = self.write_state();
        let CacheState { data, touched } = &mut *state;
        let mut merged = 0;

        for schedule in schedules {
            let slots = data.schedules.entry(schedule.station_id.clone()).or_default();
            if touched.insert(schedule.station_id) {
                slots.clear();
            }
            for slot in schedule.programs {
                match slots.binary_search_by(|s| s.air_date_time.cmp(&slot.air_date_time)) {
                    Ok(idx) => slots[idx] = slot,
                    Err(idx) => slots.insert(idx, slot),
                }
                merged += 1;
            }
        }
        merged
    }

    // ============ Diff queries ============

    pub fn referenced_program_ids(&self) -> BTreeSet<String> {
        self.read_state().data.referenced_program_ids()
    }

    /// Program ids referenced by the schedules and absent from the program map
    pub fn required_program_ids(&self) -> BTreeSet<String> {
        let state = self.read_state();
        state
            .data
            .referenced_program_ids()
            .into_iter()
            .filter(|id| !state.data.programs.contains_key(id))
            .collect()
    }

    /// Artwork roots to fetch under `policy`
    pub fn required_metadata_ids(&self, policy: MetadataPolicy) -> BTreeSet<String> {
        let state = self.read_state();
        let roots = state
            .data
            .referenced_program_ids()
            .iter()
            .map(|id| artwork_root(id).to_string())
            .collect::<BTreeSet<_>>();
        match policy {
            MetadataPolicy::All => roots,
            MetadataPolicy::Missing => roots
                .into_iter()
                .filter(|root| !state.data.metadata.contains_key(root))
                .collect(),
        }
    }

    /// Drops cached programs whose md5 differs from the one carried by a
    /// schedule slot, so the next program phase refetches them
    pub fn invalidate_changed_programs(&self) -> usize {
        let mut state = self.write_state();
        let CacheState { data, .. } = &mut *state;

        let stale: Vec<String> = data
            .schedules
            .values()
            .flatten()
            .filter(|slot| !slot.md5.is_empty())
            .filter_map(|slot| {
                data.programs
                    .get(&slot.program_id)
                    .filter(|p| p.md5 != slot.md5)
                    .map(|p| p.program_id.clone())
            })
            .collect();

        let mut removed = 0;
        for id in stale {
            if data.programs.remove(&id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Programs invalidated after md5 change");
        }
        removed
    }

    /// Removes one program so the next sync refetches it
    pub fn invalidate_program(&self, program_id: &str) -> bool {
        self.write_state().data.programs.remove(program_id).is_some()
    }

    // ============ Pruning ============

    /// Removes slots aired at or before `now`, stations left without slots,
    /// and programs first aired before `now - retention`
    pub fn expire_and_prune(&self, now: DateTime<Utc>, retention: Duration) -> PruneReport {
        let mut state = self.write_state();
        let data = &mut state.data;
        let mut report = PruneReport::default();

        data.schedules.retain(|_, slots| {
            let before = slots.len();
            slots.retain(|slot| slot.air_date_time > now);
            report.slots += before - slots.len();
            if slots.is_empty() {
                report.stations += 1;
                false
            } else {
                true
            }
        });

        let cutoff = (now - retention).date_naive();
        data.programs.retain(|_, program| {
            let keep = program
                .original_air_date()
                .is_none_or(|aired| aired >= cutoff);
            if !keep {
                report.programs += 1;
            }
            keep
        });

        info!(
            slots = report.slots,
            stations = report.stations,
            programs = report.programs,
            "Cache pruned"
        );
        report
    }

    // ============ Read access ============

    /// Runs `f` under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&CacheData) -> R) -> R {
        f(&self.read_state().data)
    }

    /// Deep copy of the current content
    pub fn data(&self) -> CacheData {
        self.read_state().data.clone()
    }

    pub fn channel(&self, station_id: &str) -> Option<Channel> {
        self.read_state().data.channels.get(station_id).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.read_state().data.channels.values().cloned().collect()
    }

    pub fn schedule(&self, station_id: &str) -> Vec<ScheduleSlot> {
        self.read_state()
            .data
            .schedules
            .get(station_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn program(&self, program_id: &str) -> Option<Program> {
        self.read_state().data.programs.get(program_id).cloned()
    }

    pub fn artwork(&self, program_id: &str) -> Option<ArtworkSet> {
        self.read_state()
            .data
            .metadata
            .get(artwork_root(program_id))
            .cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.read_state();
        let data = &state.data;
        CacheStats {
            channels: data.channels.len(),
            stations: data.schedules.len(),
            slots: data.schedules.values().map(Vec::len).sum(),
            programs: data.programs.len(),
            metadata: data.metadata.len(),
            expiration: data.expiration,
        }
    }
}

fn split<T>(entries: Vec<Entry<T>>) -> (Vec<T>, Vec<EntityError>) {
    let mut records = Vec::with_capacity(entries.len());
    let mut rejected = Vec::new();
    for entry in entries {
        match entry {
            Entry::Record(record) => records.push(record),
            Entry::Error(error) => rejected.push(error),
        }
    }
    (records, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn ttl() -> Duration {
        Duration::hours(DEFAULT_CACHE_TTL_HOURS)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, hour, 0, 0).unwrap()
    }

    fn schedule_payload(station: &str, slots: &[(&str, u32)]) -> Vec<u8> {
        let programs: Vec<_> = slots
            .iter()
            .map(|(id, hour)| {
                json!({
                    "programID": id,
                    "airDateTime": at(*hour).to_rfc3339(),
                    "duration": 3600,
                    "md5": format!("md5-{id}")
                })
            })
            .collect();
        serde_json::to_vec(&json!([{ "stationID": station, "programs": programs }])).unwrap()
    }

    fn program_payload(ids: &[&str]) -> Vec<u8> {
        let programs: Vec<_> = ids
            .iter()
            .map(|id| json!({"programID": id, "titles": [{"title120": format!("Title {id}")}], "md5": format!("md5-{id}")}))
            .collect();
        serde_json::to_vec(&programs).unwrap()
    }

    #[test]
    fn test_merge_is_idempotent() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();

        let schedule = schedule_payload("10001", &[("EP0000000A0001", 10), ("EP0000000B0001", 11)]);
        let programs = program_payload(&["EP0000000A0001", "EP0000000B0001"]);
        let artwork = serde_json::to_vec(&json!([
            {"programID": "EP0000000A", "data": [{"uri": "a.jpg", "width": "240", "height": "360", "aspect": "2x3"}]}
        ]))
        .unwrap();

        cache.merge(MergeKind::Schedule, &schedule).unwrap();
        cache.merge(MergeKind::Program, &programs).unwrap();
        cache.merge(MergeKind::Metadata, &artwork).unwrap();
        let once = cache.data();

        cache.merge(MergeKind::Schedule, &schedule).unwrap();
        cache.merge(MergeKind::Program, &programs).unwrap();
        cache.merge(MergeKind::Metadata, &artwork).unwrap();
        assert_eq!(cache.data(), once);

        // nouveau passage : la grille de la station est remplacée, pas dupliquée
        cache.begin_run();
        cache.merge(MergeKind::Schedule, &schedule).unwrap();
        assert_eq!(cache.data(), once);
        assert_eq!(cache.schedule("10001").len(), 2);
    }

    #[test]
    fn test_new_run_replaces_station_slots() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("EP0000000A0001", 10)]))
            .unwrap();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("EP0000000B0001", 12)]))
            .unwrap();
        assert_eq!(cache.schedule("10001").len(), 2);

        cache.begin_run();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("EP0000000C0001", 14)]))
            .unwrap();
        let slots = cache.schedule("10001");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].program_id, "EP0000000C0001");
    }

    #[test]
    fn test_required_program_ids_scenario() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(
                MergeKind::Schedule,
                &schedule_payload("10001", &[("A", 10), ("B", 11), ("C", 12)]),
            )
            .unwrap();
        cache.merge(MergeKind::Program, &program_payload(&["A", "B"])).unwrap();

        let required = cache.required_program_ids();
        assert_eq!(required, BTreeSet::from(["C".to_string()]));

        cache.merge(MergeKind::Program, &program_payload(&["C"])).unwrap();
        assert!(cache.required_program_ids().is_empty());
    }

    #[test]
    fn test_required_ids_is_set_difference() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(
                MergeKind::Schedule,
                &schedule_payload("10001", &[("EP0000000A0001", 10), ("EP0000000A0002", 11)]),
            )
            .unwrap();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10002", &[("SH0000000B0000", 10)]))
            .unwrap();
        // programme non référencé : n'intervient pas
        cache
            .merge(MergeKind::Program, &program_payload(&["EP0000000A0001", "MV0000000Z0000"]))
            .unwrap();

        let referenced = cache.referenced_program_ids();
        let present: BTreeSet<String> = cache.read(|d| d.programs.keys().cloned().collect());
        let expected: BTreeSet<String> = referenced.difference(&present).cloned().collect();
        assert_eq!(cache.required_program_ids(), expected);
        assert_eq!(expected.len(), 2);
    }

    #[test]
    fn test_required_metadata_policies() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(
                MergeKind::Schedule,
                &schedule_payload("10001", &[("EP0000000A0001", 10), ("EP0000000A0002", 11), ("SH0000000B0000", 12)]),
            )
            .unwrap();
        let artwork = serde_json::to_vec(&json!([{"programID": "EP0000000A", "data": []}])).unwrap();
        cache.merge(MergeKind::Metadata, &artwork).unwrap();

        assert_eq!(
            cache.required_metadata_ids(MetadataPolicy::Missing),
            BTreeSet::from(["SH0000000B".to_string()])
        );
        assert_eq!(cache.required_metadata_ids(MetadataPolicy::All).len(), 2);
        assert!(cache.artwork("EP0000000A0002").is_some());
    }

    #[test]
    fn test_entity_errors_are_rejected_not_merged() {
        let cache = GuideCache::in_memory(ttl());
        let raw = serde_json::to_vec(&json!([
            {"programID": "EP0000000A0001", "md5": "x"},
            {"programID": "EP0000000B0001", "code": 6001, "message": "not found"}
        ]))
        .unwrap();
        let report = cache.merge(MergeKind::Program, &raw).unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(cache.program("EP0000000B0001").is_none());
    }

    #[test]
    fn test_malformed_payload_merges_nothing() {
        let cache = GuideCache::in_memory(ttl());
        let raw = br#"[{"programID":"EP0000000A0001"},{"titles":42}]"#;
        let err = cache.merge(MergeKind::Program, raw).unwrap_err();
        assert!(matches!(err, EpgError::Decode { .. }));
        assert_eq!(cache.stats().programs, 0);
    }

    #[test]
    fn test_invalidate_changed_programs() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("A", 10), ("B", 11)]))
            .unwrap();
        // A est à jour (md5-A), B porte un md5 périmé
        let programs = serde_json::to_vec(&json!([
            {"programID": "A", "md5": "md5-A"},
            {"programID": "B", "md5": "old"}
        ]))
        .unwrap();
        cache.merge(MergeKind::Program, &programs).unwrap();

        assert_eq!(cache.invalidate_changed_programs(), 1);
        assert_eq!(cache.required_program_ids(), BTreeSet::from(["B".to_string()]));
        assert_eq!(cache.invalidate_changed_programs(), 0);
    }

    #[test]
    fn test_invalidate_program() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("A", 10), ("B", 11)]))
            .unwrap();
        cache.merge(MergeKind::Program, &program_payload(&["A", "B"])).unwrap();
        assert!(cache.required_program_ids().is_empty());

        assert!(cache.invalidate_program("A"));
        assert!(cache.program("A").is_none());
        assert_eq!(cache.required_program_ids(), BTreeSet::from(["A".to_string()]));

        // déjà absent
        assert!(!cache.invalidate_program("A"));
        assert!(!cache.invalidate_program("unknown"));
    }

    #[test]
    fn test_drop_unselected_schedules() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("A", 10)]))
            .unwrap();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10002", &[("B", 10)]))
            .unwrap();
        cache.merge_channels([Channel {
            station_id: "10001".into(),
            name: "Kept".into(),
            ..Channel::default()
        }]);

        assert_eq!(cache.drop_unselected_schedules(), 1);
        assert_eq!(cache.schedule("10001").len(), 1);
        assert!(cache.schedule("10002").is_empty());
        assert_eq!(cache.referenced_program_ids(), BTreeSet::from(["A".to_string()]));
        assert_eq!(cache.drop_unselected_schedules(), 0);
    }

    #[test]
    fn test_expire_and_prune() {
        let cache = GuideCache::in_memory(ttl());
        cache.begin_run();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("A", 8), ("B", 10), ("C", 12)]))
            .unwrap();
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10002", &[("D", 9)]))
            .unwrap();
        let programs = serde_json::to_vec(&json!([
            {"programID": "A", "originalAirDate": "2001-01-01"},
            {"programID": "B", "originalAirDate": "2026-10-01"},
            {"programID": "C"}
        ]))
        .unwrap();
        cache.merge(MergeKind::Program, &programs).unwrap();

        let now = at(10);
        let report = cache.expire_and_prune(now, Duration::days(DEFAULT_RETENTION_DAYS));
        assert_eq!(report, PruneReport { slots: 3, stations: 1, programs: 1 });

        cache.read(|data| {
            assert!(data.schedules.values().flatten().all(|s| s.air_date_time > now));
            assert!(!data.schedules.contains_key("10002"));
            assert_eq!(data.schedules["10001"].len(), 1);
            assert!(data.programs.contains_key("B"));
            assert!(data.programs.contains_key("C"));
        });

        let before = cache.data();
        assert_eq!(
            cache.expire_and_prune(now, Duration::days(DEFAULT_RETENTION_DAYS)),
            PruneReport::default()
        );
        assert_eq!(cache.data(), before);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = GuideCache::new(&path, ttl());
        cache.begin_run();
        cache.merge_channels([Channel {
            station_id: "10001".into(),
            name: "Test One".into(),
            callsign: "TST1".into(),
            channel_number: Some("4.1".into()),
            ..Channel::default()
        }]);
        cache
            .merge(MergeKind::Schedule, &schedule_payload("10001", &[("EP0000000A0001", 10)]))
            .unwrap();
        cache
            .merge(MergeKind::Program, &program_payload(&["EP0000000A0001"]))
            .unwrap();
        cache.snapshot().unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let restored = GuideCache::new(&path, ttl());
        let now = Utc::now();
        restored.restore(now).unwrap();

        let (mut left, mut right) = (cache.data(), restored.data());
        left.expiration = None;
        right.expiration = None;
        assert_eq!(left, right);
        assert_eq!(restored.expiration(), Some(now + ttl()));
    }

    #[test]
    fn test_expired_snapshot_restores_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let cache = GuideCache::new(&path, Duration::hours(1));
        cache.merge_channels([Channel {
            station_id: "10001".into(),
            ..Channel::default()
        }]);
        cache.restore(at(0)).unwrap();
        cache.merge_channels([Channel {
            station_id: "10001".into(),
            ..Channel::default()
        }]);
        cache.snapshot().unwrap();

        assert!(!cache.is_expired(at(1)));
        assert!(cache.is_expired(at(2)));

        let restored = GuideCache::new(&path, Duration::hours(1));
        restored.restore(at(2)).unwrap();
        assert_eq!(restored.stats().channels, 0);
        assert_eq!(restored.expiration(), Some(at(3)));
    }

    #[test]
    fn test_missing_and_corrupt_snapshots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let cache = GuideCache::open(&path, ttl()).unwrap();
        assert_eq!(cache.stats().programs, 0);

        std::fs::write(&path, b"{ not json").unwrap();
        let err = cache.restore(Utc::now()).unwrap_err();
        assert!(matches!(err, EpgError::Decode { .. }));
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let cache = GuideCache::new(&path, ttl());
        cache.merge(MergeKind::Program, &program_payload(&["A"])).unwrap();
        cache.snapshot().unwrap();

        cache.remove().unwrap();
        assert!(!path.exists());
        assert_eq!(cache.stats().programs, 0);
        cache.remove().unwrap();
    }
}
