//! Extension pour intégrer la configuration du guide dans pmoconfig
//!
//! Ce module fournit le trait `GuideConfigExt`, qui ajoute à
//! `pmoconfig::Config` les accesseurs typés du compte Schedules Direct, des
//! fichiers, des options de synchronisation et des options de rendu.

use crate::api::auth::hash_password;
use crate::cache::{DEFAULT_CACHE_TTL_HOURS, DEFAULT_RETENTION_DAYS, MetadataPolicy};
use crate::query::{PosterAspect, QueryOptions, RatingOptions};
use crate::sync::{Credentials, SelectedStation, SyncSettings};
use anyhow::{Result, anyhow};
use pmoconfig::Config;
use serde_yaml::Value;
use std::path::PathBuf;

const MAX_SCHEDULE_DAYS: usize = 14;

/// Trait d'extension pour la configuration du guide
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::Config;
/// use pmoepg::GuideConfigExt;
///
/// let config = Config::load_config("")?;
/// let settings = config.get_sync_settings()?;
/// println!("{} days, {} stations", settings.schedule_days, settings.stations.len());
/// ```
pub trait GuideConfigExt {
    fn get_sd_username(&self) -> Result<String>;
    fn set_sd_username(&self, username: &str) -> Result<()>;

    /// Mot de passe tel que stocké (SHA-1 hexadécimal une fois défini via `set_sd_password`)
    fn get_sd_password(&self) -> Result<String>;

    /// Stocke le hash SHA-1 du mot de passe, jamais le mot de passe en clair
    fn set_sd_password(&self, password: &str) -> Result<()>;

    /// Récupère les credentials Schedules Direct
    ///
    /// # Errors
    ///
    /// Retourne une erreur si le nom d'utilisateur ou le mot de passe est vide
    fn get_sd_credentials(&self) -> Result<Credentials>;

    /// Chemin du snapshot du cache (relatif au répertoire de configuration)
    fn get_cache_file(&self) -> Result<PathBuf>;

    /// Chemin du fichier XMLTV produit par le rendu
    fn get_xmltv_file(&self) -> Result<PathBuf>;

    fn get_cache_ttl(&self) -> Result<chrono::Duration>;

    fn get_retention(&self) -> Result<chrono::Duration>;

    fn get_selected_stations(&self) -> Result<Vec<SelectedStation>>;
    fn set_selected_stations(&self, stations: &[SelectedStation]) -> Result<()>;

    /// Réglages de synchronisation (section `options` et `stations`)
    fn get_sync_settings(&self) -> Result<SyncSettings>;

    /// Options de projection de la façade de requête
    fn get_query_options(&self) -> Result<QueryOptions>;
}

impl GuideConfigExt for Config {
    fn get_sd_username(&self) -> Result<String> {
        self.get_string(&["account", "username"], "")
    }

    fn set_sd_username(&self, username: &str) -> Result<()> {
        self.set_value(&["account", "username"], Value::String(username.to_string()))
    }

    fn get_sd_password(&self) -> Result<String> {
        self.get_string(&["account", "password"], "")
    }

    fn set_sd_password(&self, password: &str) -> Result<()> {
        self.set_value(&["account", "password"], Value::String(hash_password(password)))
    }

    fn get_sd_credentials(&self) -> Result<Credentials> {
        let username = self.get_sd_username()?;
        let password = self.get_sd_password()?;
        if username.is_empty() || password.is_empty() {
            return Err(anyhow!(
                "Schedules Direct credentials are not configured (account.username / account.password)"
            ));
        }
        Ok(Credentials { username, password })
    }

    fn get_cache_file(&self) -> Result<PathBuf> {
        self.get_managed_file(&["files", "cache"], "cache.json")
    }

    fn get_xmltv_file(&self) -> Result<PathBuf> {
        self.get_managed_file(&["files", "xmltv"], "guide.xml")
    }

    fn get_cache_ttl(&self) -> Result<chrono::Duration> {
        let hours = self.get_usize(&["options", "cache_ttl_hours"], DEFAULT_CACHE_TTL_HOURS as usize)?;
        Ok(chrono::Duration::hours(hours.max(1) as i64))
    }

    fn get_retention(&self) -> Result<chrono::Duration> {
        let days = self.get_usize(&["options", "retention_days"], DEFAULT_RETENTION_DAYS as usize)?;
        Ok(chrono::Duration::days(days as i64))
    }

    fn get_selected_stations(&self) -> Result<Vec<SelectedStation>> {
        Ok(self.get_as(&["stations"])?.unwrap_or_default())
    }

    fn set_selected_stations(&self, stations: &[SelectedStation]) -> Result<()> {
        self.set_value(&["stations"], serde_yaml::to_value(stations)?)
    }

    fn get_sync_settings(&self) -> Result<SyncSettings> {
        let defaults = SyncSettings::default();
        let options = |key: &str, default: usize| self.get_usize(&["options", key], default);

        let metadata_policy = self
            .get_as::<MetadataPolicy>(&["options", "metadata_policy"])?
            .unwrap_or_default();

        Ok(SyncSettings {
            schedule_days: options("schedule_days", defaults.schedule_days as usize)?
                .clamp(1, MAX_SCHEDULE_DAYS) as u32,
            schedule_batch_size: options("schedule_batch_size", defaults.schedule_batch_size)?,
            program_batch_size: options("program_batch_size", defaults.program_batch_size)?,
            metadata_batch_size: options("metadata_batch_size", defaults.metadata_batch_size)?,
            max_concurrency: options("max_concurrency", defaults.max_concurrency)?.max(1),
            metadata_policy,
            refresh_changed_programs: self.get_bool(
                &["options", "refresh_changed_programs"],
                defaults.refresh_changed_programs,
            )?,
            download_errors: self.get_bool(&["options", "download_errors"], defaults.download_errors)?,
            stations: self.get_selected_stations()?,
        })
    }

    fn get_query_options(&self) -> Result<QueryOptions> {
        let defaults = QueryOptions::default();
        let rating = self
            .get_as::<RatingOptions>(&["options", "rating"])?
            .unwrap_or_default();

        Ok(QueryOptions {
            subtitle_into_description: self.get_bool(
                &["options", "subtitle_into_description"],
                defaults.subtitle_into_description,
            )?,
            credits: self.get_bool(&["options", "credits"], defaults.credits)?,
            poster_aspect: PosterAspect::from(self.get_string(&["options", "poster_aspect"], "all")?.as_str()),
            image_base_url: self.get_string(&["options", "image_base_url"], &defaults.image_base_url)?,
            rating,
        })
    }
}
