//! # pmoepg - Synchronisation Schedules Direct pour PMOGuide
//!
//! Cette crate maintient un cache local du guide des programmes TV, alimenté
//! de manière incrémentale depuis l'API JSON de Schedules Direct, et l'expose
//! en lecture seule au générateur XMLTV.
//!
//! ## Vue d'ensemble
//!
//! - Client HTTP authentifié, limité en débit (seau à jetons) et avec réessais
//! - Cache des chaînes, grilles, programmes et illustrations, persisté sur disque
//! - Synchronisation en phases : seuls les programmes absents du cache sont demandés
//! - Façade de requête produisant titres, crédits, icônes, classifications...
//!
//! ## Structure des modules
//!
//! ```text
//! pmoepg/
//! ├── src/
//! │   ├── lib.rs              # Module principal (ce fichier)
//! │   ├── api/
//! │   │   ├── mod.rs          # SdApi, ApiCall, envoi avec réessais
//! │   │   ├── auth.rs         # /token et /status
//! │   │   ├── rate_limit.rs   # Seau à jetons
//! │   │   └── retry.rs        # Backoff exponentiel
//! │   ├── payload.rs          # gzip, tableaux de lots, objets d'erreur
//! │   ├── models.rs           # Entités du cache
//! │   ├── cache.rs            # GuideCache
//! │   ├── sync.rs             # GuideSync (orchestrateur)
//! │   ├── query.rs            # GuideQuery (façade de lecture)
//! │   ├── config_ext.rs       # Extension pmoconfig
//! │   └── error.rs            # Gestion des erreurs
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use pmoconfig::Config;
//! use pmoepg::{GuideCache, GuideConfigExt, GuideQuery, GuideSync, SdApi};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_config("")?;
//!
//!     let cache = Arc::new(GuideCache::open(config.get_cache_file()?, config.get_cache_ttl()?)?);
//!     let api = Arc::new(SdApi::new()?);
//!     let sync = GuideSync::new(api, Arc::clone(&cache), config.get_sync_settings()?)
//!         .with_credentials(config.get_sd_credentials()?);
//!
//!     let report = sync.run(&CancellationToken::new()).await?;
//!     println!("{} programs fetched", report.programs.merged);
//!
//!     let query = GuideQuery::new(cache, config.get_query_options()?);
//!     for channel in query.channels() {
//!         for programme in query.programmes(&channel.station_id) {
//!             println!("{} {}", programme.start, programme.titles[0].value);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod config_ext;
pub mod error;
pub mod models;
pub mod payload;
pub mod query;
pub mod sync;

pub use api::{ApiCall, SdApi, SdApiBuilder};
pub use cache::{CacheStats, GuideCache, MergeKind, MergeReport, MetadataPolicy, PruneReport};
pub use config_ext::GuideConfigExt;
pub use error::{EpgError, Result};
pub use models::{ArtworkSet, Channel, EntityError, Program, ScheduleSlot};
pub use query::{GuideQuery, PosterAspect, Programme, QueryOptions, RatingOptions};
pub use sync::{Credentials, GuideSync, PhaseReport, SelectedStation, SyncReport, SyncSettings};
