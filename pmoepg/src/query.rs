//! Projections en lecture seule du cache pour le rendu du guide
//!
//! [`GuideQuery`] transforme les entités du [`GuideCache`] en objets valeur
//! prêts pour un générateur XMLTV : titres, sous-titre, descriptions,
//! crédits, catégories, numérotation d'épisode, icônes, classifications et
//! marqueur de rediffusion. Aucune méthode ne modifie le cache.

use crate::cache::{CacheData, GuideCache};
use crate::models::{Channel, Program, ScheduleSlot, artwork_root};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Titre affiché quand le programme est inconnu
pub const NO_EPG_INFO: &str = "No EPG Info";

/// Catégories d'illustration préférées, par ordre de découverte
const PREFERRED_ART: [&str; 4] = ["Poster Art", "Box Art", "Banner-L1", "Banner-L2"];
const FALLBACK_ART: &str = "VOD Art";
const ALL_ASPECTS: [&str; 4] = ["2x3", "4x3", "3x4", "16x9"];

// ============ Value objects ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Title {
    pub value: String,
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubTitle {
    pub value: String,
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Desc {
    pub value: String,
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Credits {
    pub directors: Vec<String>,
    pub actors: Vec<Actor>,
    pub writers: Vec<String>,
    pub producers: Vec<String>,
    pub presenters: Vec<String>,
}

impl Credits {
    pub fn is_empty(&self) -> bool {
        self.directors.is_empty()
            && self.actors.is_empty()
            && self.writers.is_empty()
            && self.producers.is_empty()
            && self.presenters.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub value: String,
    pub lang: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpisodeNum {
    pub system: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Icon {
    pub src: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rating {
    pub system: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviouslyShown {
    /// Original air date (`YYYY-MM-DD`), when known
    pub start: Option<String>,
}

/// One airing, with every projection the renderer needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Programme {
    pub channel: String,
    pub program_id: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub titles: Vec<Title>,
    pub sub_title: Option<SubTitle>,
    pub descs: Vec<Desc>,
    pub credits: Credits,
    pub categories: Vec<Category>,
    pub episode_nums: Vec<EpisodeNum>,
    pub icons: Vec<Icon>,
    pub ratings: Vec<Rating>,
    pub previously_shown: Option<PreviouslyShown>,
    pub new: bool,
    pub live: bool,
    pub video_quality: Option<&'static str>,
    pub audio: Option<&'static str>,
}

// ============ Options ============

/// Aspect ratios for which an icon is selected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PosterAspect {
    #[default]
    All,
    Portrait,
    Landscape,
    Square,
    Exact(String),
}

impl PosterAspect {
    pub fn aspects(&self) -> Vec<&str> {
        match self {
            PosterAspect::All => ALL_ASPECTS.to_vec(),
            PosterAspect::Portrait => vec!["2x3"],
            PosterAspect::Landscape => vec!["16x9"],
            PosterAspect::Square => vec!["1x1"],
            PosterAspect::Exact(aspect) => vec![aspect.as_str()],
        }
    }
}

impl From<&str> for PosterAspect {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "all" => PosterAspect::All,
            "portrait" => PosterAspect::Portrait,
            "landscape" => PosterAspect::Landscape,
            "square" => PosterAspect::Square,
            other => PosterAspect::Exact(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for PosterAspect {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(PosterAspect::from(value.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RatingOptions {
    /// Emit ratings at all
    pub guidelines: bool,
    /// 0 means unlimited
    pub max_entries: usize,
    /// Preferred countries, in order; empty keeps every country
    pub countries: Vec<String>,
    pub country_code_as_system: bool,
}

impl Default for RatingOptions {
    fn default() -> Self {
        Self {
            guidelines: true,
            max_entries: 1,
            countries: Vec::new(),
            country_code_as_system: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub subtitle_into_description: bool,
    pub credits: bool,
    pub poster_aspect: PosterAspect,
    pub image_base_url: String,
    pub rating: RatingOptions,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            subtitle_into_description: true,
            credits: true,
            poster_aspect: PosterAspect::All,
            image_base_url: "https://json.schedulesdirect.org/20141201/image/".to_string(),
            rating: RatingOptions::default(),
        }
    }
}

// ============ Façade ============

/// Façade de lecture du cache
#[derive(Debug, Clone)]
pub struct GuideQuery {
    cache: Arc<GuideCache>,
    options: QueryOptions,
}

impl GuideQuery {
    pub fn new(cache: Arc<GuideCache>, options: QueryOptions) -> Self {
        Self { cache, options }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    fn with_program<R>(&self, program_id: &str, f: impl FnOnce(Option<&Program>) -> R) -> R {
        self.cache.read(|data| f(data.programs.get(program_id)))
    }

    /// Channels sorted by channel number, then station id
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = self.cache.channels();
        channels.sort_by(|a, b| {
            channel_sort_key(a)
                .partial_cmp(&channel_sort_key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.station_id.cmp(&b.station_id))
        });
        channels
    }

    pub fn slots(&self, station_id: &str) -> Vec<ScheduleSlot> {
        self.cache.schedule(station_id)
    }

    pub fn titles(&self, program_id: &str, lang: &str) -> Vec<Title> {
        self.with_program(program_id, |p| titles(p, lang))
    }

    pub fn subtitle(&self, program_id: &str, lang: &str) -> Option<SubTitle> {
        self.with_program(program_id, |p| p.and_then(|p| subtitle(p, lang)))
    }

    pub fn descriptions(&self, program_id: &str, subtitle: Option<&str>) -> Vec<Desc> {
        self.with_program(program_id, |p| {
            p.map(|p| descriptions(p, subtitle, self.options.subtitle_into_description))
                .unwrap_or_default()
        })
    }

    pub fn credits(&self, program_id: &str) -> Credits {
        if !self.options.credits {
            return Credits::default();
        }
        self.with_program(program_id, |p| p.map(credits).unwrap_or_default())
    }

    pub fn categories(&self, program_id: &str) -> Vec<Category> {
        self.with_program(program_id, |p| p.map(categories).unwrap_or_default())
    }

    pub fn episode_numbers(&self, program_id: &str) -> Vec<EpisodeNum> {
        self.with_program(program_id, |p| {
            p.map(|p| episode_numbers(program_id, p)).unwrap_or_default()
        })
    }

    pub fn previously_shown(&self, program_id: &str) -> Option<PreviouslyShown> {
        self.with_program(program_id, |p| {
            p.map(|p| PreviouslyShown {
                start: p.original_air_date.clone().filter(|d| !d.is_empty()),
            })
        })
    }

    pub fn icons(&self, program_id: &str) -> Vec<Icon> {
        self.cache.read(|data| icons(data, program_id, &self.options))
    }

    /// Ratings of `program_id`; `country` comes first when no preferred
    /// countries are configured
    pub fn ratings(&self, program_id: &str, country: &str) -> Vec<Rating> {
        self.with_program(program_id, |p| {
            p.map(|p| ratings(p, country, &self.options.rating))
                .unwrap_or_default()
        })
    }

    /// Full projection of every slot of `station_id`
    pub fn programmes(&self, station_id: &str) -> Vec<Programme> {
        self.cache.read(|data| {
            let Some(slots) = data.schedules.get(station_id) else {
                return Vec::new();
            };
            let channel = data.channels.get(station_id);
            let lang = channel.map(Channel::language).unwrap_or("en");
            let country = channel.map(lineup_country).unwrap_or_default();

            slots
                .iter()
                .map(|slot| self.programme(data, station_id, slot, lang, &country))
                .collect()
        })
    }

    fn programme(
        &self,
        data: &CacheData,
        station_id: &str,
        slot: &ScheduleSlot,
        lang: &str,
        country: &str,
    ) -> Programme {
        let program = data.programs.get(&slot.program_id);
        let sub_title = program.and_then(|p| subtitle(p, lang));
        let sub_value = sub_title.as_ref().map(|s| s.value.as_str());

        Programme {
            channel: station_id.to_string(),
            program_id: slot.program_id.clone(),
            start: slot.air_date_time,
            stop: slot.end_time(),
            titles: titles(program, lang),
            descs: program
                .map(|p| descriptions(p, sub_value, self.options.subtitle_into_description))
                .unwrap_or_default(),
            sub_title,
            credits: program
                .filter(|_| self.options.credits)
                .map(credits)
                .unwrap_or_default(),
            categories: program.map(categories).unwrap_or_default(),
            episode_nums: program
                .map(|p| episode_numbers(&slot.program_id, p))
                .unwrap_or_default(),
            icons: icons(data, &slot.program_id, &self.options),
            ratings: program
                .map(|p| ratings(p, country, &self.options.rating))
                .unwrap_or_default(),
            previously_shown: program.filter(|_| !slot.new).map(|p| PreviouslyShown {
                start: p.original_air_date.clone().filter(|d| !d.is_empty()),
            }),
            new: slot.new,
            live: slot.is_live(),
            video_quality: video_quality(slot),
            audio: audio_mode(slot),
        }
    }
}

fn channel_sort_key(channel: &Channel) -> f64 {
    channel
        .channel_number
        .as_deref()
        .and_then(|n| n.parse::<f64>().ok())
        .unwrap_or(f64::MAX)
}

// ============ Projections ============

/// Country code of the lineup a channel comes from (`USA-NY12345-X` → `USA`)
pub fn lineup_country(channel: &Channel) -> String {
    channel
        .lineup
        .as_deref()
        .and_then(|l| l.split('-').next())
        .unwrap_or_default()
        .to_string()
}

pub fn titles(program: Option<&Program>, lang: &str) -> Vec<Title> {
    let titles: Vec<Title> = program
        .map(|p| {
            p.titles
                .iter()
                .filter(|t| !t.title120.is_empty())
                .map(|t| Title {
                    value: t.title120.clone(),
                    lang: lang.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    if titles.is_empty() {
        return vec![Title {
            value: NO_EPG_INFO.to_string(),
            lang: "en".to_string(),
        }];
    }
    titles
}

/// Episode title, else the last short description
pub fn subtitle(program: &Program, lang: &str) -> Option<SubTitle> {
    if let Some(episode) = program.episode_title150.as_deref().filter(|t| !t.is_empty()) {
        return Some(SubTitle {
            value: episode.to_string(),
            lang: lang.to_string(),
        });
    }
    program
        .descriptions
        .description100
        .last()
        .map(|d| SubTitle {
            value: d.description.clone(),
            lang: d.description_language.clone(),
        })
}

pub fn descriptions(program: &Program, subtitle: Option<&str>, prefix_subtitle: bool) -> Vec<Desc> {
    let prefix = subtitle.filter(|s| prefix_subtitle && !s.is_empty());
    program
        .descriptions
        .description1000
        .iter()
        .map(|d| Desc {
            value: match prefix {
                Some(sub) => format!("[{}]\n{}", sub, d.description),
                None => d.description.clone(),
            },
            lang: d.description_language.clone(),
        })
        .collect()
}

pub fn credits(program: &Program) -> Credits {
    let mut credits = Credits::default();
    for member in &program.crew {
        let target = match member.role.as_str() {
            "Director" => &mut credits.directors,
            "Producer" => &mut credits.producers,
            "Presenter" => &mut credits.presenters,
            "Writer" => &mut credits.writers,
            _ => continue,
        };
        target.push(member.name.clone());
    }
    credits.actors = program
        .cast
        .iter()
        .filter(|c| c.role == "Actor")
        .map(|c| Actor {
            name: c.name.clone(),
            role: c.character_name.clone(),
        })
        .collect();
    credits
}

pub fn categories(program: &Program) -> Vec<Category> {
    program
        .genres
        .iter()
        .map(|g| Category {
            value: g.clone(),
            lang: "en".to_string(),
        })
        .collect()
}

/// `dd_progid` form of a program id
///
/// Episodes split the 14-character id after its root, series and movies
/// use the root followed by `.0000`.
pub fn dd_progid(program_id: &str) -> String {
    let root = artwork_root(program_id);
    let rest = &program_id[root.len()..];
    match program_id.get(..2) {
        Some("EP") if !rest.is_empty() => format!("{root}.{rest}"),
        Some("SH") | Some("MV") => format!("{root}.0000"),
        _ => program_id.to_string(),
    }
}

pub fn episode_numbers(program_id: &str, program: &Program) -> Vec<EpisodeNum> {
    let mut numbers = Vec::new();

    if let Some(number) = program.season_episode() {
        numbers.push(EpisodeNum {
            system: "xmltv_ns".to_string(),
            value: format!("{}.{}.", number.season - 1, number.episode - 1),
        });
        numbers.push(EpisodeNum {
            system: "onscreen".to_string(),
            value: format!("S{} E{}", number.season, number.episode),
        });
    } else {
        numbers.push(EpisodeNum {
            system: "dd_progid".to_string(),
            value: dd_progid(program_id),
        });
    }

    if let Some(aired) = program.original_air_date.as_deref().filter(|d| !d.is_empty()) {
        numbers.push(EpisodeNum {
            system: "original-air-date".to_string(),
            value: aired.to_string(),
        });
    }
    numbers
}

fn resolve_uri(uri: &str, base: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), uri.trim_start_matches('/'))
}

/// Widest image per requested aspect, within the preferred art category
pub fn icons(data: &CacheData, program_id: &str, options: &QueryOptions) -> Vec<Icon> {
    let Some(artwork) = data.metadata.get(artwork_root(program_id)) else {
        return Vec::new();
    };

    let category = artwork
        .data
        .iter()
        .find(|a| PREFERRED_ART.contains(&a.category.as_str()))
        .or_else(|| artwork.data.iter().find(|a| a.category == FALLBACK_ART))
        .map(|a| a.category.as_str());
    let Some(category) = category else {
        return Vec::new();
    };

    options
        .poster_aspect
        .aspects()
        .into_iter()
        .filter_map(|aspect| {
            artwork
                .data
                .iter()
                .filter(|a| a.category == category && a.aspect == aspect && a.width > 0)
                .max_by_key(|a| a.width)
                .map(|a| Icon {
                    src: resolve_uri(&a.uri, &options.image_base_url),
                    width: a.width,
                    height: a.height,
                })
        })
        .collect()
}

pub fn ratings(program: &Program, country: &str, options: &RatingOptions) -> Vec<Rating> {
    if !options.guidelines {
        return Vec::new();
    }

    let ordered: Vec<_> = if options.countries.is_empty() {
        program
            .content_rating
            .iter()
            .filter(|r| r.country == country)
            .chain(program.content_rating.iter().filter(|r| r.country != country))
            .collect()
    } else {
        options
            .countries
            .iter()
            .flat_map(|c| program.content_rating.iter().filter(move |r| &r.country == c))
            .collect()
    };

    let limit = if options.max_entries == 0 {
        usize::MAX
    } else {
        options.max_entries
    };
    ordered
        .into_iter()
        .take(limit)
        .map(|r| Rating {
            system: if options.country_code_as_system {
                r.country.clone()
            } else {
                r.body.clone()
            },
            value: r.code.clone(),
        })
        .collect()
}

pub fn video_quality(slot: &ScheduleSlot) -> Option<&'static str> {
    let has = |tag: &str| slot.video_properties.iter().any(|p| p.eq_ignore_ascii_case(tag));
    if has("uhdtv") {
        Some("UHDTV")
    } else if has("hdtv") {
        Some("HDTV")
    } else {
        None
    }
}

pub fn audio_mode(slot: &ScheduleSlot) -> Option<&'static str> {
    const MODES: [(&str, &str); 5] = [
        ("dd 5.1", "dolby digital"),
        ("dolby", "dolby"),
        ("surround", "surround"),
        ("stereo", "stereo"),
        ("mono", "mono"),
    ];
    MODES.iter().find_map(|(tag, mode)| {
        slot.audio_properties
            .iter()
            .any(|p| p.eq_ignore_ascii_case(tag))
            .then_some(*mode)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MergeKind;
    use chrono::Duration;
    use serde_json::json;

    fn program(value: serde_json::Value) -> Program {
        serde_json::from_value(value).unwrap()
    }

    fn loaded_cache() -> Arc<GuideCache> {
        let cache = Arc::new(GuideCache::in_memory(Duration::hours(24)));
        cache.begin_run();
        cache.merge_channels([Channel {
            station_id: "10001".into(),
            name: "Test One".into(),
            broadcast_language: vec!["fr".into()],
            lineup: Some("FRA-0000001-DEFAULT".into()),
            channel_number: Some("2".into()),
            ..Channel::default()
        }]);
        let schedule = json!([{
            "stationID": "10001",
            "programs": [
                {"programID": "EP0000000A0002", "airDateTime": "2026-10-16T20:00:00Z", "duration": 3000,
                 "new": true, "videoProperties": ["hdtv"], "audioProperties": ["stereo", "DD 5.1"]},
                {"programID": "MV0000000B0000", "airDateTime": "2026-10-16T21:00:00Z", "duration": 5400}
            ]
        }]);
        cache
            .merge(MergeKind::Schedule, &serde_json::to_vec(&schedule).unwrap())
            .unwrap();
        let programs = json!([{
            "programID": "EP0000000A0002",
            "titles": [{"title120": "La Série"}],
            "episodeTitle150": "Le Retour",
            "descriptions": {"description1000": [{"description": "Longue description.", "descriptionLanguage": "fr"}]},
            "genres": ["Drama"],
            "contentRating": [
                {"body": "USA Parental Rating", "code": "TV14", "country": "USA"},
                {"body": "Conseil Supérieur de l'Audiovisuel", "code": "-12", "country": "FRA"}
            ],
            "metadata": [{"Gracenote": {"season": 3, "episode": 7}}],
            "originalAirDate": "2026-10-16"
        }]);
        cache
            .merge(MergeKind::Program, &serde_json::to_vec(&programs).unwrap())
            .unwrap();
        let artwork = json!([{
            "programID": "EP0000000A",
            "data": [
                {"uri": "assets/small.jpg", "width": "120", "height": "180", "aspect": "2x3", "category": "Banner-L1"},
                {"uri": "assets/large.jpg", "width": "240", "height": "360", "aspect": "2x3", "category": "Banner-L1"},
                {"uri": "https://cdn/iconic.jpg", "width": "1920", "height": "1080", "aspect": "16x9", "category": "Iconic"},
                {"uri": "assets/wide.jpg", "width": "960", "height": "540", "aspect": "16x9", "category": "Banner-L1"}
            ]
        }]);
        cache
            .merge(MergeKind::Metadata, &serde_json::to_vec(&artwork).unwrap())
            .unwrap();
        cache
    }

    #[test]
    fn test_title_fallback() {
        assert_eq!(titles(None, "fr")[0].value, NO_EPG_INFO);
        assert_eq!(titles(None, "fr")[0].lang, "en");

        let query = GuideQuery::new(loaded_cache(), QueryOptions::default());
        assert_eq!(query.titles("EP0000000A0002", "fr")[0].value, "La Série");
        assert_eq!(query.titles("MV0000000B0000", "fr")[0].value, NO_EPG_INFO);
    }

    #[test]
    fn test_subtitle_and_descriptions() {
        let p = program(json!({
            "programID": "SH0000000C0000",
            "descriptions": {
                "description100": [{"description": "Short.", "descriptionLanguage": "en"}],
                "description1000": [{"description": "Long.", "descriptionLanguage": "en"}]
            }
        }));
        let sub = subtitle(&p, "fr").unwrap();
        assert_eq!(sub.value, "Short.");
        assert_eq!(sub.lang, "en");

        assert_eq!(descriptions(&p, Some("Short."), true)[0].value, "[Short.]\nLong.");
        assert_eq!(descriptions(&p, Some("Short."), false)[0].value, "Long.");
        assert_eq!(descriptions(&p, None, true)[0].value, "Long.");
    }

    #[test]
    fn test_credits_by_role() {
        let p = program(json!({
            "programID": "MV0000000B0000",
            "crew": [
                {"name": "Ann Director", "role": "Director"},
                {"name": "Bob Writer", "role": "Writer"},
                {"name": "Gaffer", "role": "Lighting"}
            ],
            "cast": [
                {"name": "Cy Actor", "role": "Actor", "characterName": "Hero"},
                {"name": "Dee Guest", "role": "Guest Star"}
            ]
        }));
        let c = credits(&p);
        assert_eq!(c.directors, vec!["Ann Director"]);
        assert_eq!(c.writers, vec!["Bob Writer"]);
        assert_eq!(c.actors, vec![Actor { name: "Cy Actor".into(), role: "Hero".into() }]);
        assert!(c.producers.is_empty());
    }

    #[test]
    fn test_episode_numbers() {
        let query = GuideQuery::new(loaded_cache(), QueryOptions::default());
        let numbers = query.episode_numbers("EP0000000A0002");
        let systems: Vec<_> = numbers.iter().map(|n| (n.system.as_str(), n.value.as_str())).collect();
        assert_eq!(
            systems,
            vec![
                ("xmltv_ns", "2.6."),
                ("onscreen", "S3 E7"),
                ("original-air-date", "2026-10-16")
            ]
        );

        assert_eq!(dd_progid("EP0000000A0002"), "EP0000000A.0002");
        assert_eq!(dd_progid("SH0000000C0000"), "SH0000000C.0000");
        assert_eq!(dd_progid("MV0000000B0000"), "MV0000000B.0000");
        assert_eq!(dd_progid("XX1"), "XX1");
    }

    #[test]
    fn test_icons_widest_per_aspect() {
        let cache = loaded_cache();
        let query = GuideQuery::new(Arc::clone(&cache), QueryOptions::default());
        let icons = query.icons("EP0000000A0002");
        assert_eq!(
            icons,
            vec![
                Icon {
                    src: "https://json.schedulesdirect.org/20141201/image/assets/large.jpg".into(),
                    width: 240,
                    height: 360
                },
                Icon {
                    src: "https://json.schedulesdirect.org/20141201/image/assets/wide.jpg".into(),
                    width: 960,
                    height: 540
                }
            ]
        );

        let portrait = GuideQuery::new(
            cache,
            QueryOptions {
                poster_aspect: PosterAspect::from("portrait"),
                ..QueryOptions::default()
            },
        );
        assert_eq!(portrait.icons("EP0000000A0002").len(), 1);
        assert!(portrait.icons("SH9999999Z0000").is_empty());
    }

    #[test]
    fn test_ratings_order_and_limits() {
        let p = program(json!({
            "programID": "EP1",
            "contentRating": [
                {"body": "USA Parental Rating", "code": "TV14", "country": "USA"},
                {"body": "CSA", "code": "-12", "country": "FRA"},
                {"body": "FSK", "code": "12", "country": "DEU"}
            ]
        }));

        let one = ratings(&p, "FRA", &RatingOptions::default());
        assert_eq!(one, vec![Rating { system: "CSA".into(), value: "-12".into() }]);

        let all = RatingOptions {
            max_entries: 0,
            country_code_as_system: true,
            ..RatingOptions::default()
        };
        let systems: Vec<_> = ratings(&p, "DEU", &all).into_iter().map(|r| r.system).collect();
        assert_eq!(systems, vec!["DEU", "USA", "FRA"]);

        let preferred = RatingOptions {
            max_entries: 0,
            countries: vec!["FRA".into(), "USA".into()],
            ..RatingOptions::default()
        };
        let values: Vec<_> = ratings(&p, "DEU", &preferred).into_iter().map(|r| r.value).collect();
        assert_eq!(values, vec!["-12", "TV14"]);

        let disabled = RatingOptions {
            guidelines: false,
            ..RatingOptions::default()
        };
        assert!(ratings(&p, "USA", &disabled).is_empty());
    }

    #[test]
    fn test_programmes_projection() {
        let query = GuideQuery::new(loaded_cache(), QueryOptions::default());
        let programmes = query.programmes("10001");
        assert_eq!(programmes.len(), 2);

        let first = &programmes[0];
        assert_eq!(first.titles[0].lang, "fr");
        assert_eq!(first.sub_title.as_ref().unwrap().value, "Le Retour");
        assert_eq!(first.descs[0].value, "[Le Retour]\nLongue description.");
        assert_eq!(first.ratings[0].value, "-12");
        assert_eq!(first.stop - first.start, Duration::seconds(3000));
        assert!(first.new);
        assert!(first.previously_shown.is_none());
        assert_eq!(first.video_quality, Some("HDTV"));
        assert_eq!(first.audio, Some("dolby digital"));

        let second = &programmes[1];
        assert_eq!(second.titles[0].value, NO_EPG_INFO);
        assert_eq!(
            second.episode_nums,
            Vec::<EpisodeNum>::new(),
        );
        assert!(query.programmes("99999").is_empty());
    }

    #[test]
    fn test_previously_shown_and_categories() {
        let query = GuideQuery::new(loaded_cache(), QueryOptions::default());
        assert_eq!(
            query.previously_shown("EP0000000A0002"),
            Some(PreviouslyShown { start: Some("2026-10-16".into()) })
        );
        assert!(query.previously_shown("unknown").is_none());
        assert_eq!(query.categories("EP0000000A0002")[0].value, "Drama");
    }

    #[test]
    fn test_credits_disabled() {
        let query = GuideQuery::new(
            loaded_cache(),
            QueryOptions {
                credits: false,
                ..QueryOptions::default()
            },
        );
        assert!(query.credits("EP0000000A0002").is_empty());
    }

    #[test]
    fn test_lineup_country_and_channel_order() {
        let cache = loaded_cache();
        cache.merge_channels([Channel {
            station_id: "10000".into(),
            channel_number: Some("10".into()),
            ..Channel::default()
        }]);
        let query = GuideQuery::new(cache, QueryOptions::default());
        let channels = query.channels();
        assert_eq!(channels[0].station_id, "10001");
        assert_eq!(lineup_country(&channels[0]), "FRA");
        assert_eq!(lineup_country(&channels[1]), "");
    }
}
