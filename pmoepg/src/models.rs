//! Cached entities and the Schedules Direct wire shapes they decode from
//!
//! The cache stores these structures as-is: a snapshot is the JSON
//! serialization of four maps of them (see [`crate::cache`]).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Length of the series root shared by all episodes of a show (`SH01234567`)
pub const ARTWORK_ROOT_LEN: usize = 10;

/// Flexible deserializer for values sent either as strings or as numbers
pub(crate) fn deserialize_dimension<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => {
            let v = n
                .as_u64()
                .ok_or_else(|| Error::custom("dimension must be a positive integer"))?;
            u32::try_from(v).map_err(Error::custom)
        }
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s.trim().parse().map_err(Error::custom),
        Value::Null => Ok(0),
        _ => Err(Error::custom("dimension must be a string or number")),
    }
}

/// Artwork root of a program id (the first 10 characters)
pub fn artwork_root(program_id: &str) -> &str {
    match program_id.char_indices().nth(ARTWORK_ROOT_LEN) {
        Some((idx, _)) => &program_id[..idx],
        None => program_id,
    }
}

// ============ Channels ============

/// Station logo descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Logo {
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub md5: String,
}

/// A broadcast station selected by the user
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    #[serde(rename = "stationID")]
    pub station_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub affiliate: Option<String>,
    #[serde(default)]
    pub broadcast_language: Vec<String>,
    #[serde(default)]
    pub logo: Option<Logo>,
    #[serde(default)]
    pub station_logo: Vec<Logo>,
    /// Lineup the station was merged from
    #[serde(default)]
    pub lineup: Option<String>,
    /// Channel number in that lineup (from the roster map)
    #[serde(default)]
    pub channel_number: Option<String>,
}

impl Channel {
    /// First broadcast language, `en` when the roster gives none
    pub fn language(&self) -> &str {
        self.broadcast_language
            .first()
            .map(String::as_str)
            .unwrap_or("en")
    }

    /// Best logo: the explicit one, else the widest of the station logos
    pub fn best_logo(&self) -> Option<&Logo> {
        self.logo
            .as_ref()
            .filter(|l| !l.url.is_empty())
            .or_else(|| self.station_logo.iter().max_by_key(|l| l.width))
    }
}

/// Roster returned by `GET lineups/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct LineupRoster {
    #[serde(default)]
    pub map: Vec<RosterEntry>,
    #[serde(default)]
    pub stations: Vec<Channel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "stationID")]
    pub station_id: String,
    #[serde(default)]
    pub channel: Option<String>,
}

// ============ Schedules ============

/// Rating attached to a single airing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatingStub {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub code: String,
}

/// One airing of a program on one station
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSlot {
    #[serde(rename = "programID")]
    pub program_id: String,
    pub air_date_time: DateTime<Utc>,
    /// Duration in seconds
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub live_tape_delay: Option<String>,
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub audio_properties: Vec<String>,
    #[serde(default)]
    pub video_properties: Vec<String>,
    #[serde(default)]
    pub ratings: Vec<RatingStub>,
    #[serde(default)]
    pub md5: String,
}

impl ScheduleSlot {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.air_date_time + chrono::Duration::seconds(self.duration)
    }

    pub fn is_live(&self) -> bool {
        self.live_tape_delay.as_deref() == Some("Live")
    }
}

/// One entry of the `POST schedules` answer (one station, one day)
#[derive(Debug, Clone, Deserialize)]
pub struct StationSchedule {
    #[serde(rename = "stationID")]
    pub station_id: String,
    #[serde(default)]
    pub programs: Vec<ScheduleSlot>,
}

/// Body entry of a `POST schedules` request
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScheduleRequest {
    #[serde(rename = "stationID")]
    pub station_id: String,
    pub date: Vec<String>,
}

// ============ Programs ============

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgramTitle {
    #[serde(default)]
    pub title120: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub description_language: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Descriptions {
    #[serde(default)]
    pub description1000: Vec<Description>,
    #[serde(default)]
    pub description100: Vec<Description>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CastMember {
    #[serde(default)]
    pub billing_order: String,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub name_id: String,
    #[serde(default)]
    pub person_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrewMember {
    #[serde(default)]
    pub billing_order: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub name_id: String,
    #[serde(default)]
    pub person_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRating {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gracenote {
    #[serde(default)]
    pub season: u32,
    #[serde(default)]
    pub episode: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramMetadata {
    #[serde(rename = "Gracenote", default)]
    pub gracenote: Option<Gracenote>,
}

/// Program details, keyed by program id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    #[serde(rename = "programID")]
    pub program_id: String,
    #[serde(default)]
    pub titles: Vec<ProgramTitle>,
    #[serde(default)]
    pub episode_title150: Option<String>,
    #[serde(default)]
    pub descriptions: Descriptions,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub cast: Vec<CastMember>,
    #[serde(default)]
    pub crew: Vec<CrewMember>,
    #[serde(default)]
    pub content_rating: Vec<ContentRating>,
    #[serde(default)]
    pub content_advisory: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<ProgramMetadata>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub original_air_date: Option<String>,
    #[serde(default)]
    pub show_type: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(rename = "resourceID", default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub has_image_artwork: bool,
    #[serde(default)]
    pub has_series_artwork: bool,
    #[serde(default)]
    pub has_episode_artwork: bool,
    #[serde(default)]
    pub md5: String,
}

impl Program {
    pub fn original_air_date(&self) -> Option<NaiveDate> {
        self.original_air_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }

    /// Last Gracenote season/episode pair with both numbers set
    pub fn season_episode(&self) -> Option<Gracenote> {
        self.metadata
            .iter()
            .filter_map(|m| m.gracenote)
            .filter(|g| g.season != 0 && g.episode != 0)
            .last()
    }
}

// ============ Artwork ============

/// Image descriptor from `POST metadata/programs`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artwork {
    pub uri: String,
    #[serde(default)]
    pub aspect: String,
    #[serde(default, deserialize_with = "deserialize_dimension")]
    pub width: u32,
    #[serde(default, deserialize_with = "deserialize_dimension")]
    pub height: u32,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tier: String,
}

/// Artwork of one series/program root
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtworkSet {
    #[serde(rename = "programID")]
    pub program_id: String,
    #[serde(default)]
    pub data: Vec<Artwork>,
}

// ============ Errors inside batches ============

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EntityErrorData {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Error object returned in place of a schedule, program or artwork record
///
/// Both the flat `{code, message, programID}` form and the nested
/// `{data: {code, message}, programID}` form are accepted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EntityError {
    #[serde(rename = "programID", alias = "stationID", default)]
    pub program_id: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<EntityErrorData>,
}

impl EntityError {
    pub fn code(&self) -> i64 {
        self.code
            .or_else(|| self.data.as_ref().map(|d| d.code))
            .unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .or_else(|| self.data.as_ref().map(|d| d.message.as_str()))
            .unwrap_or("")
    }
}
