//! Core record types for the pumpkin stats engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "pumpkin-core";

/// Placement code marking a disqualified entry.
pub const DISQUALIFIED_PLACE: &str = "DMG";

/// Persisted field names written by the engine.
pub mod fields {
    pub const LIFETIME_GLOBAL_RANK: &str = "lifetimeGlobalRank";
    pub const YEAR_GLOBAL_RANK: &str = "yearGlobalRank";
    pub const LIFETIME_STATE_RANK: &str = "lifetimeStateRank";
    pub const YEARLY_STATE_RANK: &str = "yearlyStateRank";
    pub const LIFETIME_COUNTRY_RANK: &str = "lifetimeCountryRank";
    pub const YEARLY_COUNTRY_RANK: &str = "yearlyCountryRank";

    pub const LIFETIME_MAX_WEIGHT: &str = "LifetimeMaxWeight";
    pub const NUMBER_OF_ENTRIES: &str = "NumberOfEntries";
    pub const BEST_RANK: &str = "bestRank";
    pub const GLOBAL_RANKING: &str = "globalRanking";
    pub const STATE_RANKING: &str = "stateRanking";
    pub const COUNTRY_RANKING: &str = "countryRanking";

    pub const RECORD_WEIGHT: &str = "recordWeight";
    pub const LIFETIME_POPULARITY: &str = "LifetimePopularity";
    pub const YEAR_POPULARITY: &str = "YearPopularity";

    pub const SITE_RECORD: &str = "Site Record";
    pub const TOTAL_ENTRIES: &str = "Total Entries";
    pub const POPULARITY_BY_YEAR: &str = "Popularity by Year";
    pub const MAX_WEIGHT_BY_YEAR: &str = "Max Weight by Year";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Pumpkins,
    Growers,
    Contests,
    Sites,
    Stats,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Pumpkins,
        Collection::Growers,
        Collection::Contests,
        Collection::Sites,
        Collection::Stats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Pumpkins => "pumpkins",
            Collection::Growers => "growers",
            Collection::Contests => "contests",
            Collection::Sites => "sites",
            Collection::Stats => "stats",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRecordId {
    #[error("record id is empty")]
    Empty,
    #[error("record id must be a string, got {0}")]
    NotAString(&'static str),
}

/// Validated, non-empty document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn parse(raw: &str) -> Result<Self, InvalidRecordId> {
        if raw.trim().is_empty() {
            return Err(InvalidRecordId::Empty);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn from_json(raw: &Value) -> Result<Self, InvalidRecordId> {
        match raw {
            Value::String(s) => Self::parse(s),
            Value::Null => Err(InvalidRecordId::NotAString("null")),
            Value::Bool(_) => Err(InvalidRecordId::NotAString("bool")),
            Value::Number(_) => Err(InvalidRecordId::NotAString("number")),
            Value::Array(_) => Err(InvalidRecordId::NotAString("array")),
            Value::Object(_) => Err(InvalidRecordId::NotAString("object")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw stored document: an id plus its JSON field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Typed view over a stored document.
pub trait Record: DeserializeOwned {
    const COLLECTION: Collection;

    fn set_id(&mut self, id: String);

    fn from_document(doc: &Document) -> Result<Self, serde_json::Error> {
        let mut record: Self = serde_json::from_value(Value::Object(doc.fields.clone()))?;
        record.set_id(doc.id.clone());
        Ok(record)
    }
}

/// Rank fields computed for a pumpkin. `None` means the record holds no rank in that scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpkinRanks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_global_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_global_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_state_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yearly_state_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_country_rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yearly_country_rank: Option<u32>,
}

impl PumpkinRanks {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pumpkin {
    #[serde(skip)]
    pub id: String,
    pub weight: f64,
    #[serde(default)]
    pub place: String,
    pub year: i32,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub grower: String,
    #[serde(default)]
    pub contest: String,
    #[serde(default)]
    pub contest_name: String,
    #[serde(flatten)]
    pub ranks: PumpkinRanks,
}

impl Pumpkin {
    pub fn is_disqualified(&self) -> bool {
        self.place.trim() == DISQUALIFIED_PLACE
    }
}

impl Record for Pumpkin {
    const COLLECTION: Collection = Collection::Pumpkins;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grower {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(rename = "LifetimeMaxWeight", default)]
    pub lifetime_max_weight: Option<f64>,
    #[serde(rename = "NumberOfEntries", default)]
    pub number_of_entries: Option<u64>,
    #[serde(rename = "bestRank", default)]
    pub best_rank: Option<u32>,
    #[serde(rename = "globalRanking", default)]
    pub global_ranking: Option<String>,
    #[serde(rename = "stateRanking", default)]
    pub state_ranking: Option<String>,
    #[serde(rename = "countryRanking", default)]
    pub country_ranking: Option<String>,
}

impl Record for Grower {
    const COLLECTION: Collection = Collection::Growers;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contest {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(rename = "recordWeight", default)]
    pub record_weight: Option<f64>,
    #[serde(rename = "LifetimePopularity", default)]
    pub lifetime_popularity: Option<u64>,
    #[serde(rename = "YearPopularity", default)]
    pub year_popularity: Option<u64>,
}

impl Record for Contest {
    const COLLECTION: Collection = Collection::Contests;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Derived per-site document, keyed by the sanitized site name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Site {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "Site Record", default)]
    pub site_record: Option<f64>,
    #[serde(rename = "Total Entries", default)]
    pub total_entries: u64,
    #[serde(rename = "Popularity by Year", default)]
    pub popularity_by_year: BTreeMap<i32, u64>,
    #[serde(rename = "Max Weight by Year", default)]
    pub max_weight_by_year: BTreeMap<i32, f64>,
}

impl Record for Site {
    const COLLECTION: Collection = Collection::Sites;

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Strip path-separator-like characters so a site name can key a document.
pub fn sanitize_site_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    Users,
    Pumpkins,
    Measurements,
}

impl CounterKind {
    pub const ALL: [CounterKind; 3] = [
        CounterKind::Users,
        CounterKind::Pumpkins,
        CounterKind::Measurements,
    ];

    /// Id of the singleton counter document in the `stats` collection.
    pub fn document_id(&self) -> &'static str {
        match self {
            CounterKind::Users => "userStats",
            CounterKind::Pumpkins => "pumpkinStats",
            CounterKind::Measurements => "measurementStats",
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            CounterKind::Users => "userCount",
            CounterKind::Pumpkins => "pumpkinCount",
            CounterKind::Measurements => "measurementCount",
        }
    }
}

impl FromStr for CounterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "users" | "user" => Ok(CounterKind::Users),
            "pumpkins" | "pumpkin" => Ok(CounterKind::Pumpkins),
            "measurements" | "measurement" => Ok(CounterKind::Measurements),
            other => Err(format!("unknown counter `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterAction {
    Created,
    Deleted,
}

impl CounterAction {
    pub fn delta(&self) -> i64 {
        match self {
            CounterAction::Created => 1,
            CounterAction::Deleted => -1,
        }
    }
}

impl FromStr for CounterAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "create" => Ok(CounterAction::Created),
            "deleted" | "delete" => Ok(CounterAction::Deleted),
            other => Err(format!("unknown counter action `{other}`")),
        }
    }
}
