//! Core domain model for the Pulse event ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "pulse-core";

/// Placeholder start time for events whose listing carries no time.
pub const TIME_TBA: &str = "TBA";

/// Event sources the pipeline knows how to scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Eventbrite,
    Meetup,
    Luma,
    DiceFm,
    RaCo,
    PoshVip,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Eventbrite,
        Source::Meetup,
        Source::Luma,
        Source::DiceFm,
        Source::RaCo,
        Source::PoshVip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Eventbrite => "eventbrite",
            Source::Meetup => "meetup",
            Source::Luma => "luma",
            Source::DiceFm => "dice_fm",
            Source::RaCo => "ra_co",
            Source::PoshVip => "posh_vip",
        }
    }

    /// Default tie-break order when two sources list the same event:
    /// earlier entries win.
    pub fn default_priority() -> Vec<Source> {
        vec![
            Source::Eventbrite,
            Source::Luma,
            Source::Meetup,
            Source::DiceFm,
            Source::RaCo,
            Source::PoshVip,
        ]
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eventbrite" => Ok(Source::Eventbrite),
            "meetup" => Ok(Source::Meetup),
            "luma" => Ok(Source::Luma),
            "dice_fm" => Ok(Source::DiceFm),
            "ra_co" => Ok(Source::RaCo),
            "posh_vip" => Ok(Source::PoshVip),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// Price band derived from `price_cents`. Lower bound inclusive, upper
/// bound exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceTier {
    Free,
    Under20,
    Under50,
    Under100,
    Paid,
}

impl PriceTier {
    pub fn from_cents(cents: u32) -> Self {
        match cents {
            0 => PriceTier::Free,
            1..=1999 => PriceTier::Under20,
            2000..=4999 => PriceTier::Under50,
            5000..=9999 => PriceTier::Under100,
            _ => PriceTier::Paid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTier::Free => "free",
            PriceTier::Under20 => "under_20",
            PriceTier::Under50 => "under_50",
            PriceTier::Under100 => "under_100",
            PriceTier::Paid => "paid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Nightlife,
    FoodDrink,
    Comedy,
    ArtsCulture,
    Tech,
    Wellness,
    Music,
    Untagged,
}

/// Ordered keyword table for category inference; first match wins, so the
/// narrow buckets come before the broad music bucket.
const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::Nightlife,
        &["rave", "club night", "afterparty", "after party", "warehouse party", "nightclub"],
    ),
    (
        Category::FoodDrink,
        &["food", "tasting", "brunch", "dinner", "wine", "beer", "cocktail"],
    ),
    (
        Category::Comedy,
        &["comedy", "stand-up", "standup", "improv", "open mic"],
    ),
    (
        Category::ArtsCulture,
        &["art ", "gallery", "museum", "theater", "theatre", "exhibit", "film screening"],
    ),
    (
        Category::Tech,
        &["hackathon", "tech talk", "startup", "developer", "networking"],
    ),
    (
        Category::Wellness,
        &["yoga", "meditation", "wellness", "run club", "hike"],
    ),
    (
        Category::Music,
        &["concert", "dj", "live music", "band", "festival", "tour", "gig", "techno", "house music"],
    ),
];

impl Category {
    /// Case-insensitive keyword scan over title + description.
    /// No match falls back to `Untagged`.
    pub fn infer(title: &str, description: Option<&str>) -> Self {
        let haystack = format!("{} {}", title, description.unwrap_or_default()).to_lowercase();
        for (category, keywords) in CATEGORY_KEYWORDS {
            if keywords.iter().any(|kw| haystack.contains(kw)) {
                return *category;
            }
        }
        Category::Untagged
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Nightlife => "nightlife",
            Category::FoodDrink => "food_drink",
            Category::Comedy => "comedy",
            Category::ArtsCulture => "arts_culture",
            Category::Tech => "tech",
            Category::Wellness => "wellness",
            Category::Music => "music",
            Category::Untagged => "untagged",
        }
    }
}

/// Well-known `RawRecord` field keys shared between adapters and the
/// normalizer.
pub mod fields {
    pub const TITLE: &str = "title";
    pub const DATE: &str = "date";
    pub const TIME: &str = "time";
    pub const LOCATION: &str = "location";
    pub const LINK: &str = "link";
    pub const DESCRIPTION: &str = "description";
    pub const IMAGE_URL: &str = "image_url";
    pub const PRICE_CENTS: &str = "price_cents";
}

/// Untyped scrape output, one per listed event. Discarded once normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: Source,
    pub locality: String,
    pub fields: BTreeMap<String, String>,
    pub scraped_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(source: Source, locality: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            source,
            locality: locality.into(),
            fields: BTreeMap::new(),
            scraped_at,
        }
    }

    /// Stores a field, ignoring empty values so presence checks stay simple.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.fields.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// The canonical, validated event record used by dedup, sync and the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub title: String,
    pub date: NaiveDate,
    pub time: String,
    pub location: String,
    pub link: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub source: Source,
    pub price_cents: Option<u32>,
    pub price_tier: PriceTier,
    pub category: Category,
    pub event_hash: String,
    /// Sources whose duplicate listing was dropped in favor of this record.
    #[serde(default)]
    pub alternate_sources: Vec<Source>,
    pub scraped_at: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Optional-field completeness used to break dedup ties: description is
    /// worth 2 points, image / price / non-TBA time 1 point each.
    pub fn completeness_score(&self) -> u32 {
        let mut score = 0;
        if self.description.as_deref().is_some_and(|d| !d.is_empty()) {
            score += 2;
        }
        if self.image_url.is_some() {
            score += 1;
        }
        if self.price_cents.is_some() {
            score += 1;
        }
        if self.time != TIME_TBA {
            score += 1;
        }
        score
    }
}

/// One persisted sighting of an event hash, carried across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupHistoryEntry {
    pub event_hash: String,
    pub link: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Lowercases, strips non-alphanumeric characters and collapses whitespace,
/// so minor punctuation/casing differences hash identically.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 128-bit dedup key: truncated SHA-256 over the normalized identity fields,
/// hex-encoded. A unit separator keeps field boundaries unambiguous.
pub fn event_hash(title: &str, date: NaiveDate, location: &str, source: Source) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(title));
    hasher.update([0x1f]);
    hasher.update(date.format("%Y-%m-%d").to_string());
    hasher.update([0x1f]);
    hasher.update(normalize_text(location));
    hasher.update([0x1f]);
    hasher.update(source.as_str());
    hex::encode(&hasher.finalize()[..16])
}
