//! Per-source listing adapters + the fallback-chain fetch driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use pulse_core::{fields, RawRecord, Source};
use pulse_storage::{classify_failure, looks_blocked, FailureClass, FetchStrategy};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "pulse-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One scraping target. Implementations build the listing URL for a
/// locality and turn a fetched page into raw records; fetching itself is
/// the chain driver's job.
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    fn listing_url(&self, locality: &str) -> String;

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

pub fn adapter_for(source: Source) -> Box<dyn SourceAdapter> {
    match source {
        Source::Eventbrite => Box::new(EventbriteAdapter),
        Source::Meetup => Box::new(MeetupAdapter),
        Source::Luma => Box::new(LumaAdapter),
        Source::DiceFm => Box::new(DiceFmAdapter),
        Source::RaCo => Box::new(RaCoAdapter),
        Source::PoshVip => Box::new(PoshVipAdapter),
    }
}

// ---- shared parse helpers ----

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: &ElementRef, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(element
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn element_attr(
    element: &ElementRef,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(element
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// "Free" ⇒ 0; otherwise the first number in the text, in cents.
pub fn parse_price_cents(text: &str) -> Option<u32> {
    let lower = text.to_lowercase();
    if lower.contains("free") {
        return Some(0);
    }
    let value = extract_numbers(text).into_iter().next()?;
    if value < 0.0 {
        return None;
    }
    Some((value * 100.0).round() as u32)
}

/// Splits an ISO-ish datetime into (date, hh:mm) halves.
fn split_date_time(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    match trimmed.split_once('T') {
        Some((date, rest)) => {
            let time = rest
                .get(0..5)
                .filter(|t| t.len() == 5 && t.as_bytes()[2] == b':')
                .map(str::to_string);
            (date.to_string(), time)
        }
        None => (trimmed.to_string(), None),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%m/%d/%Y"];

/// Parses human-readable listing dates ("Sat, Aug 15, 2026") into ISO form.
pub fn parse_listing_date(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let mut candidates = vec![trimmed.to_string()];
    if let Some((_, rest)) = trimmed.split_once(", ") {
        candidates.push(rest.trim().to_string());
    }
    for candidate in &candidates {
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                return Some(date.format("%Y-%m-%d").to_string());
            }
        }
    }
    None
}

fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(joined) => joined.to_string(),
        Err(_) => href.to_string(),
    }
}

// ---- JSON-LD extraction (Eventbrite, Dice) ----

fn is_event_type(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::String(s)) => s.ends_with("Event"),
        Some(JsonValue::Array(items)) => items
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s.ends_with("Event"))),
        _ => false,
    }
}

fn collect_ld_events(value: &JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_ld_events(item, out);
            }
        }
        JsonValue::Object(map) => {
            if is_event_type(map.get("@type")) {
                out.push(value.clone());
                return;
            }
            for key in ["@graph", "itemListElement", "item"] {
                if let Some(nested) = map.get(key) {
                    collect_ld_events(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn ld_json_events(doc: &Html) -> Result<Vec<JsonValue>, AdapterError> {
    let sel = parse_selector(r#"script[type="application/ld+json"]"#)?;
    let mut events = Vec::new();
    for script in doc.select(&sel) {
        let text = script.text().collect::<String>();
        // pages routinely carry malformed or unrelated ld+json blocks
        let Ok(value) = serde_json::from_str::<JsonValue>(&text) else {
            continue;
        };
        collect_ld_events(&value, &mut events);
    }
    Ok(events)
}

fn ld_image(event: &JsonValue) -> Option<String> {
    match event.get("image") {
        Some(JsonValue::String(s)) => text_or_none(s.clone()),
        Some(JsonValue::Array(items)) => items
            .iter()
            .find_map(|v| v.as_str())
            .and_then(|s| text_or_none(s.to_string())),
        Some(obj) => json_str(obj, &["url"]).and_then(|s| text_or_none(s.to_string())),
        None => None,
    }
}

fn ld_offer_price_cents(event: &JsonValue) -> Option<u32> {
    let offers = event.get("offers")?;
    let offer = match offers {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    let price = json_f64(offer, &["lowPrice"])
        .or_else(|| json_f64(offer, &["price"]))
        .or_else(|| json_str(offer, &["lowPrice"]).and_then(|s| s.parse().ok()))
        .or_else(|| json_str(offer, &["price"]).and_then(|s| s.parse().ok()))?;
    if price < 0.0 {
        return None;
    }
    Some((price * 100.0).round() as u32)
}

fn record_from_ld_event(
    event: &JsonValue,
    source: Source,
    locality: &str,
    scraped_at: DateTime<Utc>,
) -> Option<RawRecord> {
    let title = json_str(event, &["name"])?;
    let mut raw = RawRecord::new(source, locality, scraped_at);
    raw.set(fields::TITLE, title);
    if let Some(url) = json_str(event, &["url"]) {
        raw.set(fields::LINK, url);
    }
    if let Some(start) = json_str(event, &["startDate"]) {
        let (date, time) = split_date_time(start);
        raw.set(fields::DATE, date);
        if let Some(time) = time {
            raw.set(fields::TIME, time);
        }
    }
    let location = json_str(event, &["location", "name"])
        .or_else(|| json_str(event, &["location", "address", "addressLocality"]));
    if let Some(location) = location {
        raw.set(fields::LOCATION, location);
    }
    if let Some(description) = json_str(event, &["description"]) {
        raw.set(fields::DESCRIPTION, description);
    }
    if let Some(image) = ld_image(event) {
        raw.set(fields::IMAGE_URL, image);
    }
    if let Some(cents) = ld_offer_price_cents(event) {
        raw.set(fields::PRICE_CENTS, cents.to_string());
    }
    Some(raw)
}

// ---- __NEXT_DATA__ extraction (Meetup, RA) ----

fn next_data_value(doc: &Html) -> Result<Option<JsonValue>, AdapterError> {
    let sel = parse_selector("script#__NEXT_DATA__")?;
    let Some(script) = doc.select(&sel).next() else {
        return Ok(None);
    };
    let text = script.text().collect::<String>();
    Ok(serde_json::from_str(&text).ok())
}

fn collect_typename_objects<'a>(value: &'a JsonValue, typename: &str, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_typename_objects(item, typename, out);
            }
        }
        JsonValue::Object(map) => {
            if map.get("__typename").and_then(JsonValue::as_str) == Some(typename) {
                out.push(value);
                return;
            }
            for nested in map.values() {
                collect_typename_objects(nested, typename, out);
            }
        }
        _ => {}
    }
}

// ---- adapters ----

struct EventbriteAdapter;

impl SourceAdapter for EventbriteAdapter {
    fn source(&self) -> Source {
        Source::Eventbrite
    }

    fn listing_url(&self, locality: &str) -> String {
        format!("https://www.eventbrite.com/d/{locality}/events/")
    }

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let doc = Html::parse_document(html);
        let records = ld_json_events(&doc)?
            .iter()
            .filter_map(|event| record_from_ld_event(event, self.source(), locality, scraped_at))
            .collect();
        Ok(records)
    }
}

struct DiceFmAdapter;

impl SourceAdapter for DiceFmAdapter {
    fn source(&self) -> Source {
        Source::DiceFm
    }

    fn listing_url(&self, locality: &str) -> String {
        format!("https://dice.fm/browse/{locality}/music")
    }

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let doc = Html::parse_document(html);
        let records = ld_json_events(&doc)?
            .iter()
            .filter_map(|event| record_from_ld_event(event, self.source(), locality, scraped_at))
            .collect();
        Ok(records)
    }
}

struct MeetupAdapter;

impl SourceAdapter for MeetupAdapter {
    fn source(&self) -> Source {
        Source::Meetup
    }

    fn listing_url(&self, locality: &str) -> String {
        format!("https://www.meetup.com/find/?location={locality}&source=EVENTS")
    }

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let doc = Html::parse_document(html);
        let Some(data) = next_data_value(&doc)? else {
            return Ok(Vec::new());
        };

        let mut objects = Vec::new();
        collect_typename_objects(&data, "Event", &mut objects);

        let mut records = Vec::new();
        for event in objects {
            let Some(title) = json_str(event, &["title"]).or_else(|| json_str(event, &["name"]))
            else {
                continue;
            };
            let mut raw = RawRecord::new(self.source(), locality, scraped_at);
            raw.set(fields::TITLE, title);
            if let Some(url) = json_str(event, &["eventUrl"]) {
                raw.set(fields::LINK, url);
            }
            if let Some(start) = json_str(event, &["dateTime"]) {
                let (date, time) = split_date_time(start);
                raw.set(fields::DATE, date);
                if let Some(time) = time {
                    raw.set(fields::TIME, time);
                }
            }
            let venue = json_str(event, &["venue", "name"]);
            let city = json_str(event, &["venue", "city"]);
            match (venue, city) {
                (Some(venue), Some(city)) => raw.set(fields::LOCATION, format!("{venue}, {city}")),
                (Some(venue), None) => raw.set(fields::LOCATION, venue),
                _ => {}
            }
            if let Some(description) = json_str(event, &["description"]) {
                raw.set(fields::DESCRIPTION, description);
            }
            if let Some(image) = json_str(event, &["imageUrl"]) {
                raw.set(fields::IMAGE_URL, image);
            }
            if let Some(amount) = json_f64(event, &["feeSettings", "amount"]) {
                if amount >= 0.0 {
                    raw.set(fields::PRICE_CENTS, ((amount * 100.0).round() as u32).to_string());
                }
            }
            records.push(raw);
        }
        Ok(records)
    }
}

struct RaCoAdapter;

impl SourceAdapter for RaCoAdapter {
    fn source(&self) -> Source {
        Source::RaCo
    }

    fn listing_url(&self, locality: &str) -> String {
        format!("https://ra.co/events/{locality}")
    }

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let doc = Html::parse_document(html);
        let Some(data) = next_data_value(&doc)? else {
            return Ok(Vec::new());
        };

        let mut objects = Vec::new();
        collect_typename_objects(&data, "Event", &mut objects);

        let mut records = Vec::new();
        for event in objects {
            let Some(title) = json_str(event, &["title"]) else {
                continue;
            };
            let mut raw = RawRecord::new(self.source(), locality, scraped_at);
            raw.set(fields::TITLE, title);
            if let Some(path) = json_str(event, &["contentUrl"]) {
                raw.set(fields::LINK, absolutize("https://ra.co", path));
            }
            // startTime carries the real hour; date is often midnight-padded
            if let Some(start) = json_str(event, &["startTime"]) {
                let (date, time) = split_date_time(start);
                raw.set(fields::DATE, date);
                if let Some(time) = time {
                    raw.set(fields::TIME, time);
                }
            } else if let Some(date) = json_str(event, &["date"]) {
                let (date, _) = split_date_time(date);
                raw.set(fields::DATE, date);
            }
            if let Some(venue) = json_str(event, &["venue", "name"]) {
                raw.set(fields::LOCATION, venue);
            }
            if let Some(flyer) = json_str(event, &["flyerFront"]) {
                raw.set(fields::IMAGE_URL, flyer);
            }
            records.push(raw);
        }
        Ok(records)
    }
}

struct LumaAdapter;

impl SourceAdapter for LumaAdapter {
    fn source(&self) -> Source {
        Source::Luma
    }

    fn listing_url(&self, locality: &str) -> String {
        format!("https://lu.ma/{locality}")
    }

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let doc = Html::parse_document(html);
        let card_sel = parse_selector("div.timeline-event")?;

        let mut records = Vec::new();
        for card in doc.select(&card_sel) {
            let Some(title) = element_text(&card, "h3.event-title")? else {
                continue;
            };
            let mut raw = RawRecord::new(self.source(), locality, scraped_at);
            raw.set(fields::TITLE, title);
            if let Some(href) = element_attr(&card, "a.event-link", "href")? {
                raw.set(fields::LINK, absolutize("https://lu.ma", &href));
            }
            if let Some(datetime) = element_attr(&card, "time.event-time", "datetime")? {
                let (date, time) = split_date_time(&datetime);
                raw.set(fields::DATE, date);
                if let Some(time) = time {
                    raw.set(fields::TIME, time);
                }
            } else if let Some(text) = element_text(&card, "time.event-time")? {
                if let Some(date) = parse_listing_date(&text) {
                    raw.set(fields::DATE, date);
                }
            }
            if let Some(venue) = element_text(&card, "div.venue-name")? {
                raw.set(fields::LOCATION, venue);
            }
            if let Some(image) = element_attr(&card, "img", "src")? {
                raw.set(fields::IMAGE_URL, image);
            }
            if let Some(price_text) = element_text(&card, "div.price-badge")? {
                if let Some(cents) = parse_price_cents(&price_text) {
                    raw.set(fields::PRICE_CENTS, cents.to_string());
                }
            }
            records.push(raw);
        }
        Ok(records)
    }
}

struct PoshVipAdapter;

impl SourceAdapter for PoshVipAdapter {
    fn source(&self) -> Source {
        Source::PoshVip
    }

    fn listing_url(&self, locality: &str) -> String {
        format!("https://posh.vip/explore?location={locality}")
    }

    fn parse_listing(
        &self,
        html: &str,
        locality: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let doc = Html::parse_document(html);
        let card_sel = parse_selector("div.event-card")?;

        let mut records = Vec::new();
        for card in doc.select(&card_sel) {
            let Some(title) = element_text(&card, ".event-card__title")? else {
                continue;
            };
            let mut raw = RawRecord::new(self.source(), locality, scraped_at);
            raw.set(fields::TITLE, title);
            if let Some(href) = element_attr(&card, "a", "href")? {
                raw.set(fields::LINK, absolutize("https://posh.vip", &href));
            }
            if let Some(datetime) = element_attr(&card, "time", "datetime")? {
                let (date, time) = split_date_time(&datetime);
                raw.set(fields::DATE, date);
                if let Some(time) = time {
                    raw.set(fields::TIME, time);
                }
            } else if let Some(text) = element_text(&card, ".event-card__date")? {
                if let Some(date) = parse_listing_date(&text) {
                    raw.set(fields::DATE, date);
                }
            }
            if let Some(venue) = element_text(&card, ".event-card__venue")? {
                raw.set(fields::LOCATION, venue);
            }
            if let Some(image) = element_attr(&card, "img", "src")? {
                raw.set(fields::IMAGE_URL, image);
            }
            if let Some(price_text) = element_text(&card, ".event-card__price")? {
                if let Some(cents) = parse_price_cents(&price_text) {
                    raw.set(fields::PRICE_CENTS, cents.to_string());
                }
            }
            records.push(raw);
        }
        Ok(records)
    }
}

// ---- fallback-chain driver ----

#[derive(Debug, Clone, Serialize)]
pub struct FetchAttempt {
    pub strategy: String,
    pub failure: FailureClass,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Fetched { strategy: String, records: usize },
    Failed,
}

/// Outcome of one (source, locality) fetch task, failure or not.
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub source: Source,
    pub locality: String,
    pub status: FetchStatus,
    pub attempts: Vec<FetchAttempt>,
    pub elapsed_ms: u64,
}

impl FetchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, FetchStatus::Fetched { .. })
    }
}

/// Walks the strategy list in strict order until one attempt yields a
/// non-blocked, non-empty page that parses into at least one record.
/// Failures never escape: an exhausted chain returns an empty record list
/// with `FetchStatus::Failed`, and the run carries on with other tasks.
pub async fn fetch_source_records(
    adapter: &dyn SourceAdapter,
    strategies: &[Arc<dyn FetchStrategy>],
    locality: &str,
    attempt_timeout: Duration,
) -> (Vec<RawRecord>, FetchOutcome) {
    let started = Instant::now();
    let source = adapter.source();
    let url = adapter.listing_url(locality);
    let mut attempts = Vec::new();

    for strategy in strategies {
        let outcome = tokio::time::timeout(attempt_timeout, strategy.attempt(source.as_str(), &url)).await;
        let failure = match outcome {
            Err(_) => FailureClass::Timeout,
            Ok(Err(err)) => classify_failure(&err),
            Ok(Ok(html)) => {
                if html.trim().is_empty() {
                    FailureClass::Empty
                } else if looks_blocked(&html) {
                    FailureClass::Blocked
                } else {
                    match adapter.parse_listing(&html, locality, Utc::now()) {
                        Ok(records) if !records.is_empty() => {
                            let count = records.len();
                            return (
                                records,
                                FetchOutcome {
                                    source,
                                    locality: locality.to_string(),
                                    status: FetchStatus::Fetched {
                                        strategy: strategy.name().to_string(),
                                        records: count,
                                    },
                                    attempts,
                                    elapsed_ms: started.elapsed().as_millis() as u64,
                                },
                            );
                        }
                        Ok(_) => FailureClass::ParseEmpty,
                        Err(err) => {
                            warn!(source = %source, locality, strategy = strategy.name(), error = %err, "listing parse failed");
                            FailureClass::ParseEmpty
                        }
                    }
                }
            }
        };
        warn!(source = %source, locality, strategy = strategy.name(), failure = ?failure, "fetch attempt failed");
        attempts.push(FetchAttempt {
            strategy: strategy.name().to_string(),
            failure,
        });
    }

    (
        Vec::new(),
        FetchOutcome {
            source,
            locality: locality.to_string(),
            status: FetchStatus::Failed,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        },
    )
}
