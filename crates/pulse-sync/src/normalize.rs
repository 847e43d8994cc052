//! RawRecord validation and normalization into canonical events.

use chrono::{DateTime, NaiveDate};
use pulse_core::{
    event_hash, fields, CanonicalEvent, Category, PriceTier, RawRecord, TIME_TBA,
};
use thiserror::Error;
use url::Url;

pub const MAX_DESCRIPTION_CHARS: usize = 1000;
const MIN_TITLE_CHARS: usize = 3;

/// Record-scoped failure; the batch continues without the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("bad format for {field}: {detail}")]
    BadFormat { field: &'static str, detail: String },
}

/// Strips zero-width and control characters, then collapses runs of
/// whitespace into single spaces.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !c.is_control()
                && !matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

fn required<'a>(raw: &'a RawRecord, key: &'static str) -> Result<&'a str, ValidationError> {
    raw.get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(key))
}

fn parse_iso_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Ok(datetime.date_naive());
    }
    if let Ok(datetime) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(datetime.date());
    }
    Err(ValidationError::BadFormat {
        field: fields::DATE,
        detail: format!("not an ISO calendar date: {raw:?}"),
    })
}

fn validate_link(raw: &str) -> Result<String, ValidationError> {
    let parsed = Url::parse(raw).map_err(|e| ValidationError::BadFormat {
        field: fields::LINK,
        detail: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::BadFormat {
            field: fields::LINK,
            detail: format!("unsupported scheme: {}", parsed.scheme()),
        });
    }
    Ok(raw.to_string())
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    pub max_description_chars: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            max_description_chars: MAX_DESCRIPTION_CHARS,
        }
    }
}

impl Normalizer {
    /// Validates, sanitizes and derives: required fields, ISO date, URL
    /// link, text cleanup, price tier, category and the dedup hash.
    /// The record's `source` is carried by type and never missing.
    pub fn normalize(&self, raw: &RawRecord) -> Result<CanonicalEvent, ValidationError> {
        let title_raw = required(raw, fields::TITLE)?;
        let date_raw = required(raw, fields::DATE)?;
        let location_raw = required(raw, fields::LOCATION)?;
        let link_raw = required(raw, fields::LINK)?;

        let date = parse_iso_date(date_raw)?;
        let link = validate_link(link_raw)?;

        let title = sanitize_text(title_raw);
        if title.chars().count() < MIN_TITLE_CHARS {
            return Err(ValidationError::BadFormat {
                field: fields::TITLE,
                detail: format!("shorter than {MIN_TITLE_CHARS} characters after sanitization"),
            });
        }
        let location = sanitize_text(location_raw);
        if location.is_empty() {
            return Err(ValidationError::MissingField(fields::LOCATION));
        }

        let time = raw
            .get(fields::TIME)
            .map(sanitize_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| TIME_TBA.to_string());

        let description = raw
            .get(fields::DESCRIPTION)
            .map(sanitize_text)
            .filter(|d| !d.is_empty())
            .map(|d| truncate_chars(&d, self.max_description_chars));

        let image_url = raw
            .get(fields::IMAGE_URL)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let price_cents = raw
            .get(fields::PRICE_CENTS)
            .and_then(|v| v.trim().parse::<u32>().ok());

        // tier and category always land on a default, never null
        let price_tier = price_cents.map(PriceTier::from_cents).unwrap_or(PriceTier::Free);
        let category = Category::infer(&title, description.as_deref());
        let event_hash = event_hash(&title, date, &location, raw.source);

        Ok(CanonicalEvent {
            title,
            date,
            time,
            location,
            link,
            description,
            image_url,
            source: raw.source,
            price_cents,
            price_tier,
            category,
            event_hash,
            alternate_sources: Vec::new(),
            scraped_at: raw.scraped_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::Source;

    fn raw_event() -> RawRecord {
        let mut raw = RawRecord::new(Source::Eventbrite, "los-angeles", Utc::now());
        raw.set(fields::TITLE, "Concert at LA Forum");
        raw.set(fields::DATE, "2026-02-15");
        raw.set(fields::LOCATION, "LA Forum");
        raw.set(fields::LINK, "https://www.eventbrite.com/e/concert-123");
        raw
    }

    #[test]
    fn normalizes_a_minimal_record() {
        let event = Normalizer::default().normalize(&raw_event()).expect("normalize");
        assert_eq!(event.title, "Concert at LA Forum");
        assert_eq!(event.time, TIME_TBA);
        assert_eq!(event.price_tier, PriceTier::Free);
        assert_eq!(event.category, Category::Music);
        assert_eq!(event.event_hash.len(), 32);
        assert!(event.price_cents.is_none());
    }

    #[test]
    fn missing_required_fields_are_rejected_with_the_field_name() {
        for field in [fields::TITLE, fields::DATE, fields::LOCATION, fields::LINK] {
            let mut raw = raw_event();
            raw.fields.remove(field);
            assert_eq!(
                Normalizer::default().normalize(&raw),
                Err(ValidationError::MissingField(field))
            );
        }
    }

    #[test]
    fn whitespace_only_fields_count_as_missing() {
        let mut raw = raw_event();
        raw.fields.insert(fields::LOCATION.to_string(), "   ".to_string());
        assert_eq!(
            Normalizer::default().normalize(&raw),
            Err(ValidationError::MissingField(fields::LOCATION))
        );
    }

    #[test]
    fn malformed_date_and_link_are_bad_format() {
        let mut raw = raw_event();
        raw.fields.insert(fields::DATE.to_string(), "Feb 15th".to_string());
        assert!(matches!(
            Normalizer::default().normalize(&raw),
            Err(ValidationError::BadFormat { field: "date", .. })
        ));

        let mut raw = raw_event();
        raw.fields.insert(fields::LINK.to_string(), "not a url".to_string());
        assert!(matches!(
            Normalizer::default().normalize(&raw),
            Err(ValidationError::BadFormat { field: "link", .. })
        ));

        let mut raw = raw_event();
        raw.fields
            .insert(fields::LINK.to_string(), "ftp://example.com/events".to_string());
        assert!(matches!(
            Normalizer::default().normalize(&raw),
            Err(ValidationError::BadFormat { field: "link", .. })
        ));
    }

    #[test]
    fn accepts_datetime_forms_for_the_date_field() {
        let mut raw = raw_event();
        raw.fields
            .insert(fields::DATE.to_string(), "2026-02-15T20:00:00-08:00".to_string());
        let event = Normalizer::default().normalize(&raw).expect("rfc3339");
        assert_eq!(event.date.to_string(), "2026-02-15");

        raw.fields
            .insert(fields::DATE.to_string(), "2026-02-15T20:00:00".to_string());
        let event = Normalizer::default().normalize(&raw).expect("naive datetime");
        assert_eq!(event.date.to_string(), "2026-02-15");
    }

    #[test]
    fn sanitization_strips_zero_width_and_control_characters() {
        let mut raw = raw_event();
        raw.fields.insert(
            fields::TITLE.to_string(),
            "Ware\u{200B}house\u{0007}   Rave\u{FEFF}".to_string(),
        );
        let event = Normalizer::default().normalize(&raw).expect("normalize");
        assert_eq!(event.title, "Warehouse Rave");
    }

    #[test]
    fn short_titles_are_rejected_after_sanitization() {
        let mut raw = raw_event();
        raw.fields.insert(fields::TITLE.to_string(), "X\u{200B}Y".to_string());
        assert!(matches!(
            Normalizer::default().normalize(&raw),
            Err(ValidationError::BadFormat { field: "title", .. })
        ));
    }

    #[test]
    fn long_descriptions_are_truncated_with_an_ellipsis() {
        let mut raw = raw_event();
        raw.set(fields::DESCRIPTION, "x".repeat(1200));
        let event = Normalizer::default().normalize(&raw).expect("normalize");
        let description = event.description.expect("description");
        assert_eq!(description.chars().count(), MAX_DESCRIPTION_CHARS + 1);
        assert!(description.ends_with('…'));
    }

    #[test]
    fn price_feeds_tier_and_completeness() {
        let mut raw = raw_event();
        raw.set(fields::PRICE_CENTS, "4999");
        let event = Normalizer::default().normalize(&raw).expect("normalize");
        assert_eq!(event.price_cents, Some(4999));
        assert_eq!(event.price_tier, PriceTier::Under50);

        let mut raw = raw_event();
        raw.set(fields::PRICE_CENTS, "not-a-number");
        let event = Normalizer::default().normalize(&raw).expect("normalize");
        assert_eq!(event.price_cents, None);
        assert_eq!(event.price_tier, PriceTier::Free);
    }

    #[test]
    fn hash_ignores_punctuation_differences_between_records() {
        let a = Normalizer::default().normalize(&raw_event()).expect("a");

        let mut raw = raw_event();
        raw.fields
            .insert(fields::TITLE.to_string(), "concert, at LA FORUM!".to_string());
        raw.fields
            .insert(fields::LINK.to_string(), "https://www.eventbrite.com/e/other".to_string());
        let b = Normalizer::default().normalize(&raw).expect("b");

        assert_eq!(a.event_hash, b.event_hash);
    }
}
