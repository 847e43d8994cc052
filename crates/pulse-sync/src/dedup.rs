//! Multi-layer deduplication: URL, hash and fuzzy-content cascades.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use pulse_core::{normalize_text, CanonicalEvent, DedupHistoryEntry, Source};
use serde::Serialize;
use strsim::levenshtein;
use url::Url;

/// Canonicalizes a link for duplicate detection: scheme, `www.`, query
/// string, fragment and trailing slash are all ignored.
pub fn normalize_link(link: &str) -> String {
    match Url::parse(link.trim()) {
        Ok(parsed) => {
            let host = parsed
                .host_str()
                .unwrap_or_default()
                .trim_start_matches("www.")
                .to_ascii_lowercase();
            let path = parsed.path().trim_end_matches('/');
            format!("{host}{path}")
        }
        Err(_) => link.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}

/// Normalized edit ratio in [0, 1]: `1 - lev(a, b) / (|a| + |b|)`.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let len_a = a.chars().count();
    let len_b = b.chars().count();
    if len_a == 0 && len_b == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / (len_a + len_b) as f64
}

fn join_parts(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{head} {tail}"),
    }
}

/// Token-set sequence similarity: sorts tokens, splits out the shared
/// subset and scores the best of the three pairwise sequence ratios. Keeps
/// venue abbreviations ("LA Forum" vs "Los Angeles Forum") above threshold
/// without inflating unrelated strings.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return if tokens_a == tokens_b { 1.0 } else { 0.0 };
    }

    let shared = tokens_a
        .intersection(&tokens_b)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let rest_a = tokens_a
        .difference(&tokens_b)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    let rest_b = tokens_b
        .difference(&tokens_a)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    let with_a = join_parts(&shared, &rest_a);
    let with_b = join_parts(&shared, &rest_b);

    [
        sequence_ratio(&shared, &with_a),
        sequence_ratio(&shared, &with_b),
        sequence_ratio(&with_a, &with_b),
    ]
    .into_iter()
    .fold(0.0, f64::max)
}

/// In-memory view of the persisted dedup history, indexed by hash and by
/// normalized link.
#[derive(Debug, Clone, Default)]
pub struct DedupHistory {
    by_hash: HashMap<String, DedupHistoryEntry>,
    link_to_hash: HashMap<String, String>,
}

impl DedupHistory {
    pub fn from_entries(entries: Vec<DedupHistoryEntry>) -> Self {
        let mut history = Self::default();
        for entry in entries {
            history
                .link_to_hash
                .insert(normalize_link(&entry.link), entry.event_hash.clone());
            history.by_hash.insert(entry.event_hash.clone(), entry);
        }
        history
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn entry(&self, hash: &str) -> Option<&DedupHistoryEntry> {
        self.by_hash.get(hash)
    }

    pub fn entry_for_link(&self, normalized_link: &str) -> Option<&DedupHistoryEntry> {
        self.link_to_hash
            .get(normalized_link)
            .and_then(|hash| self.by_hash.get(hash))
    }

    /// Bumps `last_seen` on a repeat sighting. Returns whether the hash was
    /// known.
    pub fn touch(&mut self, hash: &str, seen_at: DateTime<Utc>) -> bool {
        match self.by_hash.get_mut(hash) {
            Some(entry) => {
                entry.last_seen = seen_at;
                true
            }
            None => false,
        }
    }

    /// Inserts a newly synced event, or bumps it if already present.
    pub fn record(&mut self, event: &CanonicalEvent, seen_at: DateTime<Utc>) {
        if self.touch(&event.event_hash, seen_at) {
            return;
        }
        self.link_to_hash
            .insert(normalize_link(&event.link), event.event_hash.clone());
        self.by_hash.insert(
            event.event_hash.clone(),
            DedupHistoryEntry {
                event_hash: event.event_hash.clone(),
                link: event.link.clone(),
                first_seen: seen_at,
                last_seen: seen_at,
            },
        );
    }

    /// Drops entries not sighted since the cutoff. Returns the number
    /// removed.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.by_hash.len();
        self.by_hash.retain(|_, entry| entry.last_seen >= cutoff);
        self.link_to_hash
            .retain(|_, hash| self.by_hash.contains_key(hash));
        before - self.by_hash.len()
    }

    /// Stable (hash-sorted) entry list for persistence.
    pub fn into_entries(self) -> Vec<DedupHistoryEntry> {
        let mut entries: Vec<_> = self.by_hash.into_values().collect();
        entries.sort_by(|a, b| a.event_hash.cmp(&b.event_hash));
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum DropReason {
    DuplicateLink {
        matched_link: String,
    },
    DuplicateHash {
        event_hash: String,
    },
    FuzzyContent {
        kept_link: String,
        title_score: f64,
        location_score: f64,
    },
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub title_threshold: f64,
    pub location_threshold: f64,
    pub source_priority: Vec<Source>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_threshold: 0.85,
            location_threshold: 0.70,
            source_priority: Source::default_priority(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub kept: Vec<CanonicalEvent>,
    pub dropped: Vec<(CanonicalEvent, DropReason)>,
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    fn rank(&self, source: Source) -> usize {
        self.config
            .source_priority
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.config.source_priority.len())
    }

    /// Tie-break between two fuzzy duplicates: completeness first, then
    /// source priority, then lexicographically smaller link.
    fn candidate_wins(&self, incumbent: &CanonicalEvent, candidate: &CanonicalEvent) -> bool {
        let incumbent_score = incumbent.completeness_score();
        let candidate_score = candidate.completeness_score();
        if candidate_score != incumbent_score {
            return candidate_score > incumbent_score;
        }
        let incumbent_rank = self.rank(incumbent.source);
        let candidate_rank = self.rank(candidate.source);
        if candidate_rank != incumbent_rank {
            return candidate_rank < incumbent_rank;
        }
        candidate.link < incumbent.link
    }

    fn fuzzy_match(&self, a: &CanonicalEvent, b: &CanonicalEvent) -> Option<(f64, f64)> {
        if a.date != b.date {
            return None;
        }
        let location_score =
            token_set_ratio(&normalize_text(&a.location), &normalize_text(&b.location));
        if location_score < self.config.location_threshold {
            return None;
        }
        let title_score = token_set_ratio(&normalize_text(&a.title), &normalize_text(&b.title));
        if title_score < self.config.title_threshold {
            return None;
        }
        Some((title_score, location_score))
    }

    /// Applies the three layers in order of increasing cost. Comparison
    /// order follows batch order, so output is deterministic for a fixed
    /// input ordering. Hash and link sightings bump `last_seen` in the
    /// history but never add entries; only the sync manager does that.
    pub fn deduplicate(
        &self,
        batch: Vec<CanonicalEvent>,
        history: &mut DedupHistory,
    ) -> DedupOutcome {
        let now = Utc::now();
        let mut kept: Vec<CanonicalEvent> = Vec::new();
        let mut dropped: Vec<(CanonicalEvent, DropReason)> = Vec::new();
        // every processed record counts as "seen", dropped ones included
        let mut seen_links: HashMap<String, String> = HashMap::new();
        let mut seen_hashes: HashMap<String, String> = HashMap::new();

        for event in batch {
            let link_key = normalize_link(&event.link);

            // layer 1: URL
            if let Some(prior_link) = seen_links.get(&link_key) {
                let reason = DropReason::DuplicateLink {
                    matched_link: prior_link.clone(),
                };
                dropped.push((event, reason));
                continue;
            }
            if let Some((hash, matched_link)) = history
                .entry_for_link(&link_key)
                .map(|e| (e.event_hash.clone(), e.link.clone()))
            {
                history.touch(&hash, now);
                seen_links.insert(link_key, event.link.clone());
                dropped.push((event, DropReason::DuplicateLink { matched_link }));
                continue;
            }
            seen_links.insert(link_key, event.link.clone());

            // layer 2: hash
            if seen_hashes.contains_key(&event.event_hash) || history.contains_hash(&event.event_hash)
            {
                history.touch(&event.event_hash, now);
                let reason = DropReason::DuplicateHash {
                    event_hash: event.event_hash.clone(),
                };
                dropped.push((event, reason));
                continue;
            }
            seen_hashes.insert(event.event_hash.clone(), event.link.clone());

            // layer 3: fuzzy content, only against records kept so far
            let matched = kept
                .iter()
                .enumerate()
                .find_map(|(idx, candidate)| {
                    self.fuzzy_match(candidate, &event).map(|scores| (idx, scores))
                });

            match matched {
                Some((idx, (title_score, location_score))) => {
                    if self.candidate_wins(&kept[idx], &event) {
                        let mut loser = std::mem::replace(&mut kept[idx], event);
                        let winner = &mut kept[idx];
                        winner.alternate_sources.append(&mut loser.alternate_sources);
                        if loser.source != winner.source
                            && !winner.alternate_sources.contains(&loser.source)
                        {
                            winner.alternate_sources.push(loser.source);
                        }
                        let reason = DropReason::FuzzyContent {
                            kept_link: winner.link.clone(),
                            title_score,
                            location_score,
                        };
                        dropped.push((loser, reason));
                    } else {
                        let winner = &mut kept[idx];
                        if event.source != winner.source
                            && !winner.alternate_sources.contains(&event.source)
                        {
                            winner.alternate_sources.push(event.source);
                        }
                        let reason = DropReason::FuzzyContent {
                            kept_link: winner.link.clone(),
                            title_score,
                            location_score,
                        };
                        dropped.push((event, reason));
                    }
                }
                None => kept.push(event),
            }
        }

        DedupOutcome { kept, dropped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pulse_core::{event_hash, Category, PriceTier, TIME_TBA};

    fn ev(source: Source, title: &str, location: &str, link: &str) -> CanonicalEvent {
        let date = NaiveDate::from_ymd_opt(2026, 2, 15).expect("date");
        CanonicalEvent {
            title: title.to_string(),
            date,
            time: TIME_TBA.to_string(),
            location: location.to_string(),
            link: link.to_string(),
            description: None,
            image_url: None,
            source,
            price_cents: None,
            price_tier: PriceTier::Free,
            category: Category::Untagged,
            event_hash: event_hash(title, date, location, source),
            alternate_sources: Vec::new(),
            scraped_at: Utc::now(),
        }
    }

    fn with_description(mut event: CanonicalEvent) -> CanonicalEvent {
        event.description = Some("full lineup and door times".to_string());
        event
    }

    #[test]
    fn link_normalization_ignores_scheme_www_query_and_slash() {
        assert_eq!(
            normalize_link("https://www.Example.com/e/1?aff=abc#top"),
            "example.com/e/1"
        );
        assert_eq!(normalize_link("http://example.com/e/1/"), "example.com/e/1");
        assert_eq!(normalize_link("not a url "), "not a url");
    }

    #[test]
    fn token_set_ratio_handles_abbreviated_venues() {
        let score = token_set_ratio("la forum", "los angeles forum");
        assert!(score >= 0.70, "score was {score}");
        assert!(score < 0.85, "score was {score}");

        let title = token_set_ratio("concert at la forum", "concert la forum");
        assert!(title >= 0.85, "title score was {title}");

        let unrelated = token_set_ratio("deep house cruise", "jazz brunch cruise");
        assert!(unrelated < 0.85, "unrelated score was {unrelated}");

        assert_eq!(token_set_ratio("", ""), 1.0);
        assert_eq!(token_set_ratio("something", ""), 0.0);
    }

    #[test]
    fn sequence_ratio_is_a_normalized_edit_ratio() {
        assert_eq!(sequence_ratio("abc", "abc"), 1.0);
        assert_eq!(sequence_ratio("", ""), 1.0);
        assert_eq!(sequence_ratio("abc", ""), 0.0);
        let score = sequence_ratio("forum", "forum la");
        assert!((score - (1.0 - 3.0 / 13.0)).abs() < 1e-9);
    }

    #[test]
    fn url_layer_drops_batch_and_history_matches() {
        let mut history = DedupHistory::default();
        let engine = DedupEngine::new(DedupConfig::default());

        let a = ev(Source::Eventbrite, "Concert", "Forum", "https://www.example.com/e/1?utm=x");
        let b = ev(Source::Eventbrite, "Concert night", "Forum", "http://example.com/e/1/");
        let outcome = engine.deduplicate(vec![a, b], &mut history);
        assert_eq!(outcome.kept.len(), 1);
        assert!(matches!(outcome.dropped[0].1, DropReason::DuplicateLink { .. }));

        // a synced sighting lands in history; the next run's re-scrape is
        // dropped by the URL layer before hashing
        let synced = ev(Source::Luma, "Rooftop", "Skyline", "https://lu.ma/rooftop");
        history.record(&synced, Utc::now());
        let rescrape = ev(Source::Luma, "Rooftop", "Skyline", "https://lu.ma/rooftop?ref=feed");
        let outcome = engine.deduplicate(vec![rescrape], &mut history);
        assert!(outcome.kept.is_empty());
        assert!(matches!(outcome.dropped[0].1, DropReason::DuplicateLink { .. }));
    }

    #[test]
    fn hash_layer_drops_and_bumps_last_seen() {
        let engine = DedupEngine::new(DedupConfig::default());
        let original = ev(Source::DiceFm, "Warehouse Rave", "Secret Warehouse", "https://dice.fm/event/a");
        let old = Utc::now() - chrono::Duration::days(10);
        let mut history = DedupHistory::from_entries(vec![DedupHistoryEntry {
            event_hash: original.event_hash.clone(),
            link: original.link.clone(),
            first_seen: old,
            last_seen: old,
        }]);

        // same identity listed under a brand-new link
        let relisted = ev(Source::DiceFm, "Warehouse Rave!", "Secret Warehouse", "https://dice.fm/event/b");
        assert_eq!(relisted.event_hash, original.event_hash);

        let outcome = engine.deduplicate(vec![relisted], &mut history);
        assert!(outcome.kept.is_empty());
        assert!(matches!(outcome.dropped[0].1, DropReason::DuplicateHash { .. }));
        let entry = history.entry(&original.event_hash).expect("entry");
        assert!(entry.last_seen > old);
        assert_eq!(entry.first_seen, old);
    }

    #[test]
    fn fuzzy_layer_merges_cross_source_variants() {
        let engine = DedupEngine::new(DedupConfig::default());
        let mut history = DedupHistory::default();

        let a = ev(Source::Eventbrite, "Concert at LA Forum", "LA Forum", "https://www.eventbrite.com/e/1");
        let b = with_description(ev(Source::Luma, "Concert - LA Forum", "Los Angeles Forum", "https://lu.ma/concert"));
        let c = ev(Source::Meetup, "Food Festival", "Hollywood Bowl", "https://www.meetup.com/x/events/9");

        let outcome = engine.deduplicate(vec![a, b, c], &mut history);
        assert_eq!(outcome.kept.len(), 2);
        assert_eq!(outcome.dropped.len(), 1);

        // b has the higher completeness score and replaces a in place
        let winner = &outcome.kept[0];
        assert_eq!(winner.source, Source::Luma);
        assert_eq!(winner.alternate_sources, vec![Source::Eventbrite]);
        assert_eq!(outcome.kept[1].title, "Food Festival");

        let (loser, reason) = &outcome.dropped[0];
        assert_eq!(loser.source, Source::Eventbrite);
        match reason {
            DropReason::FuzzyContent { title_score, location_score, .. } => {
                assert!(*title_score >= 0.85);
                assert!(*location_score >= 0.70);
            }
            other => panic!("unexpected reason: {other:?}"),
        }
    }

    #[test]
    fn fuzzy_layer_requires_title_similarity() {
        let engine = DedupEngine::new(DedupConfig::default());
        let mut history = DedupHistory::default();

        let a = ev(Source::Eventbrite, "Deep House Cruise", "Marina Dock 52", "https://www.eventbrite.com/e/1");
        let b = ev(Source::Luma, "Jazz Brunch Cruise", "Marina Dock 52", "https://lu.ma/jazz");
        let outcome = engine.deduplicate(vec![a, b], &mut history);
        assert_eq!(outcome.kept.len(), 2);
        assert!(outcome.dropped.is_empty());
    }

    #[test]
    fn fuzzy_layer_requires_the_same_date() {
        let engine = DedupEngine::new(DedupConfig::default());
        let mut history = DedupHistory::default();

        let a = ev(Source::Eventbrite, "Concert at LA Forum", "LA Forum", "https://www.eventbrite.com/e/1");
        let mut b = ev(Source::Luma, "Concert at LA Forum", "LA Forum", "https://lu.ma/concert");
        b.date = NaiveDate::from_ymd_opt(2026, 2, 16).expect("date");
        b.event_hash = event_hash(&b.title, b.date, &b.location, b.source);

        let outcome = engine.deduplicate(vec![a, b], &mut history);
        assert_eq!(outcome.kept.len(), 2);
    }

    #[test]
    fn equal_completeness_falls_back_to_source_priority_then_link() {
        let engine = DedupEngine::new(DedupConfig::default());
        let mut history = DedupHistory::default();

        // meetup arrives first but eventbrite outranks it
        let a = ev(Source::Meetup, "Concert at LA Forum", "LA Forum", "https://www.meetup.com/e/1");
        let b = ev(Source::Eventbrite, "Concert at LA Forum!", "LA Forum", "https://www.eventbrite.com/e/2");
        let outcome = engine.deduplicate(vec![a, b], &mut history);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].source, Source::Eventbrite);

        // same source, same completeness: smaller link wins; the titles
        // differ by a token so the pair reaches the fuzzy layer at all
        let mut history = DedupHistory::default();
        let a = ev(Source::PoshVip, "Neon Nights LA", "Exchange LA", "https://posh.vip/e/zz");
        let b = ev(Source::PoshVip, "Neon Nights", "Exchange LA", "https://posh.vip/e/aa");
        let outcome = engine.deduplicate(vec![a, b], &mut history);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].link, "https://posh.vip/e/aa");
    }

    #[test]
    fn prune_drops_stale_entries_and_their_links() {
        let now = Utc::now();
        let stale = now - chrono::Duration::days(45);
        let fresh = now - chrono::Duration::days(5);
        let mut history = DedupHistory::from_entries(vec![
            DedupHistoryEntry {
                event_hash: "aaaa".to_string(),
                link: "https://example.com/old".to_string(),
                first_seen: stale,
                last_seen: stale,
            },
            DedupHistoryEntry {
                event_hash: "bbbb".to_string(),
                link: "https://example.com/new".to_string(),
                first_seen: fresh,
                last_seen: fresh,
            },
        ]);

        let removed = history.prune_older_than(now - chrono::Duration::days(30));
        assert_eq!(removed, 1);
        assert_eq!(history.len(), 1);
        assert!(history.entry_for_link("example.com/old").is_none());
        assert!(history.entry_for_link("example.com/new").is_some());
    }
}
