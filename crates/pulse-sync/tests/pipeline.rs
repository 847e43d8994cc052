//! End-to-end pipeline behavior over the in-memory store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use pulse_core::{event_hash, fields, RawRecord, Source};
use pulse_storage::JsonStateStore;
use pulse_sync::store::MemoryEventStore;
use pulse_sync::{SourceRegistry, SyncConfig, SyncDecision, SyncMode, SyncPipeline};
use tempfile::TempDir;

fn test_config(dir: &Path, sync_mode: SyncMode, force_sync: bool) -> SyncConfig {
    SyncConfig {
        database_url: None,
        state_path: dir.join("state").join("pulse_state.json"),
        sources_path: dir.join("sources.yaml"),
        reports_dir: dir.join("reports"),
        sync_mode,
        batch_size: 100,
        max_concurrency: 2,
        fetch_timeout: Duration::from_secs(5),
        run_deadline: Duration::from_secs(30),
        retention_days: 30,
        title_threshold: 0.85,
        location_threshold: 0.70,
        user_agent: "pulse-bot/test".to_string(),
        requests_per_second: None,
        render_providers: Vec::new(),
        sync_cron: "0 0 */6 * * *".to_string(),
        force_sync,
    }
}

fn pipeline(
    dir: &Path,
    store: Arc<MemoryEventStore>,
    sync_mode: SyncMode,
    force_sync: bool,
) -> SyncPipeline {
    let config = test_config(dir, sync_mode, force_sync);
    let state_store = Arc::new(JsonStateStore::new(config.state_path.clone()));
    SyncPipeline::new(config, SourceRegistry::default(), state_store, store).expect("pipeline")
}

fn raw(source: Source, title: &str, date: &str, location: &str, link: &str) -> RawRecord {
    let mut record = RawRecord::new(source, "los-angeles", Utc::now());
    record.set(fields::TITLE, title);
    record.set(fields::DATE, date);
    record.set(fields::LOCATION, location);
    record.set(fields::LINK, link);
    record
}

#[tokio::test]
async fn end_to_end_scenario_keeps_the_more_complete_variant() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = pipeline(dir.path(), store.clone(), SyncMode::EveryRun, false);

    let mut a = raw(
        Source::Eventbrite,
        "Concert at LA Forum",
        "2026-02-15",
        "LA Forum",
        "https://www.eventbrite.com/e/concert-at-la-forum-123",
    );
    a.set(fields::PRICE_CENTS, "2500");

    let mut b = raw(
        Source::Luma,
        "Concert - LA Forum",
        "2026-02-15",
        "Los Angeles Forum",
        "https://lu.ma/concert-la-forum",
    );
    b.set(fields::DESCRIPTION, "Doors at 7, headliner at 9.");

    let c = raw(
        Source::Meetup,
        "Food Festival",
        "2026-02-15",
        "Hollywood Bowl",
        "https://www.meetup.com/la-food/events/9",
    );

    let summary = pipeline
        .process(vec![a, b, c], Vec::new(), 0)
        .await
        .expect("run");

    assert_eq!(summary.fetched_records, 3);
    assert_eq!(summary.validation_dropped, 0);
    assert_eq!(summary.fuzzy_dropped, 1);
    assert_eq!(summary.synced, 2);
    assert_eq!(store.len(), 2);

    let date = NaiveDate::from_ymd_opt(2026, 2, 15).expect("date");
    let kept_hash = event_hash("Concert - LA Forum", date, "Los Angeles Forum", Source::Luma);
    let kept = store.get(&kept_hash).expect("luma variant kept");
    assert_eq!(kept.alternate_sources, vec![Source::Eventbrite]);

    let food_hash = event_hash("Food Festival", date, "Hollywood Bowl", Source::Meetup);
    assert!(store.get(&food_hash).is_some());
}

#[tokio::test]
async fn reruns_are_idempotent_across_url_and_hash_layers() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = pipeline(dir.path(), store.clone(), SyncMode::EveryRun, false);

    let records = || {
        vec![
            raw(
                Source::DiceFm,
                "Warehouse Rave",
                "2026-02-20",
                "Secret Warehouse",
                "https://dice.fm/event/abc",
            ),
            raw(
                Source::PoshVip,
                "Neon Nights",
                "2026-02-21",
                "Exchange LA",
                "https://posh.vip/e/neon-nights",
            ),
        ]
    };

    let first = pipeline.process(records(), Vec::new(), 0).await.expect("run 1");
    assert_eq!(first.synced, 2);
    assert_eq!(store.len(), 2);
    assert_eq!(first.run_counter, 1);

    // identical listings with tracking query strings: URL layer
    let mut tagged = records();
    for record in &mut tagged {
        let link = record.get(fields::LINK).expect("link").to_string();
        record.set(fields::LINK, format!("{link}?utm_source=newsletter"));
    }
    let second = pipeline.process(tagged, Vec::new(), 0).await.expect("run 2");
    assert_eq!(second.url_dropped, 2);
    assert_eq!(second.synced, 0);
    assert_eq!(store.len(), 2);
    assert_eq!(second.run_counter, 2);

    // relisted under new links: hash layer
    let relisted = vec![
        raw(
            Source::DiceFm,
            "Warehouse Rave!",
            "2026-02-20",
            "Secret Warehouse",
            "https://dice.fm/event/abc-relisted",
        ),
        raw(
            Source::PoshVip,
            "Neon Nights",
            "2026-02-21",
            "Exchange LA",
            "https://posh.vip/e/neon-nights-2",
        ),
    ];
    let third = pipeline.process(relisted, Vec::new(), 0).await.expect("run 3");
    assert_eq!(third.hash_dropped, 2);
    assert_eq!(third.synced, 0);
    assert_eq!(store.len(), 2);
    assert_eq!(third.history_entries, 2);
}

#[tokio::test]
async fn cadence_buffers_batches_until_the_nth_invocation() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = pipeline(dir.path(), store.clone(), SyncMode::EveryNth(3), false);

    let first = pipeline
        .process(
            vec![raw(
                Source::Eventbrite,
                "Gallery Opening",
                "2026-03-01",
                "Arts District",
                "https://www.eventbrite.com/e/gallery-1",
            )],
            Vec::new(),
            0,
        )
        .await
        .expect("run 1");
    assert_eq!(first.decision, SyncDecision::Buffer);
    assert_eq!(first.pending_buffered, 1);
    assert!(store.is_empty());

    // second run re-scrapes the buffered event and adds a new one
    let second = pipeline
        .process(
            vec![
                raw(
                    Source::Eventbrite,
                    "Gallery Opening",
                    "2026-03-01",
                    "Arts District",
                    "https://www.eventbrite.com/e/gallery-1",
                ),
                raw(
                    Source::Luma,
                    "Rooftop Sessions",
                    "2026-03-02",
                    "Skyline Lounge",
                    "https://lu.ma/rooftop-sessions",
                ),
            ],
            Vec::new(),
            0,
        )
        .await
        .expect("run 2");
    assert_eq!(second.decision, SyncDecision::Buffer);
    assert_eq!(second.url_dropped, 1);
    assert_eq!(second.pending_buffered, 2);
    assert!(store.is_empty());

    let third = pipeline
        .process(
            vec![raw(
                Source::Meetup,
                "Morning Run Club",
                "2026-03-03",
                "Griffith Park",
                "https://www.meetup.com/run/events/3",
            )],
            Vec::new(),
            0,
        )
        .await
        .expect("run 3");
    assert_eq!(third.decision, SyncDecision::Commit);
    assert_eq!(third.synced, 3);
    assert_eq!(third.pending_buffered, 0);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn failed_sync_defers_records_instead_of_losing_them() {
    let dir = TempDir::new().expect("tempdir");
    // both the attempt and its retry fail on the first run
    let store = Arc::new(MemoryEventStore::failing(2));
    let pipeline = pipeline(dir.path(), store.clone(), SyncMode::EveryRun, false);

    let first = pipeline
        .process(
            vec![raw(
                Source::RaCo,
                "Boiler Room: LA",
                "2026-02-21",
                "The Compound",
                "https://ra.co/events/2059119",
            )],
            Vec::new(),
            0,
        )
        .await
        .expect("run 1");
    assert_eq!(first.decision, SyncDecision::Commit);
    assert_eq!(first.sync_failed, 1);
    assert_eq!(first.synced, 0);
    assert_eq!(first.history_entries, 0);
    assert_eq!(first.pending_buffered, 1);
    assert!(store.is_empty());

    // store is back: the buffered record commits without being re-fetched
    let second = pipeline.process(Vec::new(), Vec::new(), 0).await.expect("run 2");
    assert_eq!(second.synced, 1);
    assert_eq!(second.pending_buffered, 0);
    assert_eq!(second.history_entries, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn force_sync_overrides_the_cadence_decision() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = pipeline(dir.path(), store.clone(), SyncMode::Never, true);

    let summary = pipeline
        .process(
            vec![raw(
                Source::Luma,
                "Community Picnic",
                "2026-03-07",
                "Echo Park",
                "https://lu.ma/community-picnic",
            )],
            Vec::new(),
            0,
        )
        .await
        .expect("run");
    assert_eq!(summary.decision, SyncDecision::Commit);
    assert_eq!(summary.synced, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn invalid_records_are_dropped_with_counts_not_errors() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = pipeline(dir.path(), store.clone(), SyncMode::EveryRun, false);

    let mut missing_date = RawRecord::new(Source::Meetup, "los-angeles", Utc::now());
    missing_date.set(fields::TITLE, "Mystery Meetup");
    missing_date.set(fields::LOCATION, "Somewhere");
    missing_date.set(fields::LINK, "https://www.meetup.com/x/events/1");

    let summary = pipeline
        .process(
            vec![
                missing_date,
                raw(
                    Source::Luma,
                    "Rooftop Sessions",
                    "2026-03-02",
                    "Skyline Lounge",
                    "https://lu.ma/rooftop-sessions",
                ),
            ],
            Vec::new(),
            0,
        )
        .await
        .expect("run");
    assert_eq!(summary.validation_dropped, 1);
    assert_eq!(summary.synced, 1);
    assert_eq!(store.len(), 1);
}
