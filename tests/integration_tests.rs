//! Integration tests for Research Nexus
//!
//! These tests drive full search runs against scripted sources and a mock
//! HTTP server, then cluster and fuse the written result files.

use research_nexus::config::Config;
use research_nexus::dedup::{
    deduplicate_files, DedupConfig, DedupError, DedupStrategy, Deduplicator,
};
use research_nexus::fusion::TrustRanking;
use research_nexus::models::{Document, DocumentBuilder, Query};
use research_nexus::orchestrator::{
    Checkpoint, Orchestrator, OrchestratorConfig, ResultRecord, RunSummary, UnitPaths, UnitStatus,
};
use research_nexus::sources::{
    ContinuationToken, MockSource, ProviderEntry, Source, SourceError, SourceRegistry,
};
use research_nexus::utils::{read_jsonl, RateLimiter, RetryConfig};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn registry(sources: Vec<Arc<MockSource>>) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for source in sources {
        let limiter = RateLimiter::new(source.id(), 1000.0, 100).unwrap();
        registry.register(ProviderEntry::new(source, limiter, Duration::from_secs(1)));
    }
    registry
}

fn run_config(base: &Path, run_id: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(run_id, base.join(run_id));
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: 0.0,
    };
    config
}

fn papers(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            DocumentBuilder::new(format!("Soil microbiome study {}", i), "mock")
                .year(Some(2019))
                .doi(&format!("10.5555/soil.{}", i))
                .build()
        })
        .collect()
}

fn stream_ids(summary: &RunSummary, provider: &str, query_id: &str) -> Vec<String> {
    let unit = summary.unit(provider, query_id).unwrap();
    let records: Vec<ResultRecord> = read_jsonl(&unit.results_path).unwrap();
    records.iter().map(|r| r.document.record_id()).collect()
}

#[tokio::test]
async fn test_failed_unit_does_not_abort_run() {
    let dir = tempdir().unwrap();
    let good = Arc::new(MockSource::new("good").with_documents(&papers(3), 2));
    let bad = Arc::new(
        MockSource::new("bad")
            .with_documents(&papers(3), 2)
            .fail_page(0, SourceError::AuthFailure("403 Forbidden".into()), 1),
    );
    let orchestrator = Orchestrator::new(registry(vec![good, bad]), run_config(dir.path(), "run_a"));

    let summary = orchestrator
        .run(&[Query::new("Q01", "soil microbiome")])
        .await
        .unwrap();

    assert!(!summary.success);
    assert_eq!(summary.units.len(), 2);
    assert_eq!(summary.unit("good", "Q01").unwrap().status, UnitStatus::Complete);
    assert_eq!(summary.unit("good", "Q01").unwrap().records_emitted, 3);
    let failed = summary.unit("bad", "Q01").unwrap();
    assert_eq!(failed.status, UnitStatus::Failed);
    assert!(failed.error.is_some());

    let metadata: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("run_a/run_metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["success"], false);
    assert_eq!(metadata["units"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let docs = papers(6);
    let query = [Query::new("Q01", "soil")];

    // reference run
    let reference_dir = tempdir().unwrap();
    let reference = Orchestrator::new(
        registry(vec![Arc::new(MockSource::new("alpha").with_documents(&docs, 2))]),
        run_config(reference_dir.path(), "run_ref"),
    )
    .run(&query)
    .await
    .unwrap();
    let expected = stream_ids(&reference, "alpha", "Q01");
    assert_eq!(expected.len(), 6);

    // interrupted run: the second page fails terminally once
    let dir = tempdir().unwrap();
    let source = Arc::new(
        MockSource::new("alpha")
            .with_documents(&docs, 2)
            .fail_page(1, SourceError::AuthFailure("401".into()), 1),
    );
    let first = Orchestrator::new(registry(vec![source.clone()]), run_config(dir.path(), "run_x"))
        .run(&query)
        .await
        .unwrap();
    let unit = first.unit("alpha", "Q01").unwrap();
    assert_eq!(unit.status, UnitStatus::Partial);
    assert_eq!(unit.records_emitted, 2);

    let mut config = run_config(dir.path(), "run_x");
    config.resume = true;
    let second = Orchestrator::new(registry(vec![source.clone()]), config)
        .run(&query)
        .await
        .unwrap();
    let unit = second.unit("alpha", "Q01").unwrap();
    assert!(unit.resumed);
    assert_eq!(unit.status, UnitStatus::Complete);
    assert_eq!(unit.records_emitted, 6);
    assert_eq!(stream_ids(&second, "alpha", "Q01"), expected);

    // the resumed run started at the checkpointed page
    let calls = source.calls();
    assert_eq!(
        calls,
        vec![None, Some("1".to_string()), Some("1".to_string()), Some("2".to_string())]
    );
}

#[tokio::test]
async fn test_resume_with_stale_checkpoint_does_not_duplicate() {
    let dir = tempdir().unwrap();
    let source = Arc::new(MockSource::new("alpha").with_documents(&papers(6), 2));
    let query = [Query::new("Q01", "soil")];

    let first = Orchestrator::new(registry(vec![source.clone()]), run_config(dir.path(), "run_s"))
        .run(&query)
        .await
        .unwrap();
    let all = stream_ids(&first, "alpha", "Q01");

    // pretend the run stopped after writing records but before checkpointing them
    let paths = UnitPaths::new(&dir.path().join("run_s"), "alpha", "Q01");
    let mut checkpoint = Checkpoint::load(&paths.checkpoint).unwrap().unwrap();
    checkpoint.status = UnitStatus::InProgress;
    checkpoint.continuation = Some(ContinuationToken::from_offset(1));
    checkpoint.emitted_ids = all.iter().take(2).cloned().collect();
    checkpoint.save(&paths.checkpoint).unwrap();

    let mut config = run_config(dir.path(), "run_s");
    config.resume = true;
    let second = Orchestrator::new(registry(vec![source]), config)
        .run(&query)
        .await
        .unwrap();

    let unit = second.unit("alpha", "Q01").unwrap();
    assert_eq!(unit.status, UnitStatus::Complete);
    assert_eq!(unit.duplicates_skipped, 4);
    assert_eq!(stream_ids(&second, "alpha", "Q01"), all);
}

#[tokio::test]
async fn test_complete_units_are_not_refetched() {
    let dir = tempdir().unwrap();
    let source = Arc::new(MockSource::new("alpha").with_documents(&papers(2), 2));
    let query = [Query::new("Q01", "soil")];

    Orchestrator::new(registry(vec![source.clone()]), run_config(dir.path(), "run_c"))
        .run(&query)
        .await
        .unwrap();
    assert_eq!(source.call_count(), 1);

    let mut config = run_config(dir.path(), "run_c");
    config.resume = true;
    let summary = Orchestrator::new(registry(vec![source.clone()]), config)
        .run(&query)
        .await
        .unwrap();
    assert!(summary.success);
    assert_eq!(summary.unit("alpha", "Q01").unwrap().records_emitted, 2);
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn test_concurrent_units_share_limiter() {
    let dir = tempdir().unwrap();
    let source = Arc::new(
        MockSource::new("alpha")
            .with_documents(&papers(4), 1)
            .with_delay(Duration::from_millis(5)),
    );
    let mut config = run_config(dir.path(), "run_p");
    config.max_workers = 3;
    let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config);

    let queries: Vec<Query> = (1..=5).map(|i| Query::new(format!("Q{:02}", i), "soil")).collect();
    let summary = orchestrator.run(&queries).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.units.len(), 5);
    // reports come back in query order
    let ids: Vec<&str> = summary.units.iter().map(|u| u.query_id.as_str()).collect();
    assert_eq!(ids, vec!["Q01", "Q02", "Q03", "Q04", "Q05"]);
    assert_eq!(source.call_count(), 20);
    assert_eq!(summary.records_emitted(), 20);
}

fn crop_disease_sources() -> Vec<Arc<MockSource>> {
    let crossref = DocumentBuilder::new(
        "Deep Learning for Crop Disease Detection in Smallholder Farms",
        "crossref",
    )
    .year(Some(2021))
    .doi("10.1/a")
    .abstract_text("Short.")
    .cited_by_count(Some(5))
    .url("https://doi.org/10.1/a")
    .build();

    let openalex = DocumentBuilder::new(
        "Deep learning for crop disease detection in smallholder farms.",
        "openalex",
    )
    .year(Some(2021))
    .doi("https://doi.org/10.1/A")
    .external_id("openalex_id", "W100")
    .abstract_text(
        "We train convolutional networks on leaf images collected by smallholder farmers \
         and detect five common crop diseases in the field.",
    )
    .cited_by_count(Some(12))
    .url("https://openalex.org/W100")
    .build();

    let arxiv = DocumentBuilder::new(
        "Deep learning for crop diseases detection in smallholder farm",
        "arxiv",
    )
    .year(Some(2022))
    .external_id("arxiv_id", "2201.00001")
    .abstract_text("Preprint.")
    .url("https://arxiv.org/abs/2201.00001")
    .build();

    vec![
        Arc::new(MockSource::new("crossref").with_documents(&[crossref], 10)),
        Arc::new(MockSource::new("openalex").with_documents(&[openalex], 10)),
        Arc::new(MockSource::new("arxiv").with_documents(&[arxiv], 10)),
    ]
}

#[tokio::test]
async fn test_crop_disease_scenario() {
    let dir = tempdir().unwrap();
    let summary = Orchestrator::new(
        registry(crop_disease_sources()),
        run_config(dir.path(), "run_crop"),
    )
    .run(&[Query::new("Q01", "crop disease detection")])
    .await
    .unwrap();
    assert!(summary.success);
    let run_dir = dir.path().join("run_crop");

    // at the default threshold the preprint stays separate
    let strict_dir = dir.path().join("dedup_97");
    let strict = deduplicate_files(
        &[run_dir.clone()],
        &strict_dir,
        &DedupConfig::default(),
        &TrustRanking::default(),
    )
    .unwrap();
    assert_eq!(strict.stats.identified, 3);
    assert_eq!(strict.stats.unique, 2);
    assert_eq!(strict.stats.exact_duplicates_removed, 1);
    assert_eq!(strict.stats.fuzzy_duplicates_removed, 0);

    // a lower threshold pulls it in
    let loose_dir = dir.path().join("dedup_95");
    let loose = deduplicate_files(
        &[run_dir],
        &loose_dir,
        &DedupConfig {
            fuzzy_threshold: 95.0,
            ..DedupConfig::default()
        },
        &TrustRanking::default(),
    )
    .unwrap();
    assert_eq!(loose.stats.unique, 1);
    assert_eq!(loose.stats.fuzzy_duplicates_removed, 1);

    let fused: Vec<Document> = read_jsonl(&loose.fused_path).unwrap();
    assert_eq!(fused.len(), 1);
    let record = &fused[0];
    assert_eq!(record.provider, "crossref");
    assert_eq!(
        record.title,
        "Deep Learning for Crop Disease Detection in Smallholder Farms"
    );
    assert_eq!(record.doi(), Some("10.1/a"));
    assert_eq!(record.external_ids.first("openalex_id"), Some("w100"));
    assert_eq!(record.external_ids.first("arxiv_id"), Some("2201.00001"));
    assert!(record.abstract_text().starts_with("We train convolutional networks"));
    assert_eq!(record.cited_by_count, Some(12));
    assert_eq!(record.year, Some(2021));
    assert_eq!(record.url.as_deref(), Some("https://doi.org/10.1/a"));
    assert!(record
        .related_urls
        .contains(&"https://arxiv.org/abs/2201.00001".to_string()));

    let clusters: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(loose_dir.join("clusters.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(clusters["membership"].as_object().unwrap().len(), 3);
}

#[test]
fn test_partition_is_order_invariant() {
    let mut docs = vec![
        DocumentBuilder::new("Nitrogen uptake in maize roots", "crossref")
            .year(Some(2018))
            .doi("10.2/n")
            .build(),
        DocumentBuilder::new("Nitrogen Uptake in Maize Roots!", "arxiv")
            .year(Some(2019))
            .external_id("arxiv_id", "1801.1")
            .build(),
        DocumentBuilder::new("A different paper about wheat", "openalex")
            .year(Some(2018))
            .doi("10.2/n")
            .build(),
        DocumentBuilder::new("Phosphorus cycling in tropical soils", "pubmed")
            .year(Some(2020))
            .external_id("pubmed_id", "99")
            .build(),
        DocumentBuilder::new("Phosphorus cycling in tropical soil", "openalex")
            .year(Some(2020))
            .external_id("openalex_id", "W5")
            .build(),
        DocumentBuilder::new("Untitled result set", "crossref").build(),
    ];

    let partition = |docs: &[Document]| -> BTreeSet<BTreeSet<String>> {
        let deduplicator = Deduplicator::new(DedupConfig::default()).unwrap();
        let result = deduplicator.cluster(docs);
        result
            .clusters
            .iter()
            .map(|c| c.members.iter().map(|&i| docs[i].record_id()).collect())
            .collect()
    };

    let expected = partition(&docs);
    assert_eq!(expected.len(), 3);
    for _ in 0..docs.len() {
        docs.rotate_left(1);
        assert_eq!(partition(&docs), expected);
    }
    docs.reverse();
    assert_eq!(partition(&docs), expected);
}

#[test]
fn test_unimplemented_strategies_fail_fast() {
    for strategy in [DedupStrategy::Semantic, DedupStrategy::Hybrid] {
        let config = DedupConfig {
            strategy,
            ..DedupConfig::default()
        };
        assert!(matches!(
            Deduplicator::new(config.clone()),
            Err(DedupError::StrategyNotImplemented(s)) if s == strategy
        ));

        let dir = tempdir().unwrap();
        let err = deduplicate_files(&[], dir.path(), &config, &TrustRanking::default()).unwrap_err();
        assert!(matches!(err, DedupError::StrategyNotImplemented(_)));
    }
}

#[tokio::test]
async fn test_openalex_run_through_registry() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "meta": {"count": 1, "next_cursor": null},
        "results": [{
            "id": "https://openalex.org/W42",
            "doi": "https://doi.org/10.9/XYZ",
            "display_name": "Cover crops and soil carbon",
            "publication_year": 2020,
            "cited_by_count": 7,
            "authorships": [{"author": {"display_name": "Ana Silva"}}]
        }]
    });
    let mock = server
        .mock("GET", "/works")
        .match_query(mockito::Matcher::UrlEncoded(
            "search".into(),
            "cover crops".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let mut config = Config::default();
    for provider in config.providers.values_mut() {
        provider.enabled = false;
    }
    let openalex = config.providers.get_mut("openalex").unwrap();
    openalex.enabled = true;
    openalex.base_url = Some(server.url());
    config.search.output_dir = dir.path().to_path_buf();

    let registry = SourceRegistry::from_config(&config).unwrap();
    assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["openalex"]);

    let orchestrator = Orchestrator::new(
        registry,
        OrchestratorConfig::from_config(&config, "run_oa"),
    );
    let summary = orchestrator
        .run(&[Query::new("Q01", "cover crops")])
        .await
        .unwrap();
    mock.assert_async().await;

    assert!(summary.success);
    let records: Vec<ResultRecord> =
        read_jsonl(&dir.path().join("run_oa/openalex/all_results.jsonl")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].query_id, "Q01");
    assert_eq!(records[0].document.doi(), Some("10.9/xyz"));
    assert_eq!(records[0].document.record_id(), "openalex:w42");
}
