use crawl_fleet::backoff::RetryPolicy;
use crawl_fleet::fetch_worker::{FetchWorker, worker_output_path};
use crawl_fleet::index_locator::{IndexLocator, LocatorError};
use crawl_fleet::ledger::SeenUrlLedger;
use crawl_fleet::network::HttpClient;
use crawl_fleet::partition::PartitionAssignment;
use crawl_fleet::range_fetcher::{RangeError, RangeFetcher};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INDEX: &str = "CC-MAIN-TEST";

fn http() -> HttpClient {
    HttpClient::new("TestBot/1.0".to_string(), 5).unwrap()
}

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn warc_record(body: &str) -> String {
    format!(
        "WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: https://example.com.ar/\r\n\r\n\
         HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n{}",
        body
    )
}

fn page(i: usize) -> String {
    format!(
        "<html><head><script>var x = {};</script></head><body><p>Contenido de prueba numero {} \
         con suficiente texto para superar el umbral minimo.</p></body></html>",
        i, i
    )
}

fn index_line(i: usize, length: usize) -> String {
    format!(
        r#"{{"urlkey":"ar,com,site{i})/","url":"https://site{i}.com.ar/","filename":"crawl/{i}.warc.gz","offset":"0","length":"{length}","status":"200"}}"#
    )
}

/// Index server plus archive serving `count` well-formed records.
async fn mount_crawl(server: &MockServer, count: usize) {
    let mut lines = Vec::new();
    for i in 0..count {
        let body = gzip(&warc_record(&page(i)));
        lines.push(index_line(i, body.len()));
        Mock::given(method("GET"))
            .and(path(format!("/crawl/{}.warc.gz", i)))
            .and(header("Range", format!("bytes=0-{}", body.len() - 1).as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body))
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .and(query_param("url", "*.ar"))
        .and(query_param("output", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(lines.join("\n") + "\n"))
        .mount(server)
        .await;
}

fn worker(server: &MockServer) -> FetchWorker {
    let base = format!("{}/", server.uri());
    FetchWorker::new(http(), &base, &server.uri()).with_retry(RetryPolicy::immediate(3))
}

fn urls_in(path: &Path) -> HashSet<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["url"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_two_workers_split_four_records() {
    let server = MockServer::start().await;
    mount_crawl(&server, 4).await;
    let dir = TempDir::new().unwrap();
    let worker = worker(&server);

    let mut outputs = Vec::new();
    for worker_id in 0..2 {
        let assignment = PartitionAssignment::new(worker_id, 2).unwrap();
        let output = worker_output_path(dir.path(), INDEX, assignment);
        let report = worker
            .process_index(INDEX, "*.ar", assignment, &output)
            .await
            .unwrap();
        assert_eq!(report.discovered, 4);
        assert_eq!(report.claimed, 2);
        assert_eq!(report.written, 2);
        assert_eq!(report.errors, 0);
        outputs.push(urls_in(&output));
    }

    assert!(!outputs[0].is_empty());
    assert!(!outputs[1].is_empty());
    assert!(outputs[0].is_disjoint(&outputs[1]));
    let union: HashSet<String> = outputs[0].union(&outputs[1]).cloned().collect();
    let expected: HashSet<String> = (0..4).map(|i| format!("https://site{}.com.ar/", i)).collect();
    assert_eq!(union, expected);

    let content = std::fs::read_to_string(worker_output_path(
        dir.path(),
        INDEX,
        PartitionAssignment::new(0, 2).unwrap(),
    ))
    .unwrap();
    assert!(content.contains("Contenido de prueba numero 0"));
    assert!(!content.contains("var x"));
}

#[tokio::test]
async fn test_rerun_writes_no_duplicates() {
    let server = MockServer::start().await;
    mount_crawl(&server, 3).await;
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("single.jsonl");
    let worker = worker(&server);

    let first = worker
        .process_index(INDEX, "*.ar", PartitionAssignment::single(), &output)
        .await
        .unwrap();
    let second = worker
        .process_index(INDEX, "*.ar", PartitionAssignment::single(), &output)
        .await
        .unwrap();

    assert_eq!(first.written, 3);
    assert_eq!(second.written, 0);
    assert_eq!(second.skipped_seen, 3);
    assert_eq!(std::fs::read_to_string(&output).unwrap().lines().count(), 3);
    assert_eq!(SeenUrlLedger::load(&output).unwrap().len(), 3);
}

#[tokio::test]
async fn test_locator_gives_up_after_three_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let locator = IndexLocator::new(http(), server.uri()).with_retry(RetryPolicy::immediate(3));
    let err = locator.locate("*.ar", INDEX).await.unwrap_err();

    assert!(matches!(err, LocatorError::Http(503, _)));
    server.verify().await;
}

#[tokio::test]
async fn test_locator_rejects_malformed_lines_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}\nnot json at all\n",
            index_line(0, 10)
        )))
        .expect(1)
        .mount(&server)
        .await;

    let locator = IndexLocator::new(http(), server.uri()).with_retry(RetryPolicy::immediate(3));
    let err = locator.locate("*.ar", INDEX).await.unwrap_err();

    assert!(matches!(err, LocatorError::Data(_)));
    server.verify().await;
}

#[tokio::test]
async fn test_locator_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_string(index_line(7, 10)))
        .mount(&server)
        .await;

    let locator = IndexLocator::new(http(), server.uri()).with_retry(RetryPolicy::immediate(3));
    let records = locator.locate("*.ar", INDEX).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, "https://site7.com.ar/");
}

#[tokio::test]
async fn test_list_indexes_from_collinfo() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/collinfo.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{"id":"CC-MAIN-2024-33","name":"August 2024 Index"},{"id":"CC-MAIN-2024-30","name":"July 2024 Index"}]"#,
        ))
        .mount(&server)
        .await;

    let indexes = IndexLocator::new(http(), server.uri()).list_indexes().await.unwrap();
    assert_eq!(indexes, vec!["CC-MAIN-2024-33", "CC-MAIN-2024-30"]);
}

#[tokio::test]
async fn test_range_fetch_requires_partial_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crawl/whole.warc.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip(&warc_record("x"))))
        .mount(&server)
        .await;

    let fetcher = RangeFetcher::new(http());
    let err = fetcher
        .fetch_payload(&format!("{}/crawl/whole.warc.gz", server.uri()), 0, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, RangeError::UnexpectedStatus(200)));
}

#[tokio::test]
async fn test_range_fetch_extracts_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crawl/one.warc.gz"))
        .and(header("Range", "bytes=100-149"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(gzip(&warc_record("<p>hola</p>"))))
        .mount(&server)
        .await;

    let fetcher = RangeFetcher::new(http());
    let payload = fetcher
        .fetch_payload(&format!("{}/crawl/one.warc.gz", server.uri()), 100, 50)
        .await
        .unwrap();
    assert_eq!(payload.as_deref(), Some("<p>hola</p>"));
}

#[tokio::test]
async fn test_bad_records_are_counted_not_fatal() {
    let server = MockServer::start().await;

    // Record 0 is fine, record 1 lacks the payload separator, record 2 is not gzip, record 3 is gone.
    let good = gzip(&warc_record(&page(0)));
    let unframed = gzip("WARC/1.0\r\nWARC-Type: response\r\n\r\nHTTP/1.1 200 OK only headers");
    let lines = [
        index_line(0, good.len()),
        index_line(1, unframed.len()),
        index_line(2, 16),
        index_line(3, 16),
    ];
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_string(lines.join("\n")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crawl/0.warc.gz"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(good))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crawl/1.warc.gz"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(unframed))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crawl/2.warc.gz"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"definitely not gzip".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crawl/3.warc.gz"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.jsonl");
    let report = worker(&server)
        .process_index(INDEX, "*.ar", PartitionAssignment::single(), &output)
        .await
        .unwrap();

    assert_eq!(report.discovered, 4);
    assert_eq!(report.written, 1);
    assert_eq!(report.no_content, 1);
    assert_eq!(report.errors, 2);
    assert_eq!(urls_in(&output), HashSet::from(["https://site0.com.ar/".to_string()]));
    server.verify().await;
}

#[tokio::test]
async fn test_crawl_stage_rank_writes_own_file() {
    use crawl_fleet::orchestration::stages::{StageSpec, rank_output_path};

    let server = MockServer::start().await;
    mount_crawl(&server, 4).await;
    let dir = TempDir::new().unwrap();

    let stage = StageSpec::CommonCrawl {
        index: INDEX.to_string(),
        pattern: "*.ar".to_string(),
        index_server: server.uri(),
        archive_base: server.uri(),
        output_dir: dir.path().to_path_buf(),
    };
    let pipeline = stage.build(http());
    pipeline.run_rank(1, 2).await.unwrap();

    let output = rank_output_path(dir.path(), INDEX, 1);
    assert_eq!(
        urls_in(&output),
        HashSet::from([
            "https://site1.com.ar/".to_string(),
            "https://site3.com.ar/".to_string()
        ])
    );
}

#[tokio::test]
async fn test_pattern_without_captures_is_empty_not_an_error() {
    use crawl_fleet::orchestration::stages::StageSpec;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"{"message": "No Captures found for: *.zz"}"#,
        ))
        .mount(&server)
        .await;

    let locator = IndexLocator::new(http(), server.uri()).with_retry(RetryPolicy::immediate(3));
    assert!(locator.locate("*.zz", INDEX).await.unwrap().is_empty());

    let dir = TempDir::new().unwrap();
    let stage = StageSpec::CommonCrawl {
        index: INDEX.to_string(),
        pattern: "*.zz".to_string(),
        index_server: server.uri(),
        archive_base: server.uri(),
        output_dir: dir.path().to_path_buf(),
    };
    stage.build(http()).run_rank(0, 1).await.unwrap();
}

#[tokio::test]
async fn test_transient_record_failure_is_retried_then_skipped() {
    let server = MockServer::start().await;

    let good = gzip(&warc_record(&page(2)));
    let lines = [index_line(0, 16), index_line(1, good.len()), index_line(2, good.len())];
    Mock::given(method("GET"))
        .and(path(format!("/{}-index", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_string(lines.join("\n")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crawl/0.warc.gz"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    for i in 1..3 {
        Mock::given(method("GET"))
            .and(path(format!("/crawl/{}.warc.gz", i)))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(good.clone()))
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.jsonl");
    let report = worker(&server)
        .process_index(INDEX, "*.ar", PartitionAssignment::single(), &output)
        .await
        .unwrap();

    assert_eq!(report.errors, 1);
    assert_eq!(report.written, 2);
    assert_eq!(
        urls_in(&output),
        HashSet::from([
            "https://site1.com.ar/".to_string(),
            "https://site2.com.ar/".to_string()
        ])
    );
    server.verify().await;
}
