//! Integration tests for the fetch engine and crawl loop
//!
//! These tests use wiremock to stand in for the listing site and verify the
//! count-driven pagination behavior, including exact request counts.

use flathound::config::FetchConfig;
use flathound::executor::{check_url, crawl_new_offers, SharedStore};
use flathound::fetch::{Crawl, Fetcher};
use flathound::store::MemoryStore;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_fetch_config(proxies: Vec<String>, trials: u32) -> FetchConfig {
    FetchConfig {
        proxies,
        trials,
        attempt_delay_ms: 0, // no point sleeping in tests
        request_timeout_secs: 5,
        default_time_window: 3600,
    }
}

fn results_page(count: u32, rows: &str) -> String {
    format!(
        "<html><head><title>Аренда квартир - {} объявлений</title></head>\
         <body><table>{}</table></body></html>",
        count, rows
    )
}

fn offer_rows(ids: std::ops::Range<u64>) -> String {
    ids.map(|id| {
        format!(
            r#"<tr class="offer_container">
                <td class="objects_item_info_col_2"><div>Квартира {}</div></td>
                <td class="objects_item_info_col_9">
                    <div class="objects_item_comment">сдаётся <a href="https://cian.ru/rent/flat/{}/">подробнее</a></div>
                </td>
            </tr>"#,
            id, id
        )
    })
    .collect()
}

const EMPTY_PAGE: &str = r#"<html><head><title>Аренда квартир</title></head>
    <body><div class="serps-header_nothing-found__title">Ничего не найдено</div></body></html>"#;

#[tokio::test]
async fn crawl_with_zero_results_makes_no_further_requests() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMPTY_PAGE))
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let mut crawl = Crawl::new(&fetcher, &format!("{}/cat.php", mock_server.uri()), 3600);

    assert!(crawl.next_page().await.unwrap().is_none());
    assert!(crawl.next_page().await.unwrap().is_none());

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn crawl_pagination_overshoots_by_page_size() {
    // 45 declared results, 30 fragments per page: the crawl must fetch
    // exactly 2 pages and yield all 60 fragments - the loop stops because
    // the remainder goes negative, never because 45 was hit exactly.
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("p", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(results_page(45, &offer_rows(1..31))),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("p", "2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(results_page(45, &offer_rows(31..61))),
        )
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let mut crawl = Crawl::new(&fetcher, &format!("{}/cat.php", mock_server.uri()), 3600);

    let mut total_fragments = 0;
    while let Some(fragments) = crawl.next_page().await.unwrap() {
        total_fragments += fragments.len();
    }
    assert_eq!(total_fragments, 60);

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn crawl_applies_time_window_to_every_page() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("totime", "900"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(results_page(3, &offer_rows(1..4))),
        )
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let mut crawl = Crawl::new(&fetcher, &format!("{}/cat.php", mock_server.uri()), 900);

    assert_eq!(crawl.next_page().await.unwrap().unwrap().len(), 3);
    assert!(crawl.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn crawl_stops_on_declared_count_with_no_fragments() {
    // A page that declares results but carries no rows must terminate the
    // crawl instead of looping on a remainder that never decreases.
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(results_page(45, "")))
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let mut crawl = Crawl::new(&fetcher, &format!("{}/cat.php", mock_server.uri()), 3600);

    assert!(crawl.next_page().await.unwrap().is_none());
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn safe_fetch_exhausts_proxy_trials() {
    // The server rejects the direct attempt; the three proxies point at a
    // closed local port, so every proxied attempt fails to connect. Expect
    // one no-proxy attempt plus trials x 3 proxy attempts, with the shared
    // cursor having advanced exactly that many positions.
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let proxies = vec![
        "127.0.0.1:9".to_string(),
        "127.0.0.1:9".to_string(),
        "127.0.0.1:9".to_string(),
    ];
    let fetcher = Fetcher::new(&test_fetch_config(proxies, 2)).unwrap();

    let result = fetcher.safe_fetch(&mock_server.uri()).await;
    match result {
        Err(flathound::fetch::FetchError::RetriesExhausted { attempts, .. }) => {
            assert_eq!(attempts, 1 + 2 * 3);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other.map(|_| ())),
    }
    assert_eq!(fetcher.ring().cursor(), 6);
}

#[tokio::test]
async fn challenge_page_counts_as_failure() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"<script src="https://www.google.com/recaptcha/api.js">"#),
        )
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let result = fetcher.safe_fetch(&mock_server.uri()).await;
    assert!(matches!(
        result,
        Err(flathound::fetch::FetchError::RetriesExhausted { attempts: 1, .. })
    ));
}

#[tokio::test]
async fn crawl_new_offers_reports_only_unseen_ids() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cat.php"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(results_page(3, &offer_rows(100..103))),
        )
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let store: SharedStore = Arc::new(Mutex::new(MemoryStore::new()));
    let url = format!("{}/cat.php", mock_server.uri());

    let first = crawl_new_offers(&fetcher, &store, &url, 3600).await.unwrap();
    assert_eq!(first, vec![100, 101, 102]);

    // Idempotent re-processing: a redelivered job finds nothing new.
    let second = crawl_new_offers(&fetcher, &store, &url, 3600).await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn crawl_new_offers_skips_malformed_fragments() {
    let rows = format!(
        r#"{}<tr class="offer_container"><td>no link at all</td></tr>"#,
        offer_rows(200..202)
    );
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(results_page(3, &rows)))
        .mount(&mock_server)
        .await;

    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    let store: SharedStore = Arc::new(Mutex::new(MemoryStore::new()));
    let url = format!("{}/cat.php", mock_server.uri());

    // The malformed row still counted against the remainder, so the crawl
    // finishes after one page with two stored offers.
    let ids = crawl_new_offers(&fetcher, &store, &url, 3600).await.unwrap();
    assert_eq!(ids, vec![200, 201]);
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn check_url_rejects_foreign_hosts_without_fetching() {
    let fetcher = Fetcher::new(&test_fetch_config(vec![], 1)).unwrap();
    assert!(!check_url(&fetcher, "https://example.com/cat.php?x=1").await);
    assert!(!check_url(&fetcher, "not a url").await);
}
