//! Batch dispatch: ordering, partial cache hits, uploads and file results.

mod helpers;

use finx_socket::{BatchInput, BatchRequest, Client, ClientContext, ClientSettings, Resolved, Row};
use helpers::mock_service::{MockService, Reply};
use helpers::{UNUSED_API_URL, VALID_KEY, context, object, overlay};
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rows(ids: &[&str]) -> Vec<Row> {
    ids.iter()
        .map(|id| object(json!({"security_id": id, "as_of_date": "2024-01-02"})))
        .collect()
}

/// Answers each batch with one record per inline row, in reverse order.
fn reversing_service() -> MockService {
    MockService::start(|request| {
        let Some(batch) = request.frame["batch_input"].as_array() else {
            return Vec::new();
        };
        let records: Vec<Value> = batch
            .iter()
            .rev()
            .map(|row| {
                let id = row["security_id"].as_str().unwrap_or_default();
                json!({"security_id": id, "price": format!("p-{}", id)})
            })
            .collect();
        vec![Reply::Frame(json!({
            "data": records,
            "cache_key": request.frame["cache_key"].clone(),
        }))]
    })
}

fn price(result: &finx_socket::ClientResult<Resolved>) -> Value {
    result.as_ref().unwrap().value().unwrap()["price"].clone()
}

#[tokio::test]
async fn batch_results_follow_input_order() {
    let service = reversing_service();
    let client = Client::connect_async(context(UNUSED_API_URL, &service.ws_url()))
        .await
        .unwrap();

    let results = client
        .dispatch_batch(BatchRequest::new("get_price", rows(&["A", "B", "C"])))
        .await
        .unwrap();

    let prices: Vec<Value> = results.iter().map(price).collect();
    assert_eq!(prices, vec![json!("p-A"), json!("p-B"), json!("p-C")]);

    let sent = service.received_for("batch_get_price");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["run_batch"], json!(true));
    assert_eq!(sent[0]["batch_input"].as_array().unwrap().len(), 3);
    client.close().await;
}

#[tokio::test]
async fn only_uncached_rows_are_sent() {
    let service = reversing_service();
    let client = Client::connect_async(context(UNUSED_API_URL, &service.ws_url()))
        .await
        .unwrap();

    client
        .dispatch_batch(BatchRequest::new("get_price", rows(&["B", "D"])))
        .await
        .unwrap();
    let results = client
        .dispatch_batch(BatchRequest::new("get_price", rows(&["A", "B", "C", "D", "E"])))
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    let prices: Vec<Value> = results.iter().map(price).collect();
    assert_eq!(
        prices,
        vec![json!("p-A"), json!("p-B"), json!("p-C"), json!("p-D"), json!("p-E")]
    );

    let sent = service.received_for("batch_get_price");
    assert_eq!(sent.len(), 2);
    let second_keys = sent[1]["cache_key"].as_array().unwrap();
    assert_eq!(second_keys.len(), 3);
    let sent_ids: Vec<&str> = sent[1]["batch_input"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|row| row["security_id"].as_str())
        .collect();
    assert_eq!(sent_ids, vec!["A", "C", "E"]);
    client.close().await;
}

#[tokio::test]
async fn fully_cached_batch_sends_nothing() {
    let service = reversing_service();
    let client = Client::connect_async(context(UNUSED_API_URL, &service.ws_url()))
        .await
        .unwrap();

    let request = || BatchRequest::new("get_price", rows(&["A", "B"]));
    let first = client.dispatch_batch(request()).await.unwrap();
    let second = client.dispatch_batch(request()).await.unwrap();

    assert_eq!(
        first.iter().map(price).collect::<Vec<_>>(),
        second.iter().map(price).collect::<Vec<_>>()
    );
    assert_eq!(service.received_for("batch_get_price").len(), 1);
    client.close().await;
}

#[test]
fn blocking_batch_reads_and_writes_csv_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.csv");
    let output = dir.path().join("output.csv");
    std::fs::write(
        &input,
        "security_id,as_of_date\nA,2024-01-02\nB,2024-01-02\n",
    )
    .unwrap();

    let service = reversing_service();
    let client = Client::connect(context(UNUSED_API_URL, &service.ws_url())).unwrap();
    let results = client
        .dispatch_batch_blocking(
            BatchRequest::new("get_price", BatchInput::File(input)).with_output_file(&output),
        )
        .unwrap();
    client.close_blocking();

    assert_eq!(results.len(), 2);
    let written = std::fs::read_to_string(&output).unwrap();
    let mut lines = written.lines();
    assert!(lines.next().unwrap().contains("price"));
    assert!(lines.next().unwrap().contains("p-A"));
    assert!(lines.next().unwrap().contains("p-B"));
}

#[tokio::test]
async fn large_batches_are_uploaded() {
    let http = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/batch-upload/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"filename": "stored.csv"})))
        .expect(1)
        .mount(&http)
        .await;

    let service = MockService::start(|request| {
        vec![Reply::Frame(json!({
            "data": {"price": 1.0},
            "cache_key": request.frame["cache_key"].clone(),
        }))]
    });
    let mut settings = overlay(&format!("{}/api/", http.uri()), &service.ws_url(), VALID_KEY);
    settings.max_inline_batch_rows = Some(1);
    let context = ClientContext::new(ClientSettings::from_overlay(settings).unwrap()).unwrap();
    let client = Client::connect_async(context).await.unwrap();

    let results = client
        .dispatch_batch(BatchRequest::new("get_price", rows(&["A", "B"])))
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.is_ok()));
    let sent = service.received_for("batch_get_price");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["batch_input"], json!("stored.csv"));
    client.close().await;
}

#[tokio::test]
async fn file_results_are_downloaded_and_matched() {
    let http = MockServer::start().await;
    let body = "security_id,price,cache_key\n\
                A,1.5,\"[null, \"\"A:2024-01-02:get_price\"\", \"\"NONE\"\"]\"\n\
                B,2.5,\"[null, \"\"B:2024-01-02:get_price\"\", \"\"NONE\"\"]\"\n";
    Mock::given(method("GET"))
        .and(path("/api/batch-download/"))
        .and(query_param("filename", "results.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&http)
        .await;

    let service = MockService::start(|request| {
        vec![Reply::Frame(json!({
            "data": {"filename": "results.csv", "bucket_name": "results"},
            "cache_key": request.frame["cache_key"].clone(),
        }))]
    });
    let settings = overlay(&format!("{}/api/", http.uri()), &service.ws_url(), VALID_KEY);
    let context = ClientContext::new(ClientSettings::from_overlay(settings).unwrap()).unwrap();
    let client = Client::connect_async(context).await.unwrap();

    let results = client
        .dispatch_batch(BatchRequest::new("get_price", rows(&["B", "A"])))
        .await
        .unwrap();

    let ids: Vec<Value> = results
        .iter()
        .map(|r| r.as_ref().unwrap().value().unwrap()["security_id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("B"), json!("A")]);
    client.close().await;
}

#[tokio::test]
async fn metadata_methods_cannot_be_batched() {
    let service = reversing_service();
    let client = Client::connect_async(context(UNUSED_API_URL, &service.ws_url()))
        .await
        .unwrap();

    let err = client
        .dispatch_batch(BatchRequest::new("list_api_functions", rows(&["A"])))
        .await
        .unwrap_err();

    assert!(matches!(err, finx_socket::ClientError::BatchUsage { .. }));
    assert!(service.received().is_empty());
    client.close().await;
}
