//! HTTP-level tests for the Google Sheets transport against a mock server.

use ingest_sheets::{GoogleSheetsConfig, GoogleSheetsTransport, SheetTransport, SheetsError, SubmissionSheet};
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, method, path_regex},
    Mock, MockServer, ResponseTemplate,
};

fn transport_for(server: &MockServer) -> GoogleSheetsTransport {
    let mut config = GoogleSheetsConfig::new("sheet-123", "test-token");
    config.base_url = server.uri();
    GoogleSheetsTransport::new(config).expect("transport")
}

#[tokio::test]
async fn fetch_submissions_reads_tail_range_with_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path_regex(
            r"^/v4/spreadsheets/sheet-123/values/SUBMISSIONS(!|%21)A7(:|%3A)I$",
        ))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "range": "SUBMISSIONS!A7:I9",
            "majorDimension": "ROWS",
            "values": [
                ["2/3/2020 18:22:10", "5300000001", "alice", "wombo", "Rampage", "Axe", "14:02", "FALSE"],
                [],
                ["2/3/2020 18:25:41", "5300000002", "bob"]
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sheet = SubmissionSheet::new(transport_for(&server));
    let window = sheet.fetch_submissions(5).await.expect("fetch");

    assert_eq!(window.start_index, 5);
    assert_eq!(window.row_count, 3);
    assert_eq!(window.end_index(), 8);
    assert_eq!(window.submissions.len(), 2);
    assert_eq!(window.submissions[0].row_index, 5);
    assert_eq!(window.submissions[0].match_id, 5_300_000_001);
    assert_eq!(window.submissions[0].category_raw, "Rampage");
    assert_eq!(window.submissions[1].row_index, 7);
    assert_eq!(window.submissions[1].name, "bob");
}

#[tokio::test]
async fn empty_tail_has_no_values_field() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "range": "SUBMISSIONS!A40:I1000",
            "majorDimension": "ROWS"
        })))
        .mount(&server)
        .await;

    let window = SubmissionSheet::new(transport_for(&server))
        .fetch_submissions(38)
        .await
        .expect("fetch");

    assert!(window.is_empty());
    assert!(window.submissions.is_empty());
}

#[tokio::test]
async fn malformed_timestamp_fails_fetch_with_schema_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "values": [["2020-02-03 18:22", "5300000001"]]
        })))
        .mount(&server)
        .await;

    let err = SubmissionSheet::new(transport_for(&server))
        .fetch_submissions(0)
        .await
        .expect_err("schema error");

    assert!(matches!(err, SheetsError::Schema(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn rate_limited_fetch_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = transport_for(&server).fetch_rows(0).await.expect_err("429");

    assert!(matches!(err, SheetsError::HttpStatus { status: 429, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn mark_imported_sends_one_batch_update() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/v4/spreadsheets/sheet-123/values(:|%3A)batchUpdate$"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({
            "valueInputOption": "RAW",
            "data": [
                { "range": "SUBMISSIONS!H2", "values": [["TRUE"]] },
                { "range": "SUBMISSIONS!H4", "values": [["TRUE"]] },
                { "range": "SUBMISSIONS!H5", "values": [["TRUE"]] }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "spreadsheetId": "sheet-123",
            "totalUpdatedCells": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    SubmissionSheet::new(transport_for(&server))
        .set_submissions_imported(&[0, 2, 3], true)
        .await
        .expect("batch update");
}

#[tokio::test]
async fn mark_imported_with_no_rows_makes_no_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    SubmissionSheet::new(transport_for(&server))
        .set_submissions_imported(&[], true)
        .await
        .expect("noop");
}

#[tokio::test]
async fn failed_batch_update_surfaces_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = SubmissionSheet::new(transport_for(&server))
        .set_submissions_imported(&[1], true)
        .await
        .expect_err("500");

    assert!(matches!(err, SheetsError::HttpStatus { status: 500, .. }));
}
