mod common;

use std::sync::Arc;

use mockito::{Matcher, Server};
use serde_json::json;
use uuid::Uuid;

use kycverify_core::{
    load_upload, BatchOptions, BatchOrchestrator, CancellationSignal, IdentifierKind,
    JsonLinesOutcomeStore, KycError, MemoryOutcomeStore, OutcomeSource, VerificationStatus,
};

#[tokio::test]
async fn test_end_to_end_against_mock_provider() {
    let mut server = Server::new_async().await;
    let auth = server
        .mock("POST", "/authenticate")
        .match_header("x-api-key", common::API_KEY)
        .match_header("x-api-secret", common::API_SECRET)
        .with_status(200)
        .with_body(common::token_body())
        .expect(1)
        .create_async()
        .await;
    let first_row = server
        .mock("POST", "/kyc/pan/verify")
        .match_header("authorization", "jwt-abc")
        .match_body(Matcher::PartialJson(json!({
            "pan": "ABCDE1234F",
            "name_as_per_pan": "Asha Rao",
            "date_of_birth": "01/03/1990",
            "reason": "loan onboarding"
        })))
        .with_status(200)
        .with_body(common::verified_body())
        .expect(1)
        .create_async()
        .await;
    let third_row = server
        .mock("POST", "/kyc/pan/verify")
        .match_body(Matcher::PartialJson(json!({
            "pan": "PQRSX6789K",
            "date_of_birth": "12/11/1978",
            "reason": "KYC verification"
        })))
        .with_status(200)
        .with_body(r#"{"data": {"status": "valid", "name_as_per_pan_match": false}}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonLinesOutcomeStore::new(dir.path().join("outcomes.jsonl")));
    let config = common::config_for(&server.url(), &[]);
    let orchestrator = BatchOrchestrator::with_provider(config, store.clone()).unwrap();

    let report = orchestrator
        .run_batch(
            &common::pan_sheet(),
            BatchOptions::default(),
            CancellationSignal::never(),
        )
        .await
        .unwrap();

    auth.assert_async().await;
    first_row.assert_async().await;
    third_row.assert_async().await;

    let summary = &report.summary;
    assert_eq!(summary.total_rows, 3);
    assert_eq!(summary.accepted_records, 2);
    assert_eq!(summary.skipped_rows, 1);
    assert_eq!(summary.skipped[0].row_number, 3);
    assert_eq!(summary.count_status(VerificationStatus::Verified), 1);
    assert_eq!(summary.count_status(VerificationStatus::Mismatched), 1);
    assert_eq!(summary.count_source(OutcomeSource::FallbackSimulation), 0);

    let stored = store.read_all().await.unwrap();
    assert_eq!(stored.len(), 2);
    let contents = std::fs::read_to_string(store.path()).unwrap();
    assert!(!contents.contains("ABCDE1234F"));
    assert!(!contents.contains("Asha Rao"));

    let cipher = orchestrator.cipher();
    let mut identifiers: Vec<String> = stored
        .iter()
        .map(|(_, record)| cipher.decrypt(&record.identifier).unwrap())
        .collect();
    identifiers.sort();
    assert_eq!(identifiers, vec!["ABCDE1234F", "PQRSX6789K"]);

    let ids: Vec<&str> = report
        .outcomes
        .iter()
        .filter_map(|o| o.record_id.as_deref())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(stored.iter().all(|(id, _)| ids.contains(&id.as_str())));
}

#[tokio::test]
async fn test_strict_mode_records_error_after_retries() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/authenticate")
        .with_status(200)
        .with_body(common::token_body())
        .create_async()
        .await;
    let verify = server
        .mock("POST", "/kyc/pan/verify")
        .with_status(503)
        .with_body("upstream unavailable")
        .expect(3)
        .create_async()
        .await;

    let store = Arc::new(MemoryOutcomeStore::new());
    let config = common::config_for(&server.url(), &[("KYC_MAX_RETRIES", "2")]);
    let orchestrator = BatchOrchestrator::with_provider(config, store.clone()).unwrap();
    let sheet = kycverify_core::RawSheet::from_rows(vec![
        vec!["PAN", "Name"],
        vec!["ABCDE1234F", "Asha Rao"],
    ]);

    let report = orchestrator
        .run_batch(&sheet, BatchOptions::default(), CancellationSignal::never())
        .await
        .unwrap();

    verify.assert_async().await;
    let outcome = &report.outcomes[0].outcome;
    assert_eq!(outcome.status, VerificationStatus::Error);
    assert_eq!(outcome.source, OutcomeSource::Provider);
    assert_eq!(outcome.attempts.len(), 3);
    assert!(outcome.raw_provider_response.is_none());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_simulate_mode_tags_placeholder_outcomes() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/authenticate")
        .with_status(200)
        .with_body(common::token_body())
        .create_async()
        .await;
    server
        .mock("POST", "/kyc/pan/verify")
        .with_status(500)
        .create_async()
        .await;

    let config = common::config_for(
        &server.url(),
        &[("KYC_FALLBACK_MODE", "simulate"), ("KYC_MAX_RETRIES", "1")],
    );
    let orchestrator =
        BatchOrchestrator::with_provider(config, Arc::new(MemoryOutcomeStore::new())).unwrap();

    let report = orchestrator
        .run_batch(
            &common::pan_sheet(),
            BatchOptions::default(),
            CancellationSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(report.summary.count_source(OutcomeSource::FallbackSimulation), 2);
    assert_eq!(report.summary.count_status(VerificationStatus::Pending), 2);
    for outcome in &report.outcomes {
        assert!(outcome.outcome.is_simulated());
        assert_eq!(
            outcome.outcome.raw_provider_response.as_ref().unwrap()["simulated"],
            true
        );
    }
}

#[tokio::test]
async fn test_authentication_failure_aborts_batch() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/authenticate")
        .with_status(403)
        .with_body(r#"{"message": "Invalid API key or secret"}"#)
        .create_async()
        .await;
    let verify = server
        .mock("POST", "/kyc/pan/verify")
        .expect(0)
        .create_async()
        .await;

    let store = Arc::new(MemoryOutcomeStore::new());
    let config = common::config_for(&server.url(), &[]);
    let orchestrator = BatchOrchestrator::with_provider(config, store.clone()).unwrap();

    let err = orchestrator
        .run_batch(
            &common::pan_sheet(),
            BatchOptions::default(),
            CancellationSignal::never(),
        )
        .await
        .unwrap_err();

    verify.assert_async().await;
    assert!(err.is_batch_fatal());
    assert!(matches!(err, KycError::Auth { status: Some(403), .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_csv_upload_with_aadhaar_numbers() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/authenticate")
        .with_status(200)
        .with_body(r#"{"access_token": "jwt-top-level"}"#)
        .create_async()
        .await;
    let verify = server
        .mock("POST", "/kyc/aadhaar/verify")
        .match_header("authorization", "jwt-top-level")
        .match_body(Matcher::PartialJson(json!({
            "aadhaar_number": "123456789012",
            "name": "Asha Rao",
            "consent": "Y"
        })))
        .with_status(200)
        .with_body(r#"{"data": {"status": "valid"}}"#)
        .expect(1)
        .create_async()
        .await;

    let csv = b"Aadhaar Number,Full Name\n1234 5678 9012,Asha Rao\n,\n".to_vec();
    let sheet = load_upload("batch.csv", csv, 1024).unwrap();
    let config = common::config_for(&server.url(), &[]);
    let orchestrator =
        BatchOrchestrator::with_provider(config, Arc::new(MemoryOutcomeStore::new())).unwrap();
    let batch_id = Uuid::new_v4();

    let report = orchestrator
        .run_batch(
            &sheet,
            BatchOptions {
                batch_id: Some(batch_id),
                identifier_kind: IdentifierKind::Aadhaar,
            },
            CancellationSignal::never(),
        )
        .await
        .unwrap();

    verify.assert_async().await;
    assert_eq!(report.summary.batch_id, batch_id);
    assert_eq!(report.summary.total_rows, 1);
    assert_eq!(
        report.outcomes[0].outcome.status,
        VerificationStatus::Verified
    );
}

#[tokio::test]
async fn test_missing_columns_reported_before_any_call() {
    let mut server = Server::new_async().await;
    let auth = server
        .mock("POST", "/authenticate")
        .expect(0)
        .create_async()
        .await;

    let csv = b"Customer,DOB\nAsha Rao,1990-03-01\n".to_vec();
    let sheet = load_upload("batch.csv", csv, 1024).unwrap();
    let config = common::config_for(&server.url(), &[]);
    let orchestrator =
        BatchOrchestrator::with_provider(config, Arc::new(MemoryOutcomeStore::new())).unwrap();

    let err = orchestrator
        .run_batch(&sheet, BatchOptions::default(), CancellationSignal::never())
        .await
        .unwrap_err();

    auth.assert_async().await;
    assert_eq!(err.to_string(), "missing_columns: pan_number, name");
}

#[tokio::test]
async fn test_rejection_messages_are_stored_encrypted() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/authenticate")
        .with_status(200)
        .with_body(common::token_body())
        .create_async()
        .await;
    server
        .mock("POST", "/kyc/pan/verify")
        .with_status(422)
        .with_body(r#"{"message": "Name Asha Rao does not match records for PAN ABCDE1234F"}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonLinesOutcomeStore::new(dir.path().join("outcomes.jsonl")));
    let config = common::config_for(&server.url(), &[]);
    let orchestrator = BatchOrchestrator::with_provider(config, store.clone()).unwrap();
    let sheet = kycverify_core::RawSheet::from_rows(vec![
        vec!["PAN", "Name"],
        vec!["ABCDE1234F", "Asha Rao"],
    ]);

    let report = orchestrator
        .run_batch(&sheet, BatchOptions::default(), CancellationSignal::never())
        .await
        .unwrap();
    assert_eq!(
        report.outcomes[0].outcome.status,
        VerificationStatus::Error
    );

    let contents = std::fs::read_to_string(store.path()).unwrap();
    assert!(!contents.contains("ABCDE1234F"));
    assert!(!contents.contains("Asha Rao"));

    let stored = store.read_all().await.unwrap();
    let attempt = &stored[0].1.outcome.attempts[0];
    let message = orchestrator
        .cipher()
        .decrypt(attempt.error_message.as_deref().unwrap())
        .unwrap();
    assert!(message.contains("(422)"));
    assert!(message.contains("ABCDE1234F"));
}
