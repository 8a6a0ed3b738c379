//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use kycverify_core::{KycConfig, RawSheet};

pub const API_KEY: &str = "key_test_123";
pub const API_SECRET: &str = "secret_test_456";
pub const CIPHER_PASSPHRASE: &str = "integration test passphrase";

/// Configuration pointing at a mock provider, with fast retries.
pub fn config_for(base_url: &str, overrides: &[(&str, &str)]) -> Arc<KycConfig> {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("KYC_PROVIDER_BASE_URL".to_string(), base_url.to_string()),
        ("KYC_API_KEY".to_string(), API_KEY.to_string()),
        ("KYC_API_SECRET".to_string(), API_SECRET.to_string()),
        ("KYC_FIELD_CIPHER_KEY".to_string(), CIPHER_PASSPHRASE.to_string()),
        ("KYC_RETRY_BASE_DELAY_MS".to_string(), "1".to_string()),
        ("KYC_RETRY_MAX_DELAY_MS".to_string(), "5".to_string()),
        ("KYC_REQUEST_TIMEOUT_SECS".to_string(), "5".to_string()),
    ]);
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }
    Arc::new(KycConfig::from_lookup(|key| vars.get(key).cloned()).expect("valid test config"))
}

/// A PAN sheet in the shape operators usually upload.
pub fn pan_sheet() -> RawSheet {
    RawSheet::from_rows(vec![
        vec!["PAN No", "Name", "DOB", "Purpose"],
        vec!["abcde1234f", "Asha Rao", "1990-03-01", "loan onboarding"],
        vec!["", "Ravi Kumar", "1985-07-12", ""],
        vec!["PQRSX6789K", "Meera Shah", "12/11/1978", ""],
    ])
}

pub fn token_body() -> String {
    r#"{"code": 200, "data": {"access_token": "jwt-abc", "expires_in": 86400}}"#.to_string()
}

pub fn verified_body() -> String {
    r#"{"code": 200, "data": {"status": "valid", "name_as_per_pan_match": true, "date_of_birth_match": true}}"#
        .to_string()
}
