//! Provider wire formats and the adapters that normalize them.

use serde::Serialize;
use serde_json::Value;

use crate::outcome::VerificationStatus;
use crate::record::IdentifierKind;

pub(crate) const PAN_VERIFY_PATH: &str = "/kyc/pan/verify";
pub(crate) const AADHAAR_VERIFY_PATH: &str = "/kyc/aadhaar/verify";
pub(crate) const AUTHENTICATE_PATH: &str = "/authenticate";

const CONSENT: &str = "Y";

/// PAN verification request body.
#[derive(Debug, Serialize)]
pub(crate) struct PanVerifyRequest<'a> {
    #[serde(rename = "@entity")]
    pub entity: &'static str,
    pub pan: &'a str,
    pub name_as_per_pan: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<&'a str>,
    pub consent: &'static str,
    pub reason: &'a str,
}

/// Aadhaar verification request body.
#[derive(Debug, Serialize)]
pub(crate) struct AadhaarVerifyRequest<'a> {
    #[serde(rename = "@entity")]
    pub entity: &'static str,
    pub aadhaar_number: &'a str,
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<&'a str>,
    pub consent: &'static str,
    pub reason: &'a str,
}

/// Builds the JSON body for a verification call.
pub(crate) fn verify_request_body(
    kind: IdentifierKind,
    identifier: &str,
    name: &str,
    date_of_birth: Option<&str>,
    reason: &str,
) -> Result<Value, serde_json::Error> {
    match kind {
        IdentifierKind::Pan => serde_json::to_value(PanVerifyRequest {
            entity: "in.co.sandbox.kyc.pan_verification.request",
            pan: identifier,
            name_as_per_pan: name,
            date_of_birth,
            consent: CONSENT,
            reason,
        }),
        IdentifierKind::Aadhaar => serde_json::to_value(AadhaarVerifyRequest {
            entity: "in.co.sandbox.kyc.aadhaar_verification.request",
            aadhaar_number: identifier,
            name,
            date_of_birth,
            consent: CONSENT,
            reason,
        }),
    }
}

pub(crate) const fn verify_path(kind: IdentifierKind) -> &'static str {
    match kind {
        IdentifierKind::Pan => PAN_VERIFY_PATH,
        IdentifierKind::Aadhaar => AADHAAR_VERIFY_PATH,
    }
}

/// Token fields pulled out of an authentication response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenGrant {
    pub access_token: String,
    pub expires_in: Option<u64>,
}

/// Extracts the access token from either of the shapes the provider returns:
/// `{"access_token": ..}` or `{"data": {"access_token": ..}}`.
pub(crate) fn extract_token_grant(body: &Value) -> Option<TokenGrant> {
    let scopes = [Some(body), body.get("data")];
    scopes.into_iter().flatten().find_map(|scope| {
        let access_token = scope
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|token| !token.is_empty())?;
        let expires_in = scope.get("expires_in").and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        });
        Some(TokenGrant {
            access_token: access_token.to_string(),
            expires_in,
        })
    })
}

/// Pulls a human readable message out of an error body.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "error", "detail"]
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Maps provider response flags onto a verdict.
///
/// `dob_sent` tells whether a date of birth was part of the request; a
/// missing DOB match flag only counts against the record when one was sent.
pub(crate) fn classify_verdict(body: &Value, dob_sent: bool) -> VerificationStatus {
    let data = body.get("data").unwrap_or(body);
    let status = data
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    match status.as_deref() {
        Some("valid" | "active" | "verified" | "success") => {
            let name_match = match_flag(data, &["name_as_per_pan_match", "name_match"]);
            let dob_match = match_flag(data, &["date_of_birth_match", "dob_match"]);
            let mismatched = name_match == Some(false) || (dob_sent && dob_match == Some(false));
            if mismatched {
                VerificationStatus::Mismatched
            } else {
                VerificationStatus::Verified
            }
        }
        Some("invalid" | "not_found" | "not found" | "inactive" | "deactivated" | "fake") => {
            VerificationStatus::Invalid
        }
        _ => VerificationStatus::Pending,
    }
}

fn match_flag(data: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| {
        let value = data.get(*key)?;
        value.as_bool().or_else(|| match value.as_str()? {
            "Y" | "y" | "true" | "yes" => Some(true),
            "N" | "n" | "false" | "no" => Some(false),
            _ => None,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_token_top_level() {
        let grant = extract_token_grant(&json!({"access_token": "tok", "expires_in": 600})).unwrap();
        assert_eq!(grant.access_token, "tok");
        assert_eq!(grant.expires_in, Some(600));
    }

    #[test]
    fn test_token_nested_under_data() {
        let grant =
            extract_token_grant(&json!({"code": 200, "data": {"access_token": "nested"}})).unwrap();
        assert_eq!(grant.access_token, "nested");
        assert_eq!(grant.expires_in, None);
    }

    #[test]
    fn test_token_missing_or_empty() {
        assert!(extract_token_grant(&json!({"data": {}})).is_none());
        assert!(extract_token_grant(&json!({"access_token": "  "})).is_none());
        assert!(extract_token_grant(&json!("just a string")).is_none());
    }

    #[test]
    fn test_pan_request_body() {
        let body = verify_request_body(
            IdentifierKind::Pan,
            "ABCDE1234F",
            "Asha Rao",
            Some("01/03/1990"),
            "onboarding",
        )
        .unwrap();
        assert_eq!(
            body,
            json!({
                "@entity": "in.co.sandbox.kyc.pan_verification.request",
                "pan": "ABCDE1234F",
                "name_as_per_pan": "Asha Rao",
                "date_of_birth": "01/03/1990",
                "consent": "Y",
                "reason": "onboarding"
            })
        );
    }

    #[test]
    fn test_aadhaar_request_body_omits_missing_dob() {
        let body =
            verify_request_body(IdentifierKind::Aadhaar, "123412341234", "Asha Rao", None, "kyc")
                .unwrap();
        assert_eq!(body["aadhaar_number"], "123412341234");
        assert!(body.get("date_of_birth").is_none());
    }

    #[test_case(json!({"data": {"status": "valid", "name_as_per_pan_match": true, "date_of_birth_match": true}}), true, VerificationStatus::Verified ; "all match")]
    #[test_case(json!({"data": {"status": "valid", "name_as_per_pan_match": false, "date_of_birth_match": true}}), true, VerificationStatus::Mismatched ; "name mismatch")]
    #[test_case(json!({"data": {"status": "valid", "name_as_per_pan_match": true, "date_of_birth_match": false}}), true, VerificationStatus::Mismatched ; "dob mismatch")]
    #[test_case(json!({"data": {"status": "valid", "name_as_per_pan_match": true, "date_of_birth_match": false}}), false, VerificationStatus::Verified ; "dob not sent")]
    #[test_case(json!({"data": {"status": "invalid"}}), true, VerificationStatus::Invalid ; "invalid pan")]
    #[test_case(json!({"status": "VALID", "name_match": "Y"}), false, VerificationStatus::Verified ; "flat shape")]
    #[test_case(json!({"data": {}}), true, VerificationStatus::Pending ; "no status")]
    fn test_classify_verdict(body: Value, dob_sent: bool, expected: VerificationStatus) {
        assert_eq!(classify_verdict(&body, dob_sent), expected);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(r#"{"message": "Invalid PAN"}"#), "Invalid PAN");
        assert_eq!(error_message("  gateway down "), "gateway down");
    }
}
