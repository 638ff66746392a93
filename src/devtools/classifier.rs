// =============================================================================
// Response Classifier — parse a DevTools `Runtime.evaluate` result envelope
// =============================================================================

use serde_json::Value;

use crate::error::FleetError;

/// Classification of a successfully-received (not transport-failed) DevTools
/// response envelope.
pub enum Classified {
    Ok(Value),
    Error(FleetError),
}

/// Parse the `{exceptionDetails?, result?}` envelope DevTools returns for
/// `Runtime.evaluate`, applying the rules from spec §4.1.
///
/// `expected_type` is an optional caller-declared JS `typeof` string (e.g.
/// `"number"`, `"object"`) checked against `result.type` when present.
pub fn classify(tab: &str, envelope: &Value, expected_type: Option<&str>) -> Classified {
    let Some(obj) = envelope.as_object() else {
        return Classified::Error(FleetError::Malformed {
            tab: tab.to_string(),
            reason: "envelope is not a JSON object".to_string(),
        });
    };

    if let Some(exc) = obj.get("exceptionDetails") {
        let text = exc
            .get("exception")
            .and_then(|e| e.get("description"))
            .and_then(|d| d.as_str())
            .or_else(|| exc.get("text").and_then(|t| t.as_str()))
            .unwrap_or("unknown exception")
            .to_string();
        return Classified::Error(FleetError::JavaScript {
            tab: tab.to_string(),
            message: text,
        });
    }

    let Some(result) = obj.get("result") else {
        return Classified::Error(FleetError::Malformed {
            tab: tab.to_string(),
            reason: "envelope missing 'result' field".to_string(),
        });
    };

    let result_type = result.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let subtype = result.get("subtype").and_then(|t| t.as_str());

    if result_type == "object" && subtype == Some("error") {
        let description = result
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("unknown JavaScript error")
            .to_string();
        return Classified::Error(FleetError::JavaScript {
            tab: tab.to_string(),
            message: description,
        });
    }

    if result_type == "undefined" {
        return Classified::Error(FleetError::UndefinedResult {
            tab: tab.to_string(),
        });
    }

    if let Some(expected) = expected_type {
        if result_type != expected {
            return Classified::Error(FleetError::TypeMismatch {
                tab: tab.to_string(),
                expected: expected.to_string(),
                actual: result_type.to_string(),
            });
        }
    }

    Classified::Ok(result.get("value").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_envelope_rejected() {
        let envelope = json!("not an object");
        match classify("t1", &envelope, None) {
            Classified::Error(FleetError::Malformed { .. }) => {}
            _ => panic!("expected malformed error"),
        }
    }

    #[test]
    fn exception_details_yields_javascript_error() {
        let envelope = json!({
            "exceptionDetails": { "text": "Uncaught ReferenceError: x is not defined" }
        });
        match classify("t1", &envelope, None) {
            Classified::Error(FleetError::JavaScript { message, .. }) => {
                assert!(message.contains("ReferenceError"));
            }
            _ => panic!("expected javascript error"),
        }
    }

    #[test]
    fn object_error_subtype_yields_javascript_error() {
        let envelope = json!({
            "result": { "type": "object", "subtype": "error", "description": "Error: boom" }
        });
        match classify("t1", &envelope, None) {
            Classified::Error(FleetError::JavaScript { message, .. }) => {
                assert_eq!(message, "Error: boom");
            }
            _ => panic!("expected javascript error"),
        }
    }

    #[test]
    fn undefined_result_is_non_retryable_error() {
        let envelope = json!({ "result": { "type": "undefined" } });
        match classify("t1", &envelope, None) {
            Classified::Error(FleetError::UndefinedResult { .. }) => {}
            _ => panic!("expected undefined result error"),
        }
    }

    #[test]
    fn type_mismatch_detected() {
        let envelope = json!({ "result": { "type": "string", "value": "hi" } });
        match classify("t1", &envelope, Some("number")) {
            Classified::Error(FleetError::TypeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, "number");
                assert_eq!(actual, "string");
            }
            _ => panic!("expected type mismatch"),
        }
    }

    #[test]
    fn successful_value_extracted() {
        let envelope = json!({ "result": { "type": "number", "value": 42 } });
        match classify("t1", &envelope, Some("number")) {
            Classified::Ok(v) => assert_eq!(v, json!(42)),
            Classified::Error(_) => panic!("expected success"),
        }
    }
}
