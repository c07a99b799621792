use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value;

/// Encode bytes to Base64 string
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode Base64 string to bytes
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// Re-encode a JSON object as `application/x-www-form-urlencoded`
///
/// Arrays become repeated keys, nested objects and nulls become empty values.
/// Returns `None` when the input is not a JSON object.
pub fn json_to_form(body: &str) -> Option<String> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
        return None;
    };

    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &map {
        match value {
            Value::Array(items) => {
                for item in items {
                    form.append_pair(key, &form_scalar(item));
                }
            }
            other => {
                form.append_pair(key, &form_scalar(other));
            }
        }
    }
    Some(form.finish())
}

fn form_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_binary_body() {
        let binary = vec![0x00, 0x01, 0x02, 0xFF, 0xFE];
        let encoded = encode_body(&binary);
        assert_eq!(encoded, "AAEC//4=");
        assert_eq!(decode_body(&encoded).unwrap(), binary);
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(decode_body("not valid base64!!!").is_err());
    }

    #[test]
    fn test_json_to_form() {
        let form = json_to_form(r#"{"grant_type":"client_credentials","scope":"a b","n":3}"#)
            .unwrap();
        assert!(form.contains("grant_type=client_credentials"));
        assert!(form.contains("scope=a+b"));
        assert!(form.contains("n=3"));
    }

    #[test]
    fn test_json_to_form_arrays_repeat() {
        let form = json_to_form(r#"{"id":[1,2]}"#).unwrap();
        assert_eq!(form, "id=1&id=2");
    }

    #[test]
    fn test_json_to_form_rejects_non_objects() {
        assert!(json_to_form("[1,2]").is_none());
        assert!(json_to_form("plain text").is_none());
    }
}
