use serde_json::Value;

const REDACTED_FIELDS: [&str; 4] = ["image", "data", "content", "image_data"];

/// Produces a redacted clone of `body` suitable for the access log. Does
/// not touch the value actually forwarded upstream.
pub fn redact_for_log(body: &Value) -> Value {
    let mut clone = body.clone();
    redact_in_place(&mut clone);
    clone
}

fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if REDACTED_FIELDS.contains(&key.as_str()) {
                    if let Value::String(s) = v {
                        if looks_like_image_payload(s) {
                            *v = Value::String(redacted_placeholder(s));
                            continue;
                        }
                    }
                }
                redact_in_place(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_in_place(item);
            }
        }
        _ => {}
    }
}

fn looks_like_image_payload(s: &str) -> bool {
    if s.len() <= 100 {
        return false;
    }
    s.starts_with("data:") || is_long_base64_run(s)
}

fn is_long_base64_run(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}

fn redacted_placeholder(s: &str) -> String {
    let prefix: String = s.chars().take(32).collect();
    format!("[BASE64_IMAGE_REDACTED: prefix={prefix}...]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_data_url_image_field() {
        let long_b64 = "A".repeat(200);
        let body = json!({"image": format!("data:image/png;base64,{long_b64}")});
        let redacted = redact_for_log(&body);
        let value = redacted["image"].as_str().unwrap();
        assert!(value.starts_with("[BASE64_IMAGE_REDACTED: prefix="));
        let after_prefix = &value["[BASE64_IMAGE_REDACTED: prefix=".len()..];
        let base64_part = after_prefix.trim_end_matches("...]");
        assert_eq!(base64_part.len(), 32);
    }

    #[test]
    fn short_strings_are_left_alone() {
        let body = json!({"content": "hello"});
        let redacted = redact_for_log(&body);
        assert_eq!(redacted["content"], "hello");
    }

    #[test]
    fn nested_fields_are_redacted() {
        let long_b64 = "A".repeat(150);
        let body = json!({"messages": [{"content": long_b64}]});
        let redacted = redact_for_log(&body);
        let value = redacted["messages"][0]["content"].as_str().unwrap();
        assert!(value.starts_with("[BASE64_IMAGE_REDACTED"));
    }
}
