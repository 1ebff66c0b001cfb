use http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyClass {
    Json,
    Multipart,
}

/// Non-POST requests and anything whose `Content-Type` isn't multipart
/// always take the JSON path; only a POST to an `/audio/` endpoint with a
/// `multipart/form-data` content type is routed to the multipart path.
/// `stream: true` on a JSON body routes further to the streaming path once
/// the body has been parsed -- that decision happens after this one.
pub fn classify_body(method: &Method, content_type: Option<&str>, path: &str) -> BodyClass {
    if method != Method::POST {
        return BodyClass::Json;
    }
    let content_type = content_type.unwrap_or("");
    if path.contains("/audio/") && content_type.starts_with("multipart/form-data") {
        return BodyClass::Multipart;
    }
    BodyClass::Json
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_post_is_always_json() {
        assert_eq!(
            classify_body(&Method::GET, Some("multipart/form-data"), "/v1/audio/x"),
            BodyClass::Json
        );
    }

    #[test]
    fn audio_multipart_post_is_multipart() {
        assert_eq!(
            classify_body(
                &Method::POST,
                Some("multipart/form-data; boundary=x"),
                "/v1/audio/transcriptions"
            ),
            BodyClass::Multipart
        );
    }

    #[test]
    fn non_audio_multipart_falls_back_to_json() {
        assert_eq!(
            classify_body(&Method::POST, Some("multipart/form-data"), "/v1/chat/completions"),
            BodyClass::Json
        );
    }
}
