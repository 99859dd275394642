pub trait Sanitize {
    fn sanitize(&self) -> Self;
}

impl Sanitize for http::HeaderMap {
    fn sanitize(&self) -> Self {
        let mut sanitized = self.clone();
        for header in ["Authorization", "X-Trino-Password"] {
            if let Some(value) = sanitized.get_mut(header) {
                *value = http::HeaderValue::from_static("<redacted>");
            }
        }
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, HeaderValue};

    use super::*;

    #[test]
    fn test_sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert("X-Trino-Password", HeaderValue::from_static("hunter2"));
        headers.insert("X-Trino-User", HeaderValue::from_static("will"));

        let sanitized = headers.sanitize();
        assert_eq!(sanitized.get("Authorization").unwrap(), "<redacted>");
        assert_eq!(sanitized.get("X-Trino-Password").unwrap(), "<redacted>");
        assert_eq!(sanitized.get("X-Trino-User").unwrap(), "will");
    }
}
