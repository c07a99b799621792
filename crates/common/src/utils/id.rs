use uuid::Uuid;

/// Generate a request correlation id, also used as the `snyk-request-id` header value
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate the id of an out-of-band streamed response
pub fn generate_streaming_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate the per-process broker client id
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_uuids() {
        for id in [
            generate_request_id(),
            generate_streaming_id(),
            generate_client_id(),
        ] {
            assert_eq!(id.len(), 36);
            assert!(Uuid::parse_str(&id).is_ok());
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| generate_request_id()).collect();
        assert_eq!(ids.len(), 100);
    }
}
