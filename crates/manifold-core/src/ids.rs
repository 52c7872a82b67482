//! Request identifier generation.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a correlation id of the form `<epoch_ms>_<8 hex>`.
///
/// The millisecond prefix keeps ids roughly sortable in logs while the random
/// suffix makes collisions across concurrent requests implausible. The same
/// format is used for JSON-RPC request ids and for `X-Request-ID` headers on
/// OAuth token requests.
#[must_use]
pub fn generate_request_id() -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{epoch_ms}_{:08x}", fastrand::u32(..))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        let (millis, suffix) = id.split_once('_').expect("separator present");
        assert_eq!(millis.len(), 13, "epoch millis are 13 digits in this era");
        assert!(millis.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
