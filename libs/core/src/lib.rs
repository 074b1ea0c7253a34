//! UCM core contracts and value types.
//!
//! This crate exposes the shared data structures exchanged between the
//! webhook gateway, the channel connectors, and the outbound dispatcher,
//! plus the narrow interfaces to external collaborators (token store,
//! connection table, conversation store, event bus) and the account router.

pub mod connection;
pub mod error;
pub mod router;
pub mod store;
pub mod types;

pub use connection::*;
pub use error::*;
pub use router::*;
pub use store::*;
pub use types::*;

/// Current time formatted as RFC3339, the timestamp format used on every
/// unified message.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

/// Converts a unix-seconds string (the shape Meta webhooks carry) to RFC3339,
/// falling back to the current time on garbage input.
pub fn unix_str_to_rfc3339(raw: &str) -> String {
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| time::OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(time::OffsetDateTime::now_utc)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_str_conversion_handles_valid_and_garbage_input() {
        assert_eq!(unix_str_to_rfc3339("1700000000"), "2023-11-14T22:13:20Z");
        // Garbage falls back to "now"; only check it parses as RFC3339.
        let fallback = unix_str_to_rfc3339("not-a-number");
        assert!(
            time::OffsetDateTime::parse(
                &fallback,
                &time::format_description::well_known::Rfc3339
            )
            .is_ok()
        );
    }
}
