//! Module containing some utility functions that didn't fit anywhere else.

use std::env;
use std::process::Command;

use time::{format_description, OffsetDateTime};

/// Environment variable holding the webhook endpoint for [`notify`].
const NOTIFY_WEBHOOK_VAR: &str = "CIRRUS_NOTIFY_WEBHOOK";

/// Post a message to the webhook configured via `CIRRUS_NOTIFY_WEBHOOK`.
///
/// Used to page whoever is running long measurement campaigns when something
/// goes wrong that leaves billable resources behind. Does nothing (apart from
/// a log line) if the variable is unset.
pub fn notify(message: impl AsRef<str>) {
    let Ok(endpoint) = env::var(NOTIFY_WEBHOOK_VAR) else {
        log::debug!(
            "{NOTIFY_WEBHOOK_VAR} is not set, dropping notification: {}",
            message.as_ref()
        );
        return;
    };

    let _ = Command::new("curl")
        .args([
            "-X",
            "POST",
            &endpoint,
            "--data",
            &format!("payload={{\"text\": \"{}\"}}", message.as_ref()),
        ])
        .output();
}

/// Produces a timestamp `String` of the current time in YYYY-MM-DD_HH-mm-SS format.
pub fn get_timestamp() -> String {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(
            &format_description::parse("[year]-[month]-[day]_[hour]-[minute]-[second]").unwrap(),
        )
        .unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamp_is_filename_safe() {
        let ts = get_timestamp();
        assert_eq!(ts.len(), "2024-01-01_00-00-00".len());
        assert!(ts.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '_'));
    }
}
