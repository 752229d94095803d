//! Short-lived confirmation tokens for destructive commands (spec §6.4:
//! `retry-failed` and `purge-failed` "require a short-lived confirmation
//! token (timestamp-bound)"). Modeled after `mqk-cli`'s `ARM LIVE` manual
//! confirmation gate, but timestamp-bound instead of a fixed phrase, since
//! there's no `/arming/confirmation_format` config here to read a static
//! expected string from — the token itself must expire.

use crate::error::CliError;
use chrono::{DateTime, Utc};

/// Tokens are valid for the minute they were generated in, plus the one
/// before it — generous enough to paste into a terminal, narrow enough that
/// a token copied from a shell history months ago is useless.
fn minute_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp() / 60
}

pub fn expected_token(action: &str, now: DateTime<Utc>) -> String {
    format!("{action}-{}", minute_bucket(now))
}

pub fn require(action: &str, confirm: Option<&str>, now: DateTime<Utc>) -> Result<(), CliError> {
    let expected_current = expected_token(action, now);
    let expected_previous = format!("{action}-{}", minute_bucket(now) - 1);

    let Some(confirm) = confirm.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(CliError::Validation(format!(
            "this is a destructive operation and requires --confirm \"{expected_current}\""
        )));
    };

    if confirm == expected_current || confirm == expected_previous {
        Ok(())
    } else {
        Err(CliError::Validation(format!(
            "confirmation token expired or incorrect; expected --confirm \"{expected_current}\""
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    #[test]
    fn missing_token_is_validation_failure() {
        let err = require("purge-failed", None, t(0)).unwrap_err();
        assert!(matches!(err, CliError::Validation(_)));
    }

    #[test]
    fn current_minute_token_is_accepted() {
        let now = t(125);
        let token = expected_token("purge-failed", now);
        assert!(require("purge-failed", Some(&token), now).is_ok());
    }

    #[test]
    fn previous_minute_token_is_still_accepted() {
        let now = t(125);
        let token = expected_token("purge-failed", t(65));
        assert!(require("purge-failed", Some(&token), now).is_ok());
    }

    #[test]
    fn two_minutes_stale_token_is_rejected() {
        let now = t(185);
        let token = expected_token("purge-failed", t(0));
        let err = require("purge-failed", Some(&token), now).unwrap_err();
        assert!(matches!(err, CliError::Validation(_)));
    }

    #[test]
    fn token_for_a_different_action_is_rejected() {
        let now = t(0);
        let token = expected_token("retry-failed", now);
        let err = require("purge-failed", Some(&token), now).unwrap_err();
        assert!(matches!(err, CliError::Validation(_)));
    }
}
