//! Channel identifier and settings validation

use crate::engine::{MAX_BACKOFF, MAX_DELAY_SECS};
use crate::error::RelayError;
use relayman_types::{AuthMethod, RateLimitProfile, Settings};

/// Check a channel identifier and return its trimmed form.
///
/// Accepts `@username` (letters, digits and underscores, at least two after
/// the `@`) or a non-zero numeric id such as `-1001234567890`.
pub fn validate_channel_identifier(identifier: &str) -> Result<String, RelayError> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(RelayError::InvalidChannel(
            "Channel identifier cannot be empty".to_string(),
        ));
    }

    if let Some(name) = identifier.strip_prefix('@') {
        if name.len() < 2 {
            return Err(RelayError::InvalidChannel(format!(
                "Invalid channel username: {}",
                identifier
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RelayError::InvalidChannel(format!(
                "Channel username may only contain letters, digits and underscores: {}",
                identifier
            )));
        }
        return Ok(identifier.to_string());
    }

    match identifier.parse::<i64>() {
        Ok(0) => Err(RelayError::InvalidChannel("Invalid channel ID: 0".to_string())),
        Ok(_) => Ok(identifier.to_string()),
        Err(_) => Err(RelayError::InvalidChannel(format!(
            "Channel must be username (@channel) or numeric ID: {}",
            identifier
        ))),
    }
}

/// Validate both ends of a task; they must not be the same channel
pub fn validate_channel_pair(source: &str, dest: &str) -> Result<(String, String), RelayError> {
    let source = validate_channel_identifier(source)?;
    let dest = validate_channel_identifier(dest)?;

    if source.eq_ignore_ascii_case(&dest) {
        return Err(RelayError::InvalidChannel(
            "Source and destination must be different channels".to_string(),
        ));
    }

    Ok((source, dest))
}

/// Check that settings are within the ranges the engine can honor
pub fn validate_settings(settings: &Settings) -> Result<(), RelayError> {
    let invalid = |message: String| Err(RelayError::InvalidSettings(message));

    if settings.max_retries == 0 {
        return invalid("max_retries must be at least 1".to_string());
    }
    if settings.checkpoint_batch == 0 {
        return invalid("checkpoint_batch must be at least 1".to_string());
    }
    let max_secs = MAX_DELAY_SECS as u64;
    if !(1..=max_secs).contains(&settings.live_poll_interval_secs) {
        return invalid(format!("live_poll_interval_secs must be within 1..={}", max_secs));
    }
    if settings.status_refresh_secs > max_secs {
        return invalid(format!("status_refresh_secs must be at most {}", max_secs));
    }
    if !(1..=MAX_BACKOFF.as_secs()).contains(&settings.max_backoff_secs) {
        return invalid(format!(
            "max_backoff_secs must be within 1..={}",
            MAX_BACKOFF.as_secs()
        ));
    }

    for auth in AuthMethod::ALL {
        validate_profile(settings.profile(auth))
            .map_err(|message| RelayError::InvalidSettings(format!("{}.{}", auth, message)))?;
    }
    Ok(())
}

fn validate_profile(profile: &RateLimitProfile) -> Result<(), String> {
    for (name, value) in [
        ("base_delay", profile.base_delay),
        ("min_delay", profile.min_delay),
        ("max_delay", profile.max_delay),
        ("batch_cooldown", profile.batch_cooldown),
    ] {
        if !(0.0..=MAX_DELAY_SECS).contains(&value) {
            return Err(format!("{} must be within 0..={} seconds", name, MAX_DELAY_SECS));
        }
    }
    if profile.min_delay > profile.max_delay {
        return Err("min_delay must not exceed max_delay".to_string());
    }
    if profile.max_forwards_per_minute == 0 {
        return Err("max_forwards_per_minute must be at least 1".to_string());
    }
    if !(1.0..=100.0).contains(&profile.backoff_multiplier) {
        return Err("backoff_multiplier must be within 1..=100".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_usernames_and_ids() {
        assert_eq!(validate_channel_identifier(" @news_feed ").unwrap(), "@news_feed");
        assert_eq!(validate_channel_identifier("@ab").unwrap(), "@ab");
        assert_eq!(
            validate_channel_identifier("-1001234567890").unwrap(),
            "-1001234567890"
        );
        assert!(validate_channel_identifier("12345").is_ok());
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        for bad in ["", "   ", "@", "@a", "@bad-name", "news", "0", "-12x"] {
            assert!(
                matches!(validate_channel_identifier(bad), Err(RelayError::InvalidChannel(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_pair_must_differ() {
        assert!(validate_channel_pair("@source", "@dest").is_ok());
        assert!(matches!(
            validate_channel_pair("@Same", "@same"),
            Err(RelayError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(validate_settings(&Settings::default()).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_settings() {
        let mut huge_cooldown = Settings::default();
        huge_cooldown.user_account.batch_cooldown = 1e300;
        let mut nan_delay = Settings::default();
        nan_delay.bot_account.base_delay = f64::NAN;
        let mut inverted = Settings::default();
        inverted.bot_account.min_delay = 2.0;
        inverted.bot_account.max_delay = 1.0;
        let mut long_backoff = Settings::default();
        long_backoff.max_backoff_secs = 301;
        let mut no_retries = Settings::default();
        no_retries.max_retries = 0;

        for settings in [huge_cooldown, nan_delay, inverted, long_backoff, no_retries] {
            assert!(matches!(
                validate_settings(&settings),
                Err(RelayError::InvalidSettings(_))
            ));
        }
    }
}
