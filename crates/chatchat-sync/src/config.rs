//! Sync configuration loaded from environment variables.
//!
//! All settings have defaults matching the hosted ChatChat backend, so a
//! client can start with zero configuration.

use chatchat_shared::constants::{DEFAULT_MESSAGE_WINDOW, MAX_ATTACHMENT_SIZE, UNSET_MEDIA_REFERENCE};

/// Sync core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How many of the most recent messages a channel subscription requests.
    /// Env: `CHATCHAT_MESSAGE_WINDOW`
    /// Default: `25`
    pub message_window: usize,

    /// Placeholder `photoURL` meaning "upload not finished".
    /// Env: `CHATCHAT_UNSET_REFERENCE`
    /// Default: `"NOTSET"`
    pub unset_reference: String,

    /// Attachments whose declared size exceeds this are not downloaded.
    /// Env: `CHATCHAT_MAX_ATTACHMENT_BYTES`
    /// Default: 50 MiB
    pub max_attachment_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_window: DEFAULT_MESSAGE_WINDOW,
            unset_reference: UNSET_MEDIA_REFERENCE.to_string(),
            max_attachment_bytes: MAX_ATTACHMENT_SIZE,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("CHATCHAT_MESSAGE_WINDOW") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.message_window = n,
                _ => {
                    tracing::warn!(
                        value = %val,
                        "Invalid CHATCHAT_MESSAGE_WINDOW, using default"
                    );
                }
            }
        }

        if let Some(val) = lookup("CHATCHAT_UNSET_REFERENCE") {
            if !val.is_empty() {
                config.unset_reference = val;
            }
        }

        if let Some(val) = lookup("CHATCHAT_MAX_ATTACHMENT_BYTES") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_attachment_bytes = n;
            } else {
                tracing::warn!(
                    value = %val,
                    "Invalid CHATCHAT_MAX_ATTACHMENT_BYTES, using default"
                );
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.message_window, 25);
        assert_eq!(config.unset_reference, "NOTSET");
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("CHATCHAT_MESSAGE_WINDOW", "50"),
            ("CHATCHAT_UNSET_REFERENCE", "PENDING"),
            ("CHATCHAT_MAX_ATTACHMENT_BYTES", "1024"),
        ]));
        assert_eq!(config.message_window, 50);
        assert_eq!(config.unset_reference, "PENDING");
        assert_eq!(config.max_attachment_bytes, 1024);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("CHATCHAT_MESSAGE_WINDOW", "0"),
            ("CHATCHAT_UNSET_REFERENCE", ""),
            ("CHATCHAT_MAX_ATTACHMENT_BYTES", "lots"),
        ]));
        assert_eq!(config, SyncConfig::default());
    }
}
