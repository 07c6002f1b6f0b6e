//! Process-wide overrides supplied through the environment.

use serde::{Deserialize, Serialize};

/// Comma-separated package prefixes that sandboxes must never acquire.
pub const PACKAGES_TO_NOT_ACQUIRE: &str = "SHADOWBOX_PACKAGES_TO_NOT_ACQUIRE";
/// Regex of class names that must never be intercepted.
pub const CLASSES_TO_NOT_INSTRUMENT_REGEX: &str = "SHADOWBOX_CLASSES_TO_NOT_INSTRUMENT_REGEX";

/// Exclusion overrides applied uniformly to every configuration built in this process.
///
/// Values are kept raw; they are validated when a configuration is built so that a malformed
/// override fails the affected method rather than the whole process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerEnvironment {
    pub packages_to_not_acquire: Vec<String>,
    pub classes_to_not_instrument_regex: Option<String>,
}

impl RunnerEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the environment from an arbitrary lookup, which lets tests avoid touching the real
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let packages_to_not_acquire = lookup(PACKAGES_TO_NOT_ACQUIRE)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|pkg| !pkg.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let classes_to_not_instrument_regex =
            lookup(CLASSES_TO_NOT_INSTRUMENT_REGEX).filter(|regex| !regex.is_empty());
        Self {
            packages_to_not_acquire,
            classes_to_not_instrument_regex,
        }
    }

    /// Entries from `other` are appended; a pattern in `other` replaces this one.
    pub fn merged_with(mut self, other: RunnerEnvironment) -> Self {
        self.packages_to_not_acquire
            .extend(other.packages_to_not_acquire);
        if other.classes_to_not_instrument_regex.is_some() {
            self.classes_to_not_instrument_regex = other.classes_to_not_instrument_regex;
        }
        self
    }
}
