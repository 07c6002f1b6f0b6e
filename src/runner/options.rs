//! Runner options: YAML file, then `SHADOWBOX_*` environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_SANDBOXES;
use crate::config::RunnerEnvironment;
use crate::diagnostics::{ConfigurationError, Fault};
use crate::registry::{PickerContext, DEFAULT_PLATFORM_LEVEL};

pub const MAX_SANDBOXES: &str = "SHADOWBOX_MAX_SANDBOXES";
pub const PLATFORM_LEVEL: &str = "SHADOWBOX_PLATFORM_LEVEL";
pub const PERF_STATS: &str = "SHADOWBOX_PERF_STATS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Upper bound on live sandboxes kept by the runner's cache.
    pub max_sandboxes: usize,
    /// Platform level handed to substitute pickers.
    pub platform_level: u32,
    /// Extra signals handed to substitute pickers.
    pub signals: BTreeMap<String, String>,
    pub environment: RunnerEnvironment,
    /// File that receives one JSON line of performance stats per method.
    pub perf_stats: Option<PathBuf>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_sandboxes: DEFAULT_MAX_SANDBOXES,
            platform_level: DEFAULT_PLATFORM_LEVEL,
            signals: BTreeMap::new(),
            environment: RunnerEnvironment::default(),
            perf_stats: None,
        }
    }
}

impl RunnerOptions {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigurationError::MalformedOption {
            option: "options file".into(),
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, Fault> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&text)?)
    }

    /// Applies the process environment on top of these options.
    pub fn with_env_overrides(self) -> Result<Self, ConfigurationError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        if let Some(raw) = lookup(MAX_SANDBOXES) {
            self.max_sandboxes = parse_option(MAX_SANDBOXES, &raw)?;
        }
        if let Some(raw) = lookup(PLATFORM_LEVEL) {
            self.platform_level = parse_option(PLATFORM_LEVEL, &raw)?;
        }
        if let Some(raw) = lookup(PERF_STATS).filter(|raw| !raw.is_empty()) {
            self.perf_stats = Some(PathBuf::from(raw));
        }
        self.environment = self
            .environment
            .merged_with(RunnerEnvironment::from_lookup(lookup));
        Ok(self)
    }

    pub fn picker_context(&self) -> PickerContext {
        let mut ctx = PickerContext::at_level(self.platform_level);
        ctx.signals.extend(self.signals.clone());
        ctx
    }
}

fn parse_option<T>(option: &str, raw: &str) -> Result<T, ConfigurationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigurationError::MalformedOption {
            option: option.to_string(),
            reason: format!("{raw:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::environment::PACKAGES_TO_NOT_ACQUIRE;

    #[test]
    fn test_yaml_defaults_and_fields() {
        let options = RunnerOptions::from_yaml_str(
            "max_sandboxes: 2\nsignals:\n  variant: Tablet\nenvironment:\n  packages_to_not_acquire: [vendor.]\n",
        )
        .unwrap();
        assert_eq!(options.max_sandboxes, 2);
        assert_eq!(options.platform_level, DEFAULT_PLATFORM_LEVEL);
        assert_eq!(options.environment.packages_to_not_acquire, vec!["vendor."]);

        let ctx = options.picker_context();
        assert_eq!(ctx.signals.get("variant").map(String::as_str), Some("Tablet"));
    }

    #[test]
    fn test_env_overrides() {
        let env = |key: &str| match key {
            MAX_SANDBOXES => Some("3".to_string()),
            PLATFORM_LEVEL => Some("28".to_string()),
            PACKAGES_TO_NOT_ACQUIRE => Some("lib.".to_string()),
            _ => None,
        };
        let options = RunnerOptions::default().with_overrides_from(env).unwrap();
        assert_eq!(options.max_sandboxes, 3);
        assert_eq!(options.platform_level, 28);
        assert_eq!(options.environment.packages_to_not_acquire, vec!["lib."]);
    }

    #[test]
    fn test_malformed_override_is_reported() {
        let env = |key: &str| (key == MAX_SANDBOXES).then(|| "many".to_string());
        let err = RunnerOptions::default().with_overrides_from(env).unwrap_err();
        assert!(matches!(err, ConfigurationError::MalformedOption { option, .. } if option == MAX_SANDBOXES));
    }
}
