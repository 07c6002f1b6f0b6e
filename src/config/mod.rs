//! # Sandbox Configuration
//!
//! A [`Configuration`] describes which classes a sandbox must intercept, which it must leave to
//! the host, and which extra substitutes apply. It is an immutable value with structural
//! equality and is the key under which sandboxes are cached.
//!
//! Configurations are computed once per test method from three inputs:
//!
//! 1. the class-level and method-level [`SandboxConfig`] declarations,
//! 2. the packages provided by the discovered substitute providers,
//! 3. the process-wide [`RunnerEnvironment`] overrides.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classes::{hex_digest, ClassName, ClassSource};
use crate::diagnostics::ConfigurationError;

pub mod environment;

pub use environment::RunnerEnvironment;

static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)*\.?$")
        // Constant pattern; compiling it cannot fail.
        .expect("package name pattern is valid")
});

/// Per-class or per-method sandbox declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Extra package prefixes whose call sites are intercepted.
    pub instrumented_packages: Vec<String>,
    /// Extra substitute classes to install for this test.
    pub substitutes: Vec<ClassName>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instrument_package(mut self, package: impl Into<String>) -> Self {
        self.instrumented_packages.push(package.into());
        self
    }

    pub fn substitute(mut self, class: impl Into<ClassName>) -> Self {
        self.substitutes.push(class.into());
        self
    }
}

/// A compiled class-name exclusion pattern, compared by its source text.
#[derive(Clone)]
pub struct ExclusionPattern(Regex);

impl ExclusionPattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigurationError> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|e| ConfigurationError::MalformedPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whole-name match.
    pub fn matches(&self, name: &ClassName) -> bool {
        self.0
            .find(name.as_str())
            .is_some_and(|m| m.start() == 0 && m.end() == name.as_str().len())
    }
}

impl fmt::Debug for ExclusionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExclusionPattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for ExclusionPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ExclusionPattern {}

impl Hash for ExclusionPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

/// Immutable interception description for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Configuration {
    instrumented_packages: BTreeSet<String>,
    excluded_packages: BTreeSet<String>,
    exclusion_pattern: Option<ExclusionPattern>,
    instrumented_classes: BTreeSet<ClassName>,
    extra_substitutes: Vec<ClassName>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Computes the configuration of one test method.
    ///
    /// Method-level declarations add to class-level ones. Every extra substitute must be found in
    /// `source` and must declare the class it replaces; that class becomes explicitly
    /// intercepted.
    pub fn build(
        class_decl: Option<&SandboxConfig>,
        method_decl: Option<&SandboxConfig>,
        environment: &RunnerEnvironment,
        base_packages: &[String],
        source: &dyn ClassSource,
    ) -> Result<Configuration, ConfigurationError> {
        let mut builder = Configuration::builder();

        for package in &environment.packages_to_not_acquire {
            builder = builder.do_not_acquire_package(package, "process environment")?;
        }
        if let Some(pattern) = &environment.classes_to_not_instrument_regex {
            builder = builder.do_not_instrument_classes_matching(pattern)?;
        }
        for package in base_packages {
            builder = builder.instrument_package(package, "substitute providers")?;
        }

        for (decl, origin) in [(class_decl, "class declaration"), (method_decl, "method declaration")] {
            let Some(decl) = decl else { continue };
            for substitute in &decl.substitutes {
                let def = source.definition(substitute).ok_or_else(|| {
                    ConfigurationError::UnknownSubstitute {
                        class: substitute.clone(),
                    }
                })?;
                let info = def
                    .substitute
                    .ok_or_else(|| ConfigurationError::NotASubstitute {
                        class: substitute.clone(),
                    })?;
                builder = builder
                    .instrument_class(info.replaces)
                    .add_substitute(substitute.clone());
            }
            for package in &decl.instrumented_packages {
                builder = builder.instrument_package(package, origin)?;
            }
        }

        Ok(builder.build())
    }

    /// A copy that also intercepts `classes` explicitly.
    pub fn with_instrumented_classes<I>(mut self, classes: I) -> Configuration
    where
        I: IntoIterator<Item = ClassName>,
    {
        self.instrumented_classes.extend(classes);
        self
    }

    /// Interception rule: under an included package, not under an excluded package and not
    /// matching the exclusion pattern; or explicitly listed, which always wins.
    pub fn should_instrument(&self, name: &ClassName) -> bool {
        if self.instrumented_classes.contains(name) {
            return true;
        }
        self.instrumented_packages.iter().any(|pkg| name.is_under(pkg))
            && !self.is_excluded_package(name)
            && !self
                .exclusion_pattern
                .as_ref()
                .is_some_and(|pattern| pattern.matches(name))
    }

    /// Whether the sandbox loads its own copy of `name`. Classes under excluded packages are
    /// shared with the host.
    pub fn should_acquire(&self, name: &ClassName) -> bool {
        self.instrumented_classes.contains(name) || !self.is_excluded_package(name)
    }

    fn is_excluded_package(&self, name: &ClassName) -> bool {
        self.excluded_packages.iter().any(|pkg| name.is_under(pkg))
    }

    pub fn instrumented_packages(&self) -> impl Iterator<Item = &str> {
        self.instrumented_packages.iter().map(String::as_str)
    }

    pub fn excluded_packages(&self) -> impl Iterator<Item = &str> {
        self.excluded_packages.iter().map(String::as_str)
    }

    pub fn exclusion_pattern(&self) -> Option<&str> {
        self.exclusion_pattern.as_ref().map(ExclusionPattern::as_str)
    }

    pub fn instrumented_classes(&self) -> impl Iterator<Item = &ClassName> {
        self.instrumented_classes.iter()
    }

    /// Extra substitutes in declaration order.
    pub fn extra_substitutes(&self) -> &[ClassName] {
        &self.extra_substitutes
    }

    /// Hex SHA-256 over the canonical form of this configuration.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(&(
            &self.instrumented_packages,
            &self.excluded_packages,
            self.exclusion_pattern(),
            &self.instrumented_classes,
            &self.extra_substitutes,
        ))
        .unwrap_or_default();
        hex_digest(&canonical)
    }
}

/// Fluent builder for [`Configuration`].
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    instrumented_packages: BTreeSet<String>,
    excluded_packages: BTreeSet<String>,
    exclusion_pattern: Option<ExclusionPattern>,
    instrumented_classes: BTreeSet<ClassName>,
    extra_substitutes: Vec<ClassName>,
}

impl ConfigurationBuilder {
    pub fn instrument_package(
        mut self,
        package: &str,
        origin: &str,
    ) -> Result<Self, ConfigurationError> {
        self.instrumented_packages
            .insert(normalize_package(package, origin)?);
        Ok(self)
    }

    pub fn do_not_acquire_package(
        mut self,
        package: &str,
        origin: &str,
    ) -> Result<Self, ConfigurationError> {
        self.excluded_packages
            .insert(normalize_package(package, origin)?);
        Ok(self)
    }

    pub fn do_not_instrument_classes_matching(
        mut self,
        pattern: &str,
    ) -> Result<Self, ConfigurationError> {
        self.exclusion_pattern = Some(ExclusionPattern::new(pattern)?);
        Ok(self)
    }

    pub fn instrument_class(mut self, class: impl Into<ClassName>) -> Self {
        self.instrumented_classes.insert(class.into());
        self
    }

    pub fn add_substitute(mut self, class: impl Into<ClassName>) -> Self {
        let class = class.into();
        if !self.extra_substitutes.contains(&class) {
            self.extra_substitutes.push(class);
        }
        self
    }

    pub fn build(self) -> Configuration {
        Configuration {
            instrumented_packages: self.instrumented_packages,
            excluded_packages: self.excluded_packages,
            exclusion_pattern: self.exclusion_pattern,
            instrumented_classes: self.instrumented_classes,
            extra_substitutes: self.extra_substitutes,
        }
    }
}

fn normalize_package(package: &str, origin: &str) -> Result<String, ConfigurationError> {
    let trimmed = package.trim();
    if !PACKAGE_NAME.is_match(trimmed) {
        return Err(ConfigurationError::MalformedPackage {
            package: package.to_string(),
            origin: origin.to_string(),
        });
    }
    if trimmed.ends_with('.') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}."))
    }
}
