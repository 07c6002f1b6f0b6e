//! # Substitution Registry
//!
//! Maps a real class to the substitute class that stands in for it inside a sandbox.
//!
//! ## Registry Invariant
//! A registry is an immutable snapshot. The base registry is discovered once per process (see
//! [`providers`]); per-sandbox registries are derived from it through [`RegistryBuilder`], which
//! always produces a new instance. Nothing mutates a registry after `build`.
//!
//! ## Variants and pickers
//! A real class may have several substitute variants, e.g. one per platform level range. When
//! more than one variant is registered, the picker registered for that class decides, given the
//! ambient [`PickerContext`]. Pickers are plain `fn` pointers: they see the context and the
//! candidates and nothing else, so resolution is deterministic and never loads classes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::classes::{ClassDef, ClassName};
use crate::diagnostics::ConfigurationError;

pub mod providers;

pub use providers::{ClasspathProvider, SubstituteProvider, SubstituteProviders};

/// Ambient runtime signals available to pickers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PickerContext {
    /// The emulated platform version.
    pub platform_level: u32,
    /// Free-form signals, e.g. a device form factor.
    pub signals: BTreeMap<String, String>,
}

impl Default for PickerContext {
    fn default() -> Self {
        Self {
            platform_level: DEFAULT_PLATFORM_LEVEL,
            signals: BTreeMap::new(),
        }
    }
}

impl PickerContext {
    pub fn at_level(platform_level: u32) -> Self {
        Self {
            platform_level,
            ..Self::default()
        }
    }
}

pub const DEFAULT_PLATFORM_LEVEL: u32 = 34;

/// One candidate substitute for a real class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubstituteVariant {
    pub class: ClassName,
    pub min_level: Option<u32>,
    pub max_level: Option<u32>,
}

impl SubstituteVariant {
    pub fn supports_level(&self, level: u32) -> bool {
        self.min_level.map_or(true, |min| level >= min)
            && self.max_level.map_or(true, |max| level <= max)
    }
}

/// Chooses one variant among several. Must be a pure function of its arguments.
pub type PickerFn = fn(&PickerContext, &[SubstituteVariant]) -> Option<ClassName>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Picker {
    pub name: &'static str,
    pub pick: PickerFn,
}

impl Picker {
    /// Looks up a built-in picker by the name used in class definitions.
    pub fn builtin(name: &str) -> Option<Picker> {
        match name {
            "platform_level" => Some(Picker {
                name: "platform_level",
                pick: pick_by_platform_level,
            }),
            "first" => Some(Picker {
                name: "first",
                pick: pick_first,
            }),
            "signal" => Some(Picker {
                name: "signal",
                pick: pick_by_variant_signal,
            }),
            _ => None,
        }
    }
}

/// Picks the variant whose level range admits the context level; among several, the one with
/// the highest minimum level (the most specific).
pub fn pick_by_platform_level(
    ctx: &PickerContext,
    variants: &[SubstituteVariant],
) -> Option<ClassName> {
    variants
        .iter()
        .filter(|v| v.supports_level(ctx.platform_level))
        .max_by_key(|v| v.min_level.unwrap_or(0))
        .map(|v| v.class.clone())
}

pub fn pick_first(_ctx: &PickerContext, variants: &[SubstituteVariant]) -> Option<ClassName> {
    variants.first().map(|v| v.class.clone())
}

/// Picks the variant named by the `variant` signal, matching on the simple class name.
pub fn pick_by_variant_signal(
    ctx: &PickerContext,
    variants: &[SubstituteVariant],
) -> Option<ClassName> {
    let wanted = ctx.signals.get("variant")?;
    variants
        .iter()
        .find(|v| v.class.as_str().rsplit('.').next() == Some(wanted.as_str()))
        .map(|v| v.class.clone())
}

/// Immutable real-class → substitute mapping.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionRegistry {
    substitutes: BTreeMap<ClassName, Vec<SubstituteVariant>>,
    pickers: BTreeMap<ClassName, Picker>,
    provided_packages: BTreeSet<String>,
}

impl SubstitutionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A builder seeded with every entry of this registry.
    pub fn new_builder(&self) -> RegistryBuilder {
        RegistryBuilder {
            base: self.clone(),
            added: Vec::new(),
            pickers: Vec::new(),
            packages: Vec::new(),
        }
    }

    /// Resolves the substitute for `real`, or `None` for pass-through.
    pub fn resolve(&self, real: &ClassName, ctx: &PickerContext) -> Option<ClassName> {
        let variants = self.substitutes.get(real)?;
        match variants.as_slice() {
            [] => None,
            [only] => only
                .supports_level(ctx.platform_level)
                .then(|| only.class.clone()),
            many => {
                let pick = self
                    .pickers
                    .get(real)
                    .map_or(pick_by_platform_level as PickerFn, |p| p.pick);
                pick(ctx, many)
            }
        }
    }

    pub fn variants(&self, real: &ClassName) -> &[SubstituteVariant] {
        self.substitutes.get(real).map_or(&[], Vec::as_slice)
    }

    pub fn picker(&self, real: &ClassName) -> Option<&Picker> {
        self.pickers.get(real)
    }

    pub fn substituted_classes(&self) -> impl Iterator<Item = &ClassName> {
        self.substitutes.keys()
    }

    pub fn provided_packages(&self) -> impl Iterator<Item = &str> {
        self.provided_packages.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.substitutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.substitutes.is_empty()
    }

    /// Real classes whose substitute entries differ between the two registries.
    pub fn changed_classes(&self, other: &SubstitutionRegistry) -> BTreeSet<ClassName> {
        self.substitutes
            .keys()
            .chain(other.substitutes.keys())
            .filter(|real| self.substitutes.get(*real) != other.substitutes.get(*real))
            .cloned()
            .collect()
    }
}

/// Produces a new [`SubstitutionRegistry`]. Every method consumes and returns the builder.
#[derive(Debug)]
pub struct RegistryBuilder {
    base: SubstitutionRegistry,
    added: Vec<ClassDef>,
    pickers: Vec<(ClassName, Picker)>,
    packages: Vec<String>,
}

impl RegistryBuilder {
    pub fn add_substitutes<I>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = ClassDef>,
    {
        self.added.extend(classes);
        self
    }

    pub fn add_picker(mut self, real: impl Into<ClassName>, picker: Picker) -> Self {
        self.pickers.push((real.into(), picker));
        self
    }

    pub fn add_provided_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    /// Validates the added substitutes and snapshots the result.
    ///
    /// Substitutes added in one call to `build` that replace the same real class become variants
    /// of each other; together they replace whatever the base registry held for that class.
    pub fn build(self) -> Result<SubstitutionRegistry, ConfigurationError> {
        let mut registry = self.base;
        let mut replaced: BTreeSet<ClassName> = BTreeSet::new();

        for def in self.added {
            let info = def
                .substitute
                .as_ref()
                .ok_or_else(|| ConfigurationError::NotASubstitute {
                    class: def.name.clone(),
                })?;
            let real = info.replaces.clone();
            let variants = registry.substitutes.entry(real.clone()).or_default();
            if replaced.insert(real.clone()) {
                variants.clear();
            }
            variants.retain(|v| v.class != def.name);
            variants.push(SubstituteVariant {
                class: def.name.clone(),
                min_level: info.min_level,
                max_level: info.max_level,
            });
            if let Some(picker) = info.picker.as_deref().and_then(Picker::builtin) {
                registry.pickers.insert(real, picker);
            }
        }
        for (real, picker) in self.pickers {
            registry.pickers.insert(real, picker);
        }
        registry.provided_packages.extend(self.packages);
        Ok(registry)
    }
}
