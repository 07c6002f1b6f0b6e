//! Substitute-provider discovery.
//!
//! Providers are enumerated once per [`SubstituteProviders`] instance. The first call that needs
//! the base registry builds it; every later call returns the same snapshot. Discovery must happen
//! before any sandbox becomes the ambient context of the calling thread, so initialisation is
//! refused while one is.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::{Picker, SubstitutionRegistry};
use crate::classes::{ClassBytes, ClassDef, ClassName, ClassPath, ClassSource};
use crate::diagnostics::Fault;
use crate::sandbox::ambient;

/// A source of substitute classes and the pickers that choose among their variants.
pub trait SubstituteProvider: Send + Sync {
    fn name(&self) -> &str;

    fn substitutes(&self) -> Vec<ClassDef>;

    fn pickers(&self) -> Vec<(ClassName, Picker)> {
        Vec::new()
    }

    /// Package prefixes whose classes this provider covers. They are intercepted by default.
    fn provided_packages(&self) -> Vec<String>;

    /// Clears any per-test state the provider keeps. Called after every test method.
    fn reset(&self) {}
}

#[derive(Debug)]
struct Discovered {
    registry: SubstitutionRegistry,
    classes: ClassPath,
    packages: Vec<String>,
}

/// The discovered set of providers and the base registry built from them.
#[derive(Default)]
pub struct SubstituteProviders {
    providers: Vec<Arc<dyn SubstituteProvider>>,
    discovered: OnceCell<Discovered>,
    discoveries: AtomicUsize,
}

static GLOBAL: OnceCell<Arc<SubstituteProviders>> = OnceCell::new();

impl SubstituteProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn SubstituteProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Installs the process-wide instance. Fails, returning the argument, if one is already
    /// installed.
    pub fn install_global(
        providers: Arc<SubstituteProviders>,
    ) -> Result<(), Arc<SubstituteProviders>> {
        GLOBAL.set(providers)
    }

    /// The process-wide instance. An empty provider set is installed if none was.
    pub fn global() -> Arc<SubstituteProviders> {
        GLOBAL
            .get_or_init(|| Arc::new(SubstituteProviders::new()))
            .clone()
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    pub fn base_registry(&self) -> Result<&SubstitutionRegistry, Fault> {
        Ok(&self.discover()?.registry)
    }

    pub fn provided_packages(&self) -> Result<&[String], Fault> {
        Ok(&self.discover()?.packages)
    }

    /// Every substitute definition contributed by a provider.
    pub fn classes(&self) -> Result<&ClassPath, Fault> {
        Ok(&self.discover()?.classes)
    }

    /// How many times discovery actually ran. Never more than one.
    pub fn discoveries(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    pub fn reset_all(&self) {
        for provider in &self.providers {
            provider.reset();
        }
    }

    fn discover(&self) -> Result<&Discovered, Fault> {
        if let Some(discovered) = self.discovered.get() {
            return Ok(discovered);
        }
        if let Some(sandbox) = ambient::current() {
            return Err(Fault::DiscoveryWhileAmbient {
                sandbox: sandbox.id(),
            });
        }
        self.discovered.get_or_try_init(|| {
            self.discoveries.fetch_add(1, Ordering::SeqCst);
            let mut builder = SubstitutionRegistry::empty().new_builder();
            let mut classes = ClassPath::new();
            let mut packages = BTreeSet::new();
            for provider in &self.providers {
                let defs = provider.substitutes();
                for def in &defs {
                    classes.define(def.clone())?;
                }
                builder = builder.add_substitutes(defs);
                for (real, picker) in provider.pickers() {
                    builder = builder.add_picker(real, picker);
                }
                packages.extend(provider.provided_packages());
            }
            let packages: Vec<String> = packages.into_iter().collect();
            let registry = builder.add_provided_packages(packages.clone()).build()?;
            tracing::debug!(
                providers = self.providers.len(),
                substitutes = registry.len(),
                "discovered substitute providers"
            );
            Ok(Discovered {
                registry,
                classes,
                packages,
            })
        })
    }
}

impl ClassSource for SubstituteProviders {
    fn find(&self, name: &ClassName) -> Option<ClassBytes> {
        self.classes().ok()?.find(name)
    }
}

/// Exposes the substitute definitions found on a classpath.
#[derive(Debug, Clone)]
pub struct ClasspathProvider {
    name: String,
    substitutes: Vec<ClassDef>,
    packages: Vec<String>,
}

impl ClasspathProvider {
    /// Collects every class in `classpath` that declares a class it replaces. The provided
    /// packages default to the packages of the replaced classes.
    pub fn new(name: impl Into<String>, classpath: &ClassPath) -> Self {
        let substitutes: Vec<ClassDef> = classpath
            .names()
            .filter_map(|class| classpath.definition(class))
            .filter(|def| def.substitute.is_some())
            .collect();
        let packages = substitutes
            .iter()
            .filter_map(|def| def.substitute.as_ref())
            .map(|info| info.replaces.package().to_string())
            .filter(|pkg| !pkg.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self {
            name: name.into(),
            substitutes,
            packages,
        }
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }
}

impl SubstituteProvider for ClasspathProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn substitutes(&self) -> Vec<ClassDef> {
        self.substitutes.clone()
    }

    fn provided_packages(&self) -> Vec<String> {
        self.packages.clone()
    }
}
