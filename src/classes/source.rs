//! Where raw class definitions come from.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use super::{ClassBytes, ClassDef, ClassName};
use crate::diagnostics::Fault;

/// A read-only lookup of raw class definitions by name.
pub trait ClassSource: Send + Sync {
    fn find(&self, name: &ClassName) -> Option<ClassBytes>;

    /// Decoded lookup, for callers that only need to inspect a definition.
    fn definition(&self, name: &ClassName) -> Option<ClassDef> {
        self.find(name)?.decode(name).ok()
    }
}

/// An in-memory set of class definitions.
#[derive(Debug, Clone, Default)]
pub struct ClassPath {
    classes: BTreeMap<ClassName, ClassBytes>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a definition. Fails only if the definition cannot be encoded.
    pub fn define(&mut self, def: ClassDef) -> Result<&mut Self, Fault> {
        let bytes = def.encode()?;
        self.classes.insert(def.name, bytes);
        Ok(self)
    }

    pub fn with(mut self, def: ClassDef) -> Result<Self, Fault> {
        self.define(def)?;
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &ClassName> {
        self.classes.keys()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Loads every `*.class.json` file under `root`. Each file holds either one class definition
    /// or an array of them. Files are visited in sorted order so later duplicates win
    /// deterministically.
    pub fn from_dir<P: AsRef<Path>>(root: P) -> Result<Self, Fault> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root.as_ref()) {
            let entry = entry.map_err(|e| Fault::Io {
                message: format!("failed to walk classpath: {e}"),
            })?;
            if entry.file_type().is_file() && is_class_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();

        let mut classpath = Self::new();
        for file in files {
            let content = std::fs::read_to_string(&file).map_err(|e| Fault::Io {
                message: format!("failed to read '{}': {e}", file.display()),
            })?;
            let defs: Vec<ClassDef> = match serde_json::from_str::<Vec<ClassDef>>(&content) {
                Ok(defs) => defs,
                Err(_) => {
                    let def = serde_json::from_str::<ClassDef>(&content).map_err(|e| Fault::Io {
                        message: format!("malformed class file '{}': {e}", file.display()),
                    })?;
                    vec![def]
                }
            };
            for def in defs {
                classpath.define(def)?;
            }
        }
        tracing::debug!(classes = classpath.len(), root = %root.as_ref().display(), "loaded classpath");
        Ok(classpath)
    }
}

fn is_class_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".class.json"))
}

impl ClassSource for ClassPath {
    fn find(&self, name: &ClassName) -> Option<ClassBytes> {
        self.classes.get(name).cloned()
    }
}

/// Several sources searched in order; the first hit wins.
#[derive(Clone, Default)]
pub struct SourceChain {
    sources: Vec<Arc<dyn ClassSource>>,
}

impl SourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, source: Arc<dyn ClassSource>) -> Self {
        self.sources.push(source);
        self
    }
}

impl ClassSource for SourceChain {
    fn find(&self, name: &ClassName) -> Option<ClassBytes> {
        self.sources.iter().find_map(|source| source.find(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{Instr, Value};

    fn widget(size: i64) -> ClassDef {
        ClassDef::new("com.example.Widget").with_method(
            "size",
            vec![Instr::Push {
                value: Value::Int(size),
            }],
        )
    }

    #[test]
    fn test_chain_prefers_earlier_sources() {
        let first: Arc<dyn ClassSource> = Arc::new(ClassPath::new().with(widget(1)).unwrap());
        let second: Arc<dyn ClassSource> = Arc::new(ClassPath::new().with(widget(2)).unwrap());
        let chain = SourceChain::new().then(first).then(second);
        let def = chain.definition(&ClassName::new("com.example.Widget")).unwrap();
        assert_eq!(def, widget(1));
        assert!(chain.find(&ClassName::new("com.example.Missing")).is_none());
    }

    #[test]
    fn test_from_dir_reads_single_and_array_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("widget.class.json"),
            serde_json::to_string(&widget(7)).unwrap(),
        )
        .unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(
            nested.join("more.class.json"),
            serde_json::to_string(&vec![ClassDef::new("com.example.A"), ClassDef::new("com.example.B")])
                .unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.json"), "{}").unwrap();

        let classpath = ClassPath::from_dir(dir.path()).unwrap();
        assert_eq!(classpath.len(), 3);
        assert_eq!(
            classpath.definition(&ClassName::new("com.example.Widget")),
            Some(widget(7))
        );
    }

    #[test]
    fn test_from_dir_rejects_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.class.json"), "not json").unwrap();
        let err = ClassPath::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Fault::Io { .. }));
    }
}
