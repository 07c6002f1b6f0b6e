//! # Class Model
//!
//! The unit of code the harness loads, rewrites and executes. A [`ClassDef`] is a named bag of
//! methods written in a tiny stack instruction set ([`Instr`]); its raw, on-the-wire form is
//! [`ClassBytes`] (canonical JSON). The transformation engine works on the raw form so that a
//! re-transformation can be checked for byte identity.
//!
//! ## Static initialisation
//!
//! A method named [`STATIC_INIT`] is the class's static initialiser. It runs exactly once per
//! loading context, the first time the class is loaded there.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::diagnostics::TransformationError;

pub mod source;

pub use source::{ClassPath, ClassSource, SourceChain};

/// Name of the static initialiser method.
pub const STATIC_INIT: &str = "<clinit>";

/// A dotted, fully-qualified class identifier such as `com.example.Widget`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassName(String);

impl ClassName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The package part of the name, including the trailing dot (`com.example.`).
    pub fn package(&self) -> &str {
        match self.0.rfind('.') {
            Some(idx) => &self.0[..=idx],
            None => "",
        }
    }

    /// True if this class lives under `prefix`. Prefixes are normalised to end with a dot, so
    /// `com.example` matches `com.example.Widget` but not `com.examples.Widget`.
    pub fn is_under(&self, prefix: &str) -> bool {
        if prefix.ends_with('.') {
            self.0.starts_with(prefix)
        } else {
            self.0.len() > prefix.len()
                && self.0.starts_with(prefix)
                && self.0.as_bytes()[prefix.len()] == b'.'
        }
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ClassName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Runtime values manipulated by sandboxed code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

/// A reference to a method of a class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodRef {
    pub class: ClassName,
    pub method: String,
}

impl MethodRef {
    pub fn new(class: impl Into<ClassName>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }

    /// Parses `com.example.Widget.render` into class `com.example.Widget`, method `render`.
    pub fn parse(qualified: &str) -> Option<Self> {
        let idx = qualified.rfind('.')?;
        let (class, method) = (&qualified[..idx], &qualified[idx + 1..]);
        if class.is_empty() || method.is_empty() {
            return None;
        }
        Some(Self::new(class, method))
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.method)
    }
}

/// The stack instruction set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    Push { value: Value },
    /// Pushes the `arg`-th argument of the current invocation.
    Load { arg: usize },
    GetStatic { field: String },
    PutStatic { field: String },
    /// Integer addition, or string concatenation.
    Add,
    Pop,
    /// Direct call.
    Invoke { target: MethodRef, argc: usize },
    /// Indirect call through the sandbox's dispatch handler. Only the transformer emits this.
    Dispatch { target: MethodRef, argc: usize },
    Throw { message: String },
    /// Blocks the executing thread. Cut short, with a timeout fault, by an active deadline.
    Sleep { millis: u64 },
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub body: Vec<Instr>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>, body: Vec<Instr>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

/// Declares the real class a substitute stands in for, and the platform levels it supports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubstituteInfo {
    pub replaces: ClassName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_level: Option<u32>,
    /// Name of a built-in picker to register for the replaced class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picker: Option<String>,
}

impl SubstituteInfo {
    pub fn replacing(real: impl Into<ClassName>) -> Self {
        Self {
            replaces: real.into(),
            min_level: None,
            max_level: None,
            picker: None,
        }
    }

    pub fn supports_level(&self, level: u32) -> bool {
        self.min_level.map_or(true, |min| level >= min)
            && self.max_level.map_or(true, |max| level <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: ClassName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute: Option<SubstituteInfo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub instrumented: bool,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<ClassName>) -> Self {
        Self {
            name: name.into(),
            substitute: None,
            instrumented: false,
            methods: Vec::new(),
        }
    }

    pub fn with_method(mut self, name: impl Into<String>, body: Vec<Instr>) -> Self {
        self.methods.push(MethodDef::new(name, body));
        self
    }

    pub fn with_static_init(self, body: Vec<Instr>) -> Self {
        self.with_method(STATIC_INIT, body)
    }

    pub fn substituting(mut self, info: SubstituteInfo) -> Self {
        self.substitute = Some(info);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn static_init(&self) -> Option<&MethodDef> {
        self.method(STATIC_INIT)
    }

    pub fn encode(&self) -> Result<ClassBytes, TransformationError> {
        serde_json::to_vec(self)
            .map(ClassBytes)
            .map_err(|e| TransformationError::Unencodable {
                class: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// The raw, encoded form of a class definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassBytes(Vec<u8>);

impl ClassBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes the definition. `requested` is only used to label the error.
    pub fn decode(&self, requested: &ClassName) -> Result<ClassDef, TransformationError> {
        serde_json::from_slice(&self.0).map_err(|e| TransformationError::Undecodable {
            class: requested.clone(),
            reason: e.to_string(),
        })
    }

    /// Hex SHA-256 of the raw bytes.
    pub fn digest(&self) -> String {
        hex_digest(&self.0)
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_prefix_matching() {
        let name = ClassName::new("com.example.Widget");
        assert!(name.is_under("com.example."));
        assert!(name.is_under("com.example"));
        assert!(name.is_under("com"));
        assert!(!name.is_under("com.examples"));
        assert!(!name.is_under("com.example.Widget"));
        assert_eq!(name.package(), "com.example.");
    }

    #[test]
    fn test_method_ref_parse() {
        let r = MethodRef::parse("com.example.Widget.render").unwrap();
        assert_eq!(r.class.as_str(), "com.example.Widget");
        assert_eq!(r.method, "render");
        assert!(MethodRef::parse("render").is_none());
        assert!(MethodRef::parse("com.example.").is_none());
    }

    #[test]
    fn test_encoding_is_stable() {
        let def = ClassDef::new("com.example.Widget").with_method(
            "size",
            vec![Instr::Push {
                value: Value::Int(3),
            }],
        );
        let first = def.encode().unwrap();
        let decoded = first.decode(&def.name).unwrap();
        assert_eq!(decoded, def);
        assert_eq!(decoded.encode().unwrap(), first);
        assert_eq!(first.digest().len(), 64);
    }

    #[test]
    fn test_substitute_level_range() {
        let info = SubstituteInfo {
            replaces: ClassName::new("a.B"),
            min_level: Some(21),
            max_level: Some(28),
            picker: None,
        };
        assert!(info.supports_level(21));
        assert!(info.supports_level(28));
        assert!(!info.supports_level(20));
        assert!(!info.supports_level(29));
    }
}
