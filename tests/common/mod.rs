//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use shadowbox::classes::{ClassDef, ClassPath, ClassSource, Instr, SubstituteInfo, Value};
use shadowbox::registry::{ClasspathProvider, SubstituteProviders};
use shadowbox::runner::{RecordingNotifier, RunSummary, SandboxTestRunner, TestClass};

pub fn int(n: i64) -> Instr {
    Instr::Push {
        value: Value::Int(n),
    }
}

pub fn invoke(target: &str, argc: usize) -> Instr {
    Instr::Invoke {
        target: shadowbox::MethodRef::parse(target).expect("valid method reference"),
        argc,
    }
}

/// `app.Counter`: a static `count` starting at zero, and `bump` returning the new count.
pub fn counter() -> ClassDef {
    ClassDef::new("app.Counter")
        .with_static_init(vec![
            int(0),
            Instr::PutStatic {
                field: "count".into(),
            },
        ])
        .with_method(
            "bump",
            vec![
                Instr::GetStatic {
                    field: "count".into(),
                },
                int(1),
                Instr::Add,
                Instr::PutStatic {
                    field: "count".into(),
                },
                Instr::GetStatic {
                    field: "count".into(),
                },
            ],
        )
}

/// `platform.time.Clock`, whose real `now` returns 1000.
pub fn clock() -> ClassDef {
    ClassDef::new("platform.time.Clock").with_method("now", vec![int(1000)])
}

pub fn clock_substitute(name: &str, now: i64) -> ClassDef {
    ClassDef::new(name)
        .substituting(SubstituteInfo::replacing("platform.time.Clock"))
        .with_method("now", vec![int(now)])
}

pub fn classpath(defs: Vec<ClassDef>) -> Arc<dyn ClassSource> {
    let mut classpath = ClassPath::new();
    for def in defs {
        classpath.define(def).expect("fixture encodes");
    }
    Arc::new(classpath)
}

pub fn no_providers() -> Arc<SubstituteProviders> {
    Arc::new(SubstituteProviders::new())
}

/// Providers exposing the given substitutes.
pub fn providers(substitutes: Vec<ClassDef>) -> Arc<SubstituteProviders> {
    let mut classpath = ClassPath::new();
    for def in substitutes {
        classpath.define(def).expect("fixture encodes");
    }
    Arc::new(
        SubstituteProviders::new()
            .with(Arc::new(ClasspathProvider::new("fixtures", &classpath))),
    )
}

pub fn runner(class: TestClass, defs: Vec<ClassDef>) -> SandboxTestRunner {
    SandboxTestRunner::builder(class, classpath(defs))
        .providers(no_providers())
        .build()
        .expect("runner builds")
}

pub fn run(runner: &SandboxTestRunner) -> (RunSummary, Arc<RecordingNotifier>) {
    let recording = Arc::new(RecordingNotifier::new());
    let summary = runner.run(recording.clone());
    (summary, recording)
}
