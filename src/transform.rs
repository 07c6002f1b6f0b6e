//! # Code Transformation Engine
//!
//! Rewrites a raw class definition so that every call site whose target is intercepted by the
//! active [`Configuration`] goes through the sandbox's dispatch handler. Call sites into classes
//! that are not intercepted are left exactly as they were.
//!
//! The transformer is stateless; the sandbox caches its output per class. Running it again on
//! its own output under the same configuration yields byte-identical bytes, because the rewrite
//! only ever turns `invoke` into `dispatch` and the encoding is canonical.

use crate::classes::{ClassBytes, ClassDef, ClassName, Instr};
use crate::config::Configuration;
use crate::diagnostics::TransformationError;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassTransformer;

/// What a transformation did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub rewritten: usize,
    pub untouched: usize,
}

impl ClassTransformer {
    pub fn new() -> Self {
        Self
    }

    pub fn transform(
        &self,
        name: &ClassName,
        raw: &ClassBytes,
        config: &Configuration,
    ) -> Result<ClassBytes, TransformationError> {
        let (def, _) = self.transform_def(name, raw, config)?;
        def.encode()
    }

    /// Like [`transform`](Self::transform) but returns the decoded definition as well.
    pub fn transform_def(
        &self,
        name: &ClassName,
        raw: &ClassBytes,
        config: &Configuration,
    ) -> Result<(ClassDef, TransformStats), TransformationError> {
        let mut def = raw.decode(name)?;
        if &def.name != name {
            return Err(TransformationError::NameMismatch {
                expected: name.clone(),
                found: def.name,
            });
        }

        let mut stats = TransformStats::default();
        for method in &mut def.methods {
            for instr in &mut method.body {
                match instr {
                    Instr::Invoke { target, argc } if config.should_instrument(&target.class) => {
                        let dispatch = Instr::Dispatch {
                            target: target.clone(),
                            argc: *argc,
                        };
                        *instr = dispatch;
                        stats.rewritten += 1;
                    }
                    Instr::Invoke { .. } => stats.untouched += 1,
                    Instr::Dispatch { target, .. } => {
                        if !config.should_instrument(&target.class) {
                            return Err(TransformationError::ConflictingDispatch {
                                class: name.clone(),
                                target: target.class.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        def.instrumented = true;
        tracing::trace!(
            class = %name,
            rewritten = stats.rewritten,
            untouched = stats.untouched,
            "transformed class"
        );
        Ok((def, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{MethodRef, Value};

    fn config() -> Configuration {
        Configuration::builder()
            .instrument_package("platform", "test")
            .unwrap()
            .build()
    }

    fn caller() -> ClassDef {
        ClassDef::new("app.Caller").with_method(
            "run",
            vec![
                Instr::Invoke {
                    target: MethodRef::new("platform.ui.View", "draw"),
                    argc: 0,
                },
                Instr::Pop,
                Instr::Invoke {
                    target: MethodRef::new("app.Util", "help"),
                    argc: 0,
                },
                Instr::Return,
            ],
        )
    }

    #[test]
    fn test_rewrites_only_intercepted_call_sites() {
        let raw = caller().encode().unwrap();
        let (def, stats) = ClassTransformer::new()
            .transform_def(&ClassName::new("app.Caller"), &raw, &config())
            .unwrap();
        assert_eq!(stats, TransformStats { rewritten: 1, untouched: 1 });
        let body = &def.method("run").unwrap().body;
        assert!(matches!(&body[0], Instr::Dispatch { target, .. } if target.class.as_str() == "platform.ui.View"));
        assert!(matches!(&body[2], Instr::Invoke { target, .. } if target.class.as_str() == "app.Util"));
        assert!(def.instrumented);
    }

    #[test]
    fn test_transformation_is_idempotent() {
        let transformer = ClassTransformer::new();
        let name = ClassName::new("app.Caller");
        let once = transformer
            .transform(&name, &caller().encode().unwrap(), &config())
            .unwrap();
        let twice = transformer.transform(&name, &once, &config()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.digest(), twice.digest());
    }

    #[test]
    fn test_untouched_class_only_gains_marker() {
        let def = ClassDef::new("app.Plain").with_method(
            "value",
            vec![Instr::Push {
                value: Value::Int(1),
            }],
        );
        let out = ClassTransformer::new()
            .transform(&def.name, &def.encode().unwrap(), &config())
            .unwrap()
            .decode(&def.name)
            .unwrap();
        assert_eq!(out.methods, def.methods);
    }

    #[test]
    fn test_errors() {
        let transformer = ClassTransformer::new();
        let err = transformer
            .transform(
                &ClassName::new("app.Other"),
                &caller().encode().unwrap(),
                &config(),
            )
            .unwrap_err();
        assert!(matches!(err, TransformationError::NameMismatch { .. }));

        let err = transformer
            .transform(
                &ClassName::new("app.Caller"),
                &ClassBytes::new(b"garbage".to_vec()),
                &config(),
            )
            .unwrap_err();
        assert!(matches!(err, TransformationError::Undecodable { .. }));

        let instrumented = transformer
            .transform(&ClassName::new("app.Caller"), &caller().encode().unwrap(), &config())
            .unwrap();
        let err = transformer
            .transform(
                &ClassName::new("app.Caller"),
                &instrumented,
                &Configuration::builder().build(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TransformationError::ConflictingDispatch {
                class: ClassName::new("app.Caller"),
                target: ClassName::new("platform.ui.View"),
            }
        );
    }
}
