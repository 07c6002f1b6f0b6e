use super::model::{Description, TestContext};
use crate::diagnostics::Fault;

/// Environment setup and teardown the runner performs around every test method.
///
/// `before_test` and `after_test` run inside the sandbox with the test class loaded.
/// `finally_after_test` runs last, even when everything before it failed.
pub trait SandboxLifecycle: Send + Sync {
    fn before_test(&self, _ctx: &TestContext<'_>) -> Result<(), Fault> {
        Ok(())
    }

    fn after_test(&self, _ctx: &TestContext<'_>) -> Result<(), Fault> {
        Ok(())
    }

    fn finally_after_test(&self, _description: &Description) -> Result<(), Fault> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl SandboxLifecycle for NoopLifecycle {}
