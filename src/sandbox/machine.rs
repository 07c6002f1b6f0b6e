//! Interpreter for class bodies.
//!
//! A [`Machine`] executes methods of loaded classes on the calling thread. It keeps a frame stack
//! so faults can carry the trace of the code that raised them, and an optional [`Deadline`] that
//! is checked before every instruction.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::dispatch::DispatchHandler;
use super::loader::{ClassOrigin, HostContext, LoadedClass};
use super::Sandbox;
use crate::classes::{ClassName, Instr, MethodRef, Value};
use crate::diagnostics::{Fault, LinkageFault, StackFrame};

const MAX_DEPTH: usize = 256;

/// The point in time after which the current test body is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn fault(&self) -> Fault {
        Fault::Timeout {
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn check(&self) -> Result<(), Fault> {
        if self.expired() {
            Err(self.fault())
        } else {
            Ok(())
        }
    }
}

pub struct Machine<'a> {
    host: &'a HostContext,
    sandbox: Option<&'a Sandbox>,
    handler: Option<Arc<DispatchHandler>>,
    frames: Vec<StackFrame>,
    deadline: Option<Deadline>,
}

impl<'a> Machine<'a> {
    pub(crate) fn for_host(host: &'a HostContext) -> Self {
        Self {
            host,
            sandbox: None,
            handler: None,
            frames: Vec::new(),
            deadline: None,
        }
    }

    pub(crate) fn for_sandbox(sandbox: &'a Sandbox, handler: Arc<DispatchHandler>) -> Self {
        Self {
            host: sandbox.host(),
            sandbox: Some(sandbox),
            handler: Some(handler),
            frames: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Records the code calling into the machine as the outermost frame.
    pub fn with_caller(mut self, frame: StackFrame) -> Self {
        self.frames.insert(0, frame);
        self
    }

    /// Current stack, innermost frame first.
    pub fn trace(&self) -> Vec<StackFrame> {
        self.frames.iter().rev().cloned().collect()
    }

    /// Loads `name` in the machine's primary context: the sandbox if there is one.
    pub fn link(&mut self, name: &ClassName) -> Result<Arc<LoadedClass>, Fault> {
        let host = self.host;
        match self.sandbox {
            Some(sandbox) => sandbox.link(name, self),
            None => host.link(name, self),
        }
    }

    fn link_from(&mut self, origin: ClassOrigin, name: &ClassName) -> Result<Arc<LoadedClass>, Fault> {
        let host = self.host;
        match (origin, self.sandbox) {
            (ClassOrigin::Isolated(_), Some(sandbox)) => sandbox.link(name, self),
            _ => host.link(name, self),
        }
    }

    /// Calls `target` the way a call site in sandboxed code would: through the dispatch handler
    /// if the sandbox intercepts the target class, directly otherwise.
    pub fn call_site(&mut self, target: &MethodRef, args: Vec<Value>) -> Result<Value, Fault> {
        let intercepted = self
            .sandbox
            .is_some_and(|sandbox| sandbox.configuration().should_instrument(&target.class));
        if intercepted {
            self.dispatch(target, args)
        } else {
            let class = self.link(&target.class)?;
            self.invoke(&class, &target.method, args)
        }
    }

    pub fn invoke(
        &mut self,
        class: &Arc<LoadedClass>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Fault> {
        let def = class.shared_definition();
        let Some(method_def) = def.method(method) else {
            return Err(LinkageFault::NoSuchMethod {
                class: class.name().clone(),
                method: method.to_string(),
                trace: self.trace(),
            }
            .into());
        };
        if self.frames.len() >= MAX_DEPTH {
            return Err(self.thrown(format!("stack overflow calling {}.{method}", class.name())));
        }
        self.frames
            .push(StackFrame::new(class.name().clone(), method));
        let result = self.execute(class, &method_def.body, &args);
        self.frames.pop();
        result
    }

    fn dispatch(&mut self, target: &MethodRef, args: Vec<Value>) -> Result<Value, Fault> {
        if let Some(handler) = self.handler.clone() {
            if let Some(interceptor) = handler.interceptor(target) {
                return interceptor(&args);
            }
            if let Some(substitute) = handler.substitute_for(&target.class) {
                let class = self.link(&substitute)?;
                if class.method(&target.method).is_some() {
                    return self.invoke(&class, &target.method, args);
                }
            }
        }
        let class = self.link(&target.class)?;
        self.invoke(&class, &target.method, args)
    }

    fn execute(
        &mut self,
        class: &Arc<LoadedClass>,
        body: &[Instr],
        args: &[Value],
    ) -> Result<Value, Fault> {
        let mut stack: Vec<Value> = Vec::new();
        for instr in body {
            if let Some(deadline) = self.deadline {
                deadline.check()?;
            }
            match instr {
                Instr::Push { value } => stack.push(value.clone()),
                Instr::Load { arg } => stack.push(args.get(*arg).cloned().unwrap_or_default()),
                Instr::GetStatic { field } => stack.push(class.get_static(field)),
                Instr::PutStatic { field } => {
                    let value = self.pop(&mut stack)?;
                    class.put_static(field.clone(), value);
                }
                Instr::Add => {
                    let rhs = self.pop(&mut stack)?;
                    let lhs = self.pop(&mut stack)?;
                    stack.push(self.add(lhs, rhs)?);
                }
                Instr::Pop => {
                    self.pop(&mut stack)?;
                }
                Instr::Invoke { target, argc } => {
                    let call_args = self.pop_args(&mut stack, *argc)?;
                    let callee = self.link_from(class.origin(), &target.class)?;
                    stack.push(self.invoke(&callee, &target.method, call_args)?);
                }
                Instr::Dispatch { target, argc } => {
                    let call_args = self.pop_args(&mut stack, *argc)?;
                    stack.push(self.dispatch(target, call_args)?);
                }
                Instr::Throw { message } => return Err(self.thrown(message.clone())),
                Instr::Sleep { millis } => self.sleep(Duration::from_millis(*millis))?,
                Instr::Return => return Ok(stack.pop().unwrap_or_default()),
            }
        }
        Ok(stack.pop().unwrap_or_default())
    }

    fn sleep(&self, wanted: Duration) -> Result<(), Fault> {
        match self.deadline {
            Some(deadline) if deadline.remaining() <= wanted => {
                thread::sleep(deadline.remaining());
                Err(deadline.fault())
            }
            _ => {
                thread::sleep(wanted);
                Ok(())
            }
        }
    }

    fn add(&self, lhs: Value, rhs: Value) -> Result<Value, Fault> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
            (Value::Str(a), b) => Ok(Value::Str(a + &plain(&b))),
            (a, Value::Str(b)) => Ok(Value::Str(plain(&a) + &b)),
            (a, b) => Err(self.thrown(format!(
                "cannot add {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn pop(&self, stack: &mut Vec<Value>) -> Result<Value, Fault> {
        stack
            .pop()
            .ok_or_else(|| self.thrown("operand stack underflow".to_string()))
    }

    fn pop_args(&self, stack: &mut Vec<Value>, argc: usize) -> Result<Vec<Value>, Fault> {
        if stack.len() < argc {
            return Err(self.thrown("operand stack underflow".to_string()));
        }
        Ok(stack.split_off(stack.len() - argc))
    }

    fn thrown(&self, message: String) -> Fault {
        Fault::Thrown {
            message,
            trace: self.trace(),
        }
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}
