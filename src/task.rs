// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tasks, task factories, and the child-side task registry.
//!
//! A [`Task`] lives on the parent: it names a child-side entry, carries the
//! input payload, and holds the completion hooks. The entry itself is a
//! function the worker resolves in its [`TaskRegistry`]. While a task runs,
//! the child can call back into the parent through the task's named callback
//! registry; unknown names are rejected rather than reflected over.

use crate::messages::{ResponseBody, TaskSpec};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::rc::Rc;

/// How a task ended when it did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The worker rejected the request (unknown entry, protocol misuse).
    Error(String),
    /// The entry function failed while running.
    Exception { message: String, detail: String },
    /// The worker died with the task in flight.
    WorkerFailed { reason: String },
}

impl Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Error(msg) => write!(f, "{}", msg),
            TaskError::Exception { message, detail } => write!(f, "{} ({})", message, detail),
            TaskError::WorkerFailed { reason } => write!(f, "worker failed: {}", reason),
        }
    }
}

/// Error from invoking a task's parent-side callback.
pub(crate) enum CallbackError {
    UnknownFunction(String),
    Failed(String),
}

type ResultHook = Box<dyn FnOnce(Value)>;
type ErrorHook = Box<dyn FnOnce(TaskError)>;
type ParentCallback = Box<dyn FnMut(&[Value]) -> Result<Value, String>>;

/// A unit of work dispatched to a worker.
///
/// Exactly one of the completion hooks fires, once, when the task ends.
pub struct Task {
    group: Option<String>,
    spec: TaskSpec,
    on_result: Option<ResultHook>,
    on_error: Option<ErrorHook>,
    callbacks: HashMap<String, ParentCallback>,
}

impl Task {
    pub fn new(entry: impl Into<String>, payload: Value) -> Self {
        Task {
            group: None,
            spec: TaskSpec { entry: entry.into(), payload },
            on_result: None,
            on_error: None,
            callbacks: HashMap::new(),
        }
    }

    /// Restricts the task to workers carrying the same group label.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn on_result(mut self, hook: impl FnOnce(Value) + 'static) -> Self {
        self.on_result = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl FnOnce(TaskError) + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Declares a named callback the running child may invoke on this task.
    pub fn with_callback(
        mut self,
        name: impl Into<String>,
        callback: impl FnMut(&[Value]) -> Result<Value, String> + 'static,
    ) -> Self {
        self.callbacks.insert(name.into(), Box::new(callback));
        self
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub(crate) fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub(crate) fn invoke_callback(
        &mut self,
        name: &str,
        args: &[Value],
    ) -> Result<Value, CallbackError> {
        match self.callbacks.get_mut(name) {
            Some(callback) => callback(args).map_err(CallbackError::Failed),
            None => Err(CallbackError::UnknownFunction(name.to_string())),
        }
    }

    pub(crate) fn finish(mut self, response: ResponseBody) {
        match response {
            ResponseBody::Ok(value) => {
                if let Some(hook) = self.on_result.take() {
                    hook(value);
                }
            }
            ResponseBody::Error(msg) => self.fail(TaskError::Error(msg)),
            ResponseBody::Exception { message, detail } => {
                self.fail(TaskError::Exception { message, detail });
            }
            ResponseBody::WorkerFailed { reason } => {
                self.fail(TaskError::WorkerFailed { reason });
            }
        }
    }

    fn fail(&mut self, error: TaskError) {
        if let Some(hook) = self.on_error.take() {
            hook(error);
        }
    }
}

/// A lazy producer of tasks, consulted before the queued task list.
pub trait TaskFactory {
    /// Group labels this factory produces for. `None` means any group.
    fn groups(&self) -> Option<&[String]> {
        None
    }

    /// The next task for `group`, or `None` when the factory has nothing for
    /// that group right now.
    fn create_next_task(&mut self, group: Option<&str>) -> Option<Task>;
}

/// Error returned by a task entry. The worker reports it back as an
/// exception response, which routes to the task's error hook.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        TaskFailure { message: message.into() }
    }
}

impl From<String> for TaskFailure {
    fn from(message: String) -> Self {
        TaskFailure { message }
    }
}

/// Child-side services available to a running entry.
pub trait TaskContext {
    /// Invokes a named callback on the originating task in the parent and
    /// returns its value.
    fn call_parent(&mut self, name: &str, args: &[Value]) -> Result<Value, TaskFailure>;
}

/// A registered entry function, shared between the registry and the host
/// executing it.
pub type TaskEntry = Rc<dyn Fn(&Value, &mut dyn TaskContext) -> Result<Value, TaskFailure>>;

/// Child-side map from entry names to entry functions.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    entries: HashMap<String, TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry { entries: HashMap::new() }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        entry: impl Fn(&Value, &mut dyn TaskContext) -> Result<Value, TaskFailure> + 'static,
    ) {
        self.entries.insert(name.into(), Rc::new(entry));
    }

    pub fn get(&self, name: &str) -> Option<TaskEntry> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn finish_fires_exactly_one_hook() {
        let results = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let results_in = results.clone();
        let errors_in = errors.clone();
        let task = Task::new("echo", Value::from(1))
            .on_result(move |v| results_in.borrow_mut().push(v))
            .on_error(move |e| errors_in.borrow_mut().push(e));

        task.finish(ResponseBody::Ok(Value::from(1)));
        assert_eq!(*results.borrow(), vec![Value::from(1)]);
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn worker_failure_routes_to_error_hook() {
        let errors = Rc::new(RefCell::new(Vec::new()));
        let errors_in = errors.clone();
        let task = Task::new("echo", Value::Null)
            .on_error(move |e| errors_in.borrow_mut().push(e));
        task.finish(ResponseBody::WorkerFailed { reason: "gone".to_string() });
        assert_eq!(
            *errors.borrow(),
            vec![TaskError::WorkerFailed { reason: "gone".to_string() }]
        );
    }

    #[test]
    fn unknown_callback_is_rejected() {
        let mut task = Task::new("echo", Value::Null)
            .with_callback("known", |_| Ok(Value::Null));
        assert!(task.invoke_callback("known", &[]).is_ok());
        assert!(matches!(
            task.invoke_callback("other", &[]),
            Err(CallbackError::UnknownFunction(_))
        ));
    }
}
