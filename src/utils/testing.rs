//! Recording executor for unit tests

use crate::provision::tracker::Resource;
use crate::utils::command::{
    probe_by_execute, CommandOutput, Executor, Invocation, ProbeOutcome,
};
use crate::utils::error::{LvmRootfsError, Result};
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// How a scripted command responds
#[derive(Debug, Clone)]
enum Response {
    Stdout(String),
    Fail(i32),
    NotFound,
    TimedOut,
}

/// Records every invocation instead of running it.
///
/// Responses are matched on the longest command-line prefix; anything not
/// scripted succeeds with empty output. Every path exists unless marked
/// missing.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    responses: Vec<(String, Response)>,
    missing: HashSet<String>,
    unreadable: HashSet<String>,
    calls: RefCell<Vec<Invocation>>,
    events: RefCell<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loop attach results that a normal build expects.
    pub fn with_loop_devices() -> Self {
        Self::new()
            .responding("losetup --find --show --partscan", "/dev/loop1\n")
            .responding("losetup --find --show", "/dev/loop0\n")
    }

    pub fn responding(mut self, prefix: &str, stdout: &str) -> Self {
        self.responses
            .push((prefix.to_string(), Response::Stdout(stdout.to_string())));
        self
    }

    pub fn failing(self, prefix: &str) -> Self {
        self.failing_with(prefix, 1)
    }

    pub fn failing_with(mut self, prefix: &str, code: i32) -> Self {
        self.responses.push((prefix.to_string(), Response::Fail(code)));
        self
    }

    pub fn not_found(mut self, prefix: &str) -> Self {
        self.responses.push((prefix.to_string(), Response::NotFound));
        self
    }

    pub fn timing_out(mut self, prefix: &str) -> Self {
        self.responses.push((prefix.to_string(), Response::TimedOut));
        self
    }

    pub fn missing(mut self, path: &str) -> Self {
        self.missing.insert(path.to_string());
        self
    }

    /// Existence of `path` cannot be checked (permission denied).
    pub fn unreadable(mut self, path: &str) -> Self {
        self.unreadable.insert(path.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(Invocation::command_line).collect()
    }

    /// Index of the first call starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.command_lines().iter().position(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// `acquired ...` / `released ...` hook calls in order
    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn response_for(&self, line: &str) -> Option<&Response> {
        self.responses
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, response)| response)
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, inv: &Invocation) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(inv.clone());
        let line = inv.command_line();
        match self.response_for(&line) {
            None | Some(Response::TimedOut) => Ok(CommandOutput::default()),
            Some(Response::Stdout(out)) => Ok(CommandOutput::with_stdout(out.clone())),
            Some(Response::Fail(code)) => Err(LvmRootfsError::CommandFailed {
                command: line,
                exit_code: Some(*code),
                stderr: "simulated failure".to_string(),
            }),
            Some(Response::NotFound) => Err(LvmRootfsError::CommandNotFound(inv.program.clone())),
        }
    }

    fn probe(&self, inv: &Invocation, _timeout: Duration) -> ProbeOutcome {
        if let Some(Response::TimedOut) = self.response_for(&inv.command_line()) {
            self.calls.borrow_mut().push(inv.clone());
            return ProbeOutcome::TimedOut;
        }
        probe_by_execute(self, inv)
    }

    fn file_exists(&self, path: &Path) -> std::io::Result<bool> {
        let path = path.to_string_lossy();
        if self.unreadable.contains(path.as_ref()) {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        }
        Ok(!self.missing.contains(path.as_ref()))
    }

    fn pause(&self, _duration: Duration) {}

    fn acquired(&self, resource: &Resource) {
        self.events.borrow_mut().push(format!("acquired {}", resource));
    }

    fn released(&self, resource: &Resource) {
        self.events.borrow_mut().push(format!("released {}", resource));
    }
}
