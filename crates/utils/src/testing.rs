//! Recording fakes for the capability traits.
//!
//! These live in the library (not behind `cfg(test)`) so that downstream
//! crates can drive the engine hermetically in their own tests.

use std::cell::RefCell;
use std::collections::HashSet;

use anyhow::Result;

use crate::Runner;

type SideEffect = Box<dyn Fn(&str, &[&str]) -> Result<Vec<u8>>>;

/// A [`Runner`] that records every invocation and never touches the host.
///
/// By default every command succeeds with empty output; install a
/// side-effect closure to stub specific tools.
pub struct FakeRunner {
    calls: RefCell<Vec<Vec<String>>>,
    side_effect: RefCell<SideEffect>,
    missing: RefCell<HashSet<String>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            side_effect: RefCell::new(Box::new(|_, _| Ok(Vec::new()))),
            missing: RefCell::new(HashSet::new()),
        }
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the canned behavior for subsequent invocations.
    pub fn set_side_effect(
        &self,
        f: impl Fn(&str, &[&str]) -> Result<Vec<u8>> + 'static,
    ) {
        *self.side_effect.borrow_mut() = Box::new(f);
    }

    /// Pretend `cmd` is not installed.
    pub fn remove_command(&self, cmd: &str) {
        self.missing.borrow_mut().insert(cmd.to_string());
    }

    /// Every recorded invocation, command first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    /// Whether some invocation of `cmd` included `args` in order as a
    /// contiguous subsequence.
    pub fn called_with(&self, cmd: &str, args: &[&str]) -> bool {
        self.calls.borrow().iter().any(|call| {
            call.first().map(String::as_str) == Some(cmd)
                && (args.is_empty()
                    || call
                        .windows(args.len())
                        .any(|w| w.iter().map(String::as_str).eq(args.iter().copied())))
        })
    }

    /// Number of invocations of `cmd`.
    pub fn call_count(&self, cmd: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.first().map(String::as_str) == Some(cmd))
            .count()
    }
}

impl Runner for FakeRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut call = vec![cmd.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        self.calls.borrow_mut().push(call);
        (self.side_effect.borrow())(cmd, args)
    }

    fn command_exists(&self, cmd: &str) -> bool {
        !self.missing.borrow().contains(cmd)
    }
}
