// packages/proclaunch/src/runtime/matching.rs
//! Matchers and rewriters for the factory chain
//!
//! A factory only accepts a launch when its [`Matcher`] says so. A
//! [`Rewriter`] may then transform the configuration before the backend is
//! built (e.g. wrapping the program in a debugger).

use crate::runtime::process_info::ProcessInfo;
use serde_json::Value;
use tracing::debug;

/// Decides whether a factory handles a configuration. Must be pure.
pub trait Matcher: Send + Sync {
    fn matches(&self, info: &ProcessInfo) -> bool;
}

/// Transforms a configuration before launch. Must be total.
pub trait Rewriter: Send + Sync {
    fn rewrite(&self, info: ProcessInfo) -> ProcessInfo;
}

impl<F> Matcher for F
where
    F: Fn(&ProcessInfo) -> bool + Send + Sync,
{
    fn matches(&self, info: &ProcessInfo) -> bool {
        self(info)
    }
}

impl<F> Rewriter for F
where
    F: Fn(ProcessInfo) -> ProcessInfo + Send + Sync,
{
    fn rewrite(&self, info: ProcessInfo) -> ProcessInfo {
        self(info)
    }
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Matcher for MatchAll {
    fn matches(&self, _info: &ProcessInfo) -> bool {
        true
    }
}

/// Matches records that carry `key`, and, when `value` is set, whose
/// value for `key` equals it
#[derive(Debug, Clone)]
pub struct KeyMatcher {
    pub key: String,
    pub value: Option<Value>,
}

impl KeyMatcher {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl Matcher for KeyMatcher {
    fn matches(&self, info: &ProcessInfo) -> bool {
        match (info.value(&self.key), &self.value) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == *expected,
        }
    }
}

/// Runs the program under `gdb --`
#[derive(Debug, Clone, Copy, Default)]
pub struct GdbRewriter;

impl Rewriter for GdbRewriter {
    fn rewrite(&self, mut info: ProcessInfo) -> ProcessInfo {
        debug!("Wrapping {} in gdb", info.program);
        let program = std::mem::replace(&mut info.program, "gdb".to_string());
        let mut arguments = Vec::with_capacity(info.arguments.len() + 2);
        arguments.push("--".to_string());
        arguments.push(program);
        arguments.append(&mut info.arguments);
        info.arguments = arguments;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_matcher() {
        let mut info = ProcessInfo::new("sleep");
        let has_pipe = KeyMatcher::new("pipe");
        let pipe_true = KeyMatcher::new("pipe").with_value("true");

        assert!(!has_pipe.matches(&info));

        info.set_value("pipe", json!("false")).unwrap();
        assert!(has_pipe.matches(&info));
        assert!(!pipe_true.matches(&info));

        info.set_value("pipe", json!("true")).unwrap();
        assert!(pipe_true.matches(&info));
    }

    #[test]
    fn test_key_matcher_on_recognized_field() {
        let matcher = KeyMatcher::new("program").with_value("/bin/cat");
        assert!(matcher.matches(&ProcessInfo::new("/bin/cat")));
        assert!(!matcher.matches(&ProcessInfo::new("/bin/echo")));
    }

    #[test]
    fn test_closures() {
        let only_sleep = |info: &ProcessInfo| info.program == "sleep";
        assert!(only_sleep.matches(&ProcessInfo::new("sleep")));
        assert!(!only_sleep.matches(&ProcessInfo::new("cat")));

        let nice = |info: ProcessInfo| info.with_priority(10);
        assert_eq!(nice.rewrite(ProcessInfo::new("cat")).priority, Some(10));
    }

    #[test]
    fn test_gdb_rewrite() {
        let info = ProcessInfo::new("/usr/bin/abc").with_arguments(["a", "b"]);
        let info = GdbRewriter.rewrite(info);
        assert_eq!(info.program, "gdb");
        assert_eq!(info.arguments, vec!["--", "/usr/bin/abc", "a", "b"]);
    }
}
