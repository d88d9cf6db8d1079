//! GitOps commands posted as pull request comments (`/test`, `/retest`,
//! `/cancel`, `/ok-to-test`).

use std::{fmt, sync::OnceLock};

use regex::Regex;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentEventType {
    NoOps,
    TestAll,
    TestSingle,
    RetestAll,
    RetestSingle,
    CancelAll,
    CancelSingle,
    OkToTest,
}

impl CommentEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommentEventType::NoOps => "no-ops-comment",
            CommentEventType::TestAll => "test-all-comment",
            CommentEventType::TestSingle => "test-comment",
            CommentEventType::RetestAll => "retest-all-comment",
            CommentEventType::RetestSingle => "retest-comment",
            CommentEventType::CancelAll => "cancel-all-comment",
            CommentEventType::CancelSingle => "cancel-comment",
            CommentEventType::OkToTest => "ok-to-test-comment",
        }
    }

    /// Whether an event type string names one of the comment commands.
    pub fn is_ops_event_type(event_type: &str) -> bool {
        [
            CommentEventType::TestAll,
            CommentEventType::TestSingle,
            CommentEventType::RetestAll,
            CommentEventType::RetestSingle,
            CommentEventType::CancelAll,
            CommentEventType::CancelSingle,
            CommentEventType::OkToTest,
        ]
        .iter()
        .any(|t| t.as_str() == event_type)
    }
}

impl fmt::Display for CommentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Compiled command patterns for one command prefix.
#[derive(Debug, Clone)]
pub struct CommentCommands {
    prefix: String,
    retest_all: Regex,
    retest_single: Regex,
    test_all: Regex,
    test_single: Regex,
    ok_to_test: Regex,
    cancel_all: Regex,
    cancel_single: Regex,
}

impl CommentCommands {
    pub fn new(prefix: &str) -> Result<Self, regex::Error> {
        let p = regex::escape(prefix);
        let all = |cmd: &str| Regex::new(&format!(r"(?m)^\s*{p}{cmd}\s*$"));
        let single = |cmd: &str| Regex::new(&format!(r"(?m)^\s*{p}{cmd}[ \t]+\S+"));
        Ok(Self {
            prefix: prefix.to_string(),
            retest_all: all("retest")?,
            retest_single: single("retest")?,
            test_all: all("test")?,
            test_single: single("test")?,
            ok_to_test: Regex::new(&format!(
                r"(^|\n)\s*{p}ok-to-test(?:\s+([a-fA-F0-9]{{7,40}}))?\s*(\r\n|\r|\n|$)"
            ))?,
            cancel_all: all("cancel")?,
            cancel_single: single("cancel")?,
        })
    }

    /// Commands with the default `/` prefix.
    pub fn default_prefix() -> &'static CommentCommands {
        static COMMANDS: OnceLock<CommentCommands> = OnceLock::new();
        COMMANDS.get_or_init(|| CommentCommands::new("/").unwrap())
    }

    pub fn prefix(&self) -> &str { &self.prefix }

    pub fn classify(&self, comment: &str) -> CommentEventType {
        if self.retest_all.is_match(comment) {
            CommentEventType::RetestAll
        } else if self.retest_single.is_match(comment) {
            CommentEventType::RetestSingle
        } else if self.test_all.is_match(comment) {
            CommentEventType::TestAll
        } else if self.test_single.is_match(comment) {
            CommentEventType::TestSingle
        } else if self.ok_to_test.is_match(comment) {
            CommentEventType::OkToTest
        } else if self.cancel_all.is_match(comment) {
            CommentEventType::CancelAll
        } else if self.cancel_single.is_match(comment) {
            CommentEventType::CancelSingle
        } else {
            CommentEventType::NoOps
        }
    }

    pub fn is_test_retest(&self, comment: &str) -> bool {
        self.test_single.is_match(comment)
            || self.test_all.is_match(comment)
            || self.retest_single.is_match(comment)
            || self.retest_all.is_match(comment)
    }

    pub fn is_ok_to_test(&self, comment: &str) -> bool { self.ok_to_test.is_match(comment) }

    pub fn is_cancel(&self, comment: &str) -> bool {
        self.cancel_all.is_match(comment) || self.cancel_single.is_match(comment)
    }

    /// Any command this controller reacts to.
    pub fn is_command(&self, comment: &str) -> bool {
        self.is_test_retest(comment) || self.is_ok_to_test(comment) || self.is_cancel(comment)
    }

    /// The optional commit in `/ok-to-test <sha>`.
    pub fn ok_to_test_sha(&self, comment: &str) -> Option<String> {
        let captures = self.ok_to_test.captures(comment)?;
        captures.get(2).map(|m| m.as_str().trim().to_string())
    }

    /// Set the synthetic event type and command targets on `event`.
    pub fn apply(&self, event: &mut Event, comment: &str) {
        let kind = self.classify(comment);
        match kind {
            CommentEventType::RetestSingle => {
                event.target_test_pipeline_run = self.target_name("retest", comment);
            }
            CommentEventType::TestSingle => {
                event.target_test_pipeline_run = self.target_name("test", comment);
            }
            CommentEventType::CancelSingle => {
                event.cancel_pipeline_runs = true;
                event.target_cancel_pipeline_run = self.target_name("cancel", comment);
            }
            CommentEventType::CancelAll => event.cancel_pipeline_runs = true,
            _ => {}
        }
        event.event_type = kind.as_str().to_string();
        event.trigger_comment = comment.to_string();
    }

    /// Pipeline run named right after `<prefix><command>` on the same line.
    pub fn target_name(&self, command: &str, comment: &str) -> String {
        let command = format!("{}{command}", self.prefix);
        let Some((_, rest)) = comment.trim().split_once(&command) else {
            return String::new();
        };
        let first_line = rest.split('\n').next().unwrap_or_default();
        first_line.split(' ').nth(1).map(|name| name.trim().to_string()).unwrap_or_default()
    }
}
