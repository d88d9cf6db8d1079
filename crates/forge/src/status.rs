use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Event;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Conclusion {
    Success,
    Failure,
    #[default]
    Pending,
    Neutral,
    Skipped,
    Completed,
    Error,
    NotApplicable,
}

impl Conclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Pending => "pending",
            Conclusion::Neutral => "neutral",
            Conclusion::Skipped => "skipped",
            Conclusion::Completed => "completed",
            Conclusion::Error => "error",
            Conclusion::NotApplicable => "notApplicable",
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    InProgress,
    Completed,
}

/// A status (and possibly a PR comment) to publish for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOpts {
    pub conclusion: Conclusion,
    pub status: RunStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub details_url: String,
    #[serde(default)]
    pub pipeline_run_name: String,
    #[serde(default)]
    pub original_pipeline_run_name: String,
}

impl StatusOpts {
    pub fn is_in_progress(&self) -> bool { self.status == RunStatus::InProgress }
}

/// Settings shared by every forge's status publishing.
#[derive(Debug, Clone, Default)]
pub struct StatusSettings {
    pub application_name: String,
    pub skip_emoji: bool,
}

impl StatusSettings {
    /// Commit status label: `<app> / <run or title>`.
    pub fn status_key(&self, opts: &StatusOpts) -> String {
        let name =
            if opts.pipeline_run_name.is_empty() { &opts.title } else { &opts.pipeline_run_name };
        if self.application_name.is_empty() {
            name.clone()
        } else {
            format!("{} / {}", self.application_name, name)
        }
    }

    pub fn title(&self, title: &str) -> String {
        if self.skip_emoji { strip_emoji(title) } else { title.to_string() }
    }

    /// The comment to post next to a finished run's status, if any. Only
    /// successful completed runs on pull requests with a report get one.
    pub fn completion_comment(&self, event: &Event, opts: &StatusOpts) -> Option<String> {
        let succeeded = matches!(opts.conclusion, Conclusion::Success | Conclusion::Completed);
        if !event.is_pull_request()
            || event.pull_request_number == 0
            || !succeeded
            || opts.status != RunStatus::Completed
            || opts.text.is_empty()
        {
            return None;
        }
        let on_pr = if opts.original_pipeline_run_name.is_empty() {
            String::new()
        } else {
            format!("/{}", opts.original_pipeline_run_name)
        };
        Some(format!("**{}{on_pr}** - {}\n\n{}", self.application_name, opts.title, opts.text))
    }
}

/// Link attached to a status: the run's details page, else the repository.
pub fn target_url<'a>(event: &'a Event, opts: &'a StatusOpts) -> &'a str {
    if opts.details_url.is_empty() { &event.url } else { &opts.details_url }
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0x2190..=0x21FF | 0xFE0F | 0x200D)
}

/// Drop emoji and the whitespace they leave behind.
pub fn strip_emoji(s: &str) -> String {
    s.chars().filter(|c| !is_emoji(*c)).collect::<String>().trim().to_string()
}
