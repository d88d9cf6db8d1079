//! Prow-style `OWNERS` / `OWNERS_ALIASES` access lists and control comment matching.

use std::{
    collections::{HashMap, HashSet},
    sync::OnceLock,
};

use regex::Regex;
use serde::Deserialize;

/// A `/ok-to-test` alone on its own line. Leading whitespace does not match.
pub const OK_TO_TEST_COMMENT_REGEXP: &str = r"(^|\n)/ok-to-test(\r\n|\r|\n|$)";

#[derive(Debug, thiserror::Error)]
pub enum OwnersError {
    #[error("cannot parse OWNERS file: {0}")]
    Owners(#[source] serde_yaml::Error),
    #[error("cannot parse OWNERS_ALIASES file: {0}")]
    Aliases(#[source] serde_yaml::Error),
}

#[derive(Debug, Default, Deserialize)]
struct OwnersFile {
    #[serde(default)]
    approvers: Option<Vec<String>>,
    #[serde(default)]
    reviewers: Option<Vec<String>>,
    #[serde(default)]
    filters: Option<HashMap<String, OwnersFilter>>,
}

#[derive(Debug, Default, Deserialize)]
struct OwnersFilter {
    #[serde(default)]
    approvers: Option<Vec<String>>,
    #[serde(default)]
    reviewers: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct AliasesFile {
    #[serde(default)]
    aliases: Option<HashMap<String, Vec<String>>>,
}

fn is_empty_document(content: &str) -> bool {
    content.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line == "---" || line.starts_with('#')
    })
}

fn parse_owners(content: &str) -> Result<OwnersFile, OwnersError> {
    if is_empty_document(content) {
        return Ok(OwnersFile::default());
    }
    serde_yaml::from_str(content).map_err(OwnersError::Owners)
}

fn parse_aliases(content: &str) -> Result<HashMap<String, Vec<String>>, OwnersError> {
    if is_empty_document(content) {
        return Ok(HashMap::new());
    }
    let file: AliasesFile = serde_yaml::from_str(content).map_err(OwnersError::Aliases)?;
    Ok(file.aliases.unwrap_or_default())
}

impl OwnersFile {
    /// Top-level lists win when non-empty, otherwise the `.*` filter applies.
    fn owners(self) -> Vec<String> {
        let mut top = self.approvers.unwrap_or_default();
        top.extend(self.reviewers.unwrap_or_default());
        if !top.is_empty() {
            return top;
        }
        let Some(mut filter) = self.filters.and_then(|mut f| f.remove(".*")) else {
            return vec![];
        };
        let mut out = filter.approvers.take().unwrap_or_default();
        out.extend(filter.reviewers.take().unwrap_or_default());
        out
    }
}

/// Replace alias names with their members, dropping duplicates. Order is not significant.
pub fn expand_aliases(names: &[String], aliases: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in names {
        match aliases.get(name) {
            Some(members) => {
                for member in members {
                    if seen.insert(member.as_str()) {
                        out.push(member.clone());
                    }
                }
            }
            None => {
                if seen.insert(name.as_str()) {
                    out.push(name.clone());
                }
            }
        }
    }
    out
}

/// Whether `sender` is an approver or reviewer once aliases are expanded.
pub fn user_in_owner_file(owners: &str, aliases: &str, sender: &str) -> Result<bool, OwnersError> {
    let owners = parse_owners(owners)?.owners();
    let aliases = parse_aliases(aliases)?;
    Ok(expand_aliases(&owners, &aliases).iter().any(|owner| owner == sender))
}

/// Whether `pattern` matches anywhere in `body`. An invalid pattern never matches.
pub fn match_regexp(pattern: &str, body: &str) -> bool {
    match Regex::new(pattern) {
        Ok(regex) => regex.is_match(body),
        Err(err) => {
            tracing::warn!("Invalid ACL pattern {pattern:?}: {err}");
            false
        }
    }
}

/// Strict `/ok-to-test` check used when scanning pull request comments.
pub fn is_ok_to_test(body: &str) -> bool {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(OK_TO_TEST_COMMENT_REGEXP).unwrap()).is_match(body)
}
