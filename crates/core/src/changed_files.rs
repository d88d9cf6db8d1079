use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Paths touched by an event, bucketed by kind of change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFiles {
    pub all: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub modified: Vec<String>,
    pub renamed: Vec<String>,
}

impl ChangedFiles {
    /// Deduplicate every bucket in place, keeping the first occurrence.
    pub fn remove_duplicates(&mut self) {
        for bucket in
            [&mut self.all, &mut self.added, &mut self.deleted, &mut self.modified, &mut self.renamed]
        {
            unique_in_order(bucket);
        }
    }

    pub fn is_empty(&self) -> bool { self.all.is_empty() }
}

fn unique_in_order(items: &mut Vec<String>) {
    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|item| seen.insert(item.clone()));
}
