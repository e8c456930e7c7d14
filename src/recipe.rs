//! View recipes: a named filter + sort applied when building a snapshot.
//!
//! Recipes are plain data loaded from YAML. The worker only cares about a
//! recipe's identity (its name and [`Recipe::fingerprint`]); changing either
//! forces a rebuild so the view list is recomputed off the UI thread.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::graph::GraphStats;
use crate::error::{BeadworkError, Result};
use crate::types::{Issue, Status};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub filters: RecipeFilters,

    #[serde(default)]
    pub sort: SortConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecipeFilters {
    /// Any-of status match. `closed` also matches tombstoned issues.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<String>,

    /// Any-of priority match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority: Vec<i32>,

    /// All-of label match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// None-of label match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,

    /// `Some(true)` keeps only issues without open blockers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actionable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortConfig {
    /// `priority`, `created`, `updated`, `pagerank`, `impact`. Empty keeps the default order.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,

    #[serde(default)]
    pub direction: SortDirection,
}

impl Recipe {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let recipe: Recipe = serde_yaml_ng::from_str(content)?;
        if recipe.name.trim().is_empty() {
            return Err(BeadworkError::Config("recipe has no name".to_string()));
        }
        Ok(recipe)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Stable content fingerprint (hex blake3 of the JSON encoding).
    pub fn fingerprint(&self) -> String {
        match serde_json::to_vec(self) {
            Ok(bytes) => blake3::hash(&bytes).to_hex().to_string(),
            Err(_) => self.name.clone(),
        }
    }

    /// Whether the status filter asks for closed or tombstoned issues.
    pub fn includes_closed_statuses(&self) -> bool {
        self.filters.status.iter().any(|s| {
            let s = s.trim().to_lowercase();
            s == "closed" || s == "tombstone"
        })
    }

    pub fn matches(&self, issue: &Issue, by_id: &HashMap<String, usize>, issues: &[Issue]) -> bool {
        let f = &self.filters;

        if !f.status.is_empty() && !f.status.iter().any(|s| status_matches(&issue.status, s)) {
            return false;
        }
        if !f.priority.is_empty() && !f.priority.contains(&issue.priority) {
            return false;
        }
        if !f.tags.iter().all(|t| issue.labels.contains(t)) {
            return false;
        }
        if f.exclude_tags.iter().any(|t| issue.labels.contains(t)) {
            return false;
        }
        if f.actionable == Some(true) && has_open_blocker(issue, by_id, issues) {
            return false;
        }
        true
    }

    /// Sort in place by the configured field, ties broken by ID.
    pub fn sort_issues(&self, issues: &mut [Issue], stats: Option<&GraphStats>) {
        if self.sort.field.is_empty() {
            return;
        }
        let field = self.sort.field.to_lowercase();
        issues.sort_by(|a, b| self.compare(&field, a, b, stats));
    }

    /// Like [`Recipe::sort_issues`], for a list of indices into `issues`.
    pub fn sort_indices(&self, view: &mut [usize], issues: &[Issue], stats: Option<&GraphStats>) {
        if self.sort.field.is_empty() {
            return;
        }
        let field = self.sort.field.to_lowercase();
        view.sort_by(|&a, &b| self.compare(&field, &issues[a], &issues[b], stats));
    }

    fn compare(&self, field: &str, a: &Issue, b: &Issue, stats: Option<&GraphStats>) -> Ordering {
        let ord = compare_by_field(field, a, b, stats);
        let ord = match self.sort.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        ord.then_with(|| a.id.cmp(&b.id))
    }
}

fn compare_by_field(field: &str, a: &Issue, b: &Issue, stats: Option<&GraphStats>) -> Ordering {
    match (field, stats) {
        ("created" | "created_at", _) => a.created_at.cmp(&b.created_at),
        ("updated" | "updated_at", _) => a.updated_at.cmp(&b.updated_at),
        ("pagerank", Some(stats)) => stats
            .pagerank(&a.id)
            .partial_cmp(&stats.pagerank(&b.id))
            .unwrap_or(Ordering::Equal),
        ("impact", Some(stats)) => stats
            .impact(&a.id)
            .partial_cmp(&stats.impact(&b.id))
            .unwrap_or(Ordering::Equal),
        _ => a.priority.cmp(&b.priority),
    }
}

/// Recipe status filter semantics: `closed` covers tombstones too.
pub fn status_matches(status: &Status, filter: &str) -> bool {
    let filter = filter.trim().to_lowercase();
    match filter.as_str() {
        "closed" => status.is_closed_like(),
        _ => status.as_str().eq_ignore_ascii_case(&filter),
    }
}

/// True when any blocking dependency points at a present, not-closed issue.
pub fn has_open_blocker(issue: &Issue, by_id: &HashMap<String, usize>, issues: &[Issue]) -> bool {
    issue.blocking_dependency_ids().any(|dep| {
        by_id
            .get(dep)
            .and_then(|&i| issues.get(i))
            .is_some_and(|blocker| !blocker.status.is_closed_like())
    })
}
