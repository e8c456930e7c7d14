//! Content hashing and issue-level diffing between snapshots.

pub mod graph;

use std::collections::HashMap;

use jiff::Timestamp;

use crate::types::Issue;

/// Hash reported for an empty issue collection.
pub const EMPTY_HASH: &str = "empty";

/// Hex chars kept from the digest.
const HASH_PREFIX_LEN: usize = 16;

/// blake3 hasher that NUL-terminates every field.
struct FieldHasher(blake3::Hasher);

impl FieldHasher {
    fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.0.update(bytes.as_ref());
        self.0.update(&[0]);
        self
    }

    fn opt_ts(&mut self, ts: Option<Timestamp>) -> &mut Self {
        match ts {
            Some(ts) => self.field(ts.to_string()),
            None => self.field(b""),
        }
    }

    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    fn finish_prefix(&self) -> String {
        let hex = self.0.finalize().to_hex();
        hex.as_str()[..HASH_PREFIX_LEN].to_string()
    }
}

fn write_content(h: &mut FieldHasher, issue: &Issue) {
    h.field(&issue.title)
        .field(&issue.description)
        .field(&issue.notes)
        .field(&issue.design)
        .field(&issue.acceptance_criteria)
        .field(&issue.assignee)
        .field(&issue.source_repo)
        .field(issue.external_ref.as_deref().unwrap_or(""))
        .field(issue.status.as_str())
        .field(issue.issue_type.as_str())
        .field(issue.priority.to_string())
        .field(issue.estimated_minutes.map(|m| m.to_string()).unwrap_or_default())
        .opt_ts(issue.created_at)
        .opt_ts(issue.updated_at)
        .opt_ts(issue.closed_at);

    let mut labels: Vec<&str> = issue.labels.iter().map(String::as_str).collect();
    labels.sort_unstable();
    for label in labels {
        h.field(label);
    }
    h.raw(&[0]);

    let mut comments: Vec<(String, &str, &str)> = issue
        .comments
        .iter()
        .map(|c| {
            let at = c.created_at.map(|t| t.to_string()).unwrap_or_default();
            (at, c.author.as_str(), c.text.as_str())
        })
        .collect();
    comments.sort();
    for (at, author, text) in comments {
        h.field(at).field(author).field(text);
    }
    h.raw(&[0]);
}

fn write_dependencies(h: &mut FieldHasher, issue: &Issue) {
    let mut deps: Vec<(&str, &str, &str)> = issue
        .dependencies
        .iter()
        .map(|d| (d.depends_on_id.as_str(), d.dep_type.as_str(), d.created_by.as_str()))
        .collect();
    deps.sort_unstable();
    for (on, kind, by) in deps {
        h.field(on).field(kind).field(by);
    }
    h.raw(&[0]);
}

/// Deterministic digest of the whole collection, independent of line order.
pub fn content_hash(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return EMPTY_HASH.to_string();
    }

    let mut sorted: Vec<&Issue> = issues.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut h = FieldHasher::new();
    for issue in sorted {
        h.field(&issue.id);
        write_content(&mut h, issue);
        write_dependencies(&mut h, issue);
        h.raw(&[1]);
    }
    h.finish_prefix()
}

/// Per-issue hash split into content and dependency halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueFingerprint {
    pub content: String,
    pub dependencies: String,
}

impl IssueFingerprint {
    pub fn of(issue: &Issue) -> Self {
        let mut content = FieldHasher::new();
        write_content(&mut content, issue);
        let mut deps = FieldHasher::new();
        write_dependencies(&mut deps, issue);
        Self {
            content: content.finish_prefix(),
            dependencies: deps.finish_prefix(),
        }
    }
}

/// ID-level change set between two issue collections. Every list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub content_changed: Vec<String>,
    pub dependency_changed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Change volume summary derived from an [`IssueDiff`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IssueDiffStats {
    pub changed: usize,
    pub total: usize,
    pub ratio: f64,
}

impl IssueDiff {
    pub fn compute(old: &[Issue], new: &[Issue]) -> Self {
        let old_fp: HashMap<&str, IssueFingerprint> =
            old.iter().map(|i| (i.id.as_str(), IssueFingerprint::of(i))).collect();
        let new_fp: HashMap<&str, IssueFingerprint> =
            new.iter().map(|i| (i.id.as_str(), IssueFingerprint::of(i))).collect();

        let mut diff = IssueDiff::default();
        for (id, fp) in &new_fp {
            let Some(prev) = old_fp.get(id) else {
                diff.added.push(id.to_string());
                continue;
            };
            let content = prev.content != fp.content;
            let deps = prev.dependencies != fp.dependencies;
            if content || deps {
                diff.modified.push(id.to_string());
                if content {
                    diff.content_changed.push(id.to_string());
                }
                if deps {
                    diff.dependency_changed.push(id.to_string());
                }
            } else {
                diff.unchanged.push(id.to_string());
            }
        }
        diff.removed = old_fp
            .keys()
            .filter(|id| !new_fp.contains_key(*id))
            .map(|id| id.to_string())
            .collect();

        for list in [
            &mut diff.added,
            &mut diff.removed,
            &mut diff.modified,
            &mut diff.content_changed,
            &mut diff.dependency_changed,
            &mut diff.unchanged,
        ] {
            list.sort_unstable();
        }
        diff
    }

    pub fn stats(&self) -> IssueDiffStats {
        let changed = self.added.len() + self.removed.len() + self.modified.len();
        let total = changed + self.unchanged.len();
        let ratio = if total > 0 {
            changed as f64 / total as f64
        } else {
            0.0
        };
        IssueDiffStats { changed, total, ratio }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// First 16 chars of a hash, for log fields.
pub fn hash_prefix(hash: &str) -> &str {
    match hash.char_indices().nth(HASH_PREFIX_LEN) {
        Some((i, _)) => &hash[..i],
        None => hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dependency, Status};

    fn issue(id: &str, title: &str) -> Issue {
        Issue {
            id: id.to_string(),
            title: title.to_string(),
            ..Issue::default()
        }
    }

    #[test]
    fn test_content_hash_ignores_order_and_label_order() {
        let mut a = issue("a", "A");
        a.labels = vec!["x".to_string(), "y".to_string()];
        let b = issue("b", "B");
        let first = content_hash(&[a.clone(), b.clone()]);

        a.labels.reverse();
        let second = content_hash(&[b, a]);
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn test_content_hash_empty_and_changes() {
        assert_eq!(content_hash(&[]), EMPTY_HASH);
        let before = content_hash(&[issue("a", "A")]);
        let mut changed = issue("a", "A");
        changed.status = Status::Closed;
        assert_ne!(before, content_hash(&[changed]));
    }

    #[test]
    fn test_diff_classifies_changes() {
        let old = vec![issue("a", "A"), issue("b", "B"), issue("c", "C")];

        let mut b2 = issue("b", "B");
        b2.dependencies.push(Dependency {
            issue_id: "b".to_string(),
            depends_on_id: "a".to_string(),
            ..Dependency::default()
        });
        let new = vec![issue("a", "A2"), b2, issue("d", "D")];

        let diff = IssueDiff::compute(&old, &new);
        assert_eq!(diff.added, vec!["d"]);
        assert_eq!(diff.removed, vec!["c"]);
        assert_eq!(diff.modified, vec!["a", "b"]);
        assert_eq!(diff.content_changed, vec!["a"]);
        assert_eq!(diff.dependency_changed, vec!["b"]);
        assert!(diff.unchanged.is_empty());

        let stats = diff.stats();
        assert_eq!(stats.changed, 4);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.ratio, 1.0);
    }

    #[test]
    fn test_diff_stats_ratio() {
        let old: Vec<_> = (0..10).map(|i| issue(&format!("i{i}"), "t")).collect();
        let mut new = old.clone();
        new[3].title = "changed".to_string();
        let diff = IssueDiff::compute(&old, &new);
        assert_eq!(diff.stats().changed, 1);
        assert!((diff.stats().ratio - 0.1).abs() < f64::EPSILON);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_hash_prefix() {
        assert_eq!(hash_prefix("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(hash_prefix("short"), "short");
    }
}
