//! Immutable, versioned views of the issue data handed to the UI.
//!
//! A [`Snapshot`] is built once by a [`SnapshotBuilder`] and never mutated
//! after the worker publishes it behind an `Arc`. Its Phase 1 analysis is
//! ready when `build()` returns; Phase 2 completes later on the shared
//! [`GraphStats`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jiff::Timestamp;

use crate::analysis::graph::GraphStats;
use crate::analysis::{IssueDiff, IssueDiffStats};
use crate::loader::{PooledIssues, estimate_issue_bytes};
use crate::recipe::{Recipe, has_open_blocker};
use crate::types::{Issue, Status};

/// Incremental list rebuilds are used up to this change ratio.
pub const INCREMENTAL_LIST_MAX_CHANGE_RATIO: f64 = 0.2;

/// Performance tier chosen from the source record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DatasetTier {
    #[default]
    Unknown,
    Small,
    Medium,
    Large,
    Huge,
}

impl DatasetTier {
    pub fn for_count(total: usize) -> Self {
        match total {
            0 => DatasetTier::Unknown,
            1..1_000 => DatasetTier::Small,
            1_000..5_000 => DatasetTier::Medium,
            5_000..20_000 => DatasetTier::Large,
            _ => DatasetTier::Huge,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetTier::Unknown => "unknown",
            DatasetTier::Small => "small",
            DatasetTier::Medium => "medium",
            DatasetTier::Large => "large",
            DatasetTier::Huge => "huge",
        }
    }
}

impl fmt::Display for DatasetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which optional derived structures a build computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotBuildConfig {
    pub precompute_layout: bool,
    pub precompute_tree: bool,
    pub skip_phase2: bool,
}

impl Default for SnapshotBuildConfig {
    fn default() -> Self {
        Self {
            precompute_layout: true,
            precompute_tree: true,
            skip_phase2: false,
        }
    }
}

impl SnapshotBuildConfig {
    pub fn for_tier(tier: DatasetTier) -> Self {
        match tier {
            DatasetTier::Large => Self {
                precompute_layout: false,
                precompute_tree: false,
                skip_phase2: false,
            },
            DatasetTier::Huge => Self {
                precompute_layout: false,
                precompute_tree: false,
                skip_phase2: true,
            },
            _ => Self::default(),
        }
    }
}

/// One row of the list view.
#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub priority: i32,
    pub repo_prefix: String,
    /// PageRank; 0 until Phase 2 scores are applied.
    pub graph_score: f64,
    pub impact: f64,
}

impl ListItem {
    fn new(issue: &Issue) -> Self {
        Self {
            id: issue.id.clone(),
            title: issue.title.clone(),
            status: issue.status.clone(),
            priority: issue.priority,
            repo_prefix: repo_prefix(&issue.id).to_string(),
            graph_score: 0.0,
            impact: 0.0,
        }
    }

    fn apply_scores(&mut self, stats: Option<&GraphStats>) {
        match stats {
            Some(stats) => {
                self.graph_score = stats.pagerank(&self.id);
                self.impact = stats.impact(&self.id);
            }
            None => {
                self.graph_score = 0.0;
                self.impact = 0.0;
            }
        }
    }
}

/// Blocker/dependent relationships for the graph view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphLayout {
    pub blockers: HashMap<String, Vec<String>>,
    pub dependents: HashMap<String, Vec<String>>,
    pub sorted_ids: Vec<String>,
}

/// Parent/child forest for the tree view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueTree {
    pub roots: Vec<String>,
    pub children: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct Snapshot {
    issues: PooledIssues,
    by_id: HashMap<String, usize>,
    view: Vec<usize>,
    analysis: Arc<GraphStats>,

    pub count_open: usize,
    pub count_ready: usize,
    pub count_blocked: usize,
    pub count_closed: usize,

    pub list_items: Vec<ListItem>,
    pub layout: Option<GraphLayout>,
    pub tree: Option<IssueTree>,

    pub created_at: Timestamp,
    created: Instant,

    pub data_hash: String,
    /// Assigned by the worker at publish time.
    pub version: u64,
    pub recipe_name: String,
    pub recipe_hash: String,

    pub tier: DatasetTier,
    /// Approximate record count of the source (line count), 0 if unknown.
    pub source_issue_count_hint: usize,
    pub loaded_open_only: bool,
    pub truncated_count: usize,
    pub large_dataset_warning: String,
    pub load_warning_count: usize,

    pub diff: Option<IssueDiff>,
    pub diff_stats: IssueDiffStats,
    pub incremental_list_used: bool,
}

impl Snapshot {
    /// All issues, newest first.
    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn get_issue(&self, id: &str) -> Option<&Issue> {
        self.by_id.get(id).and_then(|&i| self.issues.get(i))
    }

    /// Issues in the active recipe's view, in recipe order.
    pub fn view_issues(&self) -> impl Iterator<Item = &Issue> {
        self.view.iter().filter_map(|&i| self.issues.get(i))
    }

    pub fn view_len(&self) -> usize {
        self.view.len()
    }

    pub fn analysis(&self) -> &Arc<GraphStats> {
        &self.analysis
    }

    pub fn phase2_ready(&self) -> bool {
        self.analysis.is_phase2_ready()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// List items with Phase 2 scores filled in (zeros until Phase 2 is ready).
    pub fn scored_list_items(&self) -> Vec<ListItem> {
        let stats = self.phase2_ready().then_some(self.analysis.as_ref());
        self.list_items
            .iter()
            .cloned()
            .map(|mut item| {
                item.apply_scores(stats);
                item
            })
            .collect()
    }

    pub fn estimated_bytes(&self) -> u64 {
        estimate_issue_bytes(&self.issues)
    }
}

pub struct SnapshotBuilder<'a> {
    issues: PooledIssues,
    analysis: Option<Arc<GraphStats>>,
    recipe: Option<&'a Recipe>,
    config: SnapshotBuildConfig,
    previous: Option<&'a Snapshot>,
    diff: Option<IssueDiff>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(issues: PooledIssues) -> Self {
        Self {
            issues,
            analysis: None,
            recipe: None,
            config: SnapshotBuildConfig::default(),
            previous: None,
            diff: None,
        }
    }

    /// Reuse analysis computed elsewhere instead of analyzing again.
    pub fn with_analysis(mut self, analysis: Arc<GraphStats>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn with_recipe(mut self, recipe: Option<&'a Recipe>) -> Self {
        self.recipe = recipe;
        self
    }

    pub fn with_build_config(mut self, config: SnapshotBuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables incremental list rebuilds when the change set is small.
    pub fn with_previous_snapshot(mut self, previous: &'a Snapshot, diff: IssueDiff) -> Self {
        self.previous = Some(previous);
        self.diff = Some(diff);
        self
    }

    pub fn build(self) -> Snapshot {
        let SnapshotBuilder {
            mut issues,
            analysis,
            recipe,
            config,
            previous,
            diff,
        } = self;

        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let provided_analysis = analysis.is_some();
        let analysis = analysis.unwrap_or_else(|| GraphStats::analyze(&issues, config.skip_phase2));

        let by_id: HashMap<String, usize> = issues
            .iter()
            .enumerate()
            .map(|(i, issue)| (issue.id.clone(), i))
            .collect();

        let counts = StatusCounts::compute(&issues, &by_id);

        let mut view: Vec<usize> = match recipe {
            Some(r) => (0..issues.len())
                .filter(|&i| r.matches(&issues[i], &by_id, &issues))
                .collect(),
            None => (0..issues.len()).collect(),
        };
        if let Some(r) = recipe {
            r.sort_indices(&mut view, &issues, Some(analysis.as_ref()));
        }

        let recipe_name = recipe.map(|r| r.name.clone()).unwrap_or_default();
        let recipe_hash = recipe.map(Recipe::fingerprint).unwrap_or_default();
        let diff_stats = diff.as_ref().map(IssueDiff::stats).unwrap_or_default();

        // Freshly started Phase 2 scores are applied later via `scored_list_items`.
        let list_stats = provided_analysis.then_some(analysis.as_ref());
        let incremental = match (previous, diff.as_ref()) {
            (Some(prev), Some(d)) if should_use_incremental(prev, &recipe_name, &recipe_hash, diff_stats) => {
                Some(build_list_items_incremental(&issues, &view, list_stats, &prev.list_items, d))
            }
            _ => None,
        };
        let incremental_list_used = incremental.is_some();
        let list_items = incremental.unwrap_or_else(|| build_list_items(&issues, &view, list_stats));

        let layout = config.precompute_layout.then(|| build_layout(&issues));
        let tree = config.precompute_tree.then(|| build_tree(&issues, &by_id));

        Snapshot {
            by_id,
            view,
            analysis,
            count_open: counts.open,
            count_ready: counts.ready,
            count_blocked: counts.blocked,
            count_closed: counts.closed,
            list_items,
            layout,
            tree,
            created_at: Timestamp::now(),
            created: Instant::now(),
            data_hash: String::new(),
            version: 0,
            recipe_name,
            recipe_hash,
            tier: DatasetTier::Unknown,
            source_issue_count_hint: 0,
            loaded_open_only: false,
            truncated_count: 0,
            large_dataset_warning: String::new(),
            load_warning_count: 0,
            diff,
            diff_stats,
            incremental_list_used,
            issues,
        }
    }
}

#[derive(Default)]
struct StatusCounts {
    open: usize,
    ready: usize,
    blocked: usize,
    closed: usize,
}

impl StatusCounts {
    fn compute(issues: &[Issue], by_id: &HashMap<String, usize>) -> Self {
        let mut c = StatusCounts::default();
        for issue in issues {
            if issue.status.is_closed_like() {
                c.closed += 1;
                continue;
            }
            c.open += 1;
            if issue.status == Status::Blocked {
                c.blocked += 1;
            } else if !has_open_blocker(issue, by_id, issues) {
                c.ready += 1;
            }
        }
        c
    }
}

fn should_use_incremental(prev: &Snapshot, recipe_name: &str, recipe_hash: &str, stats: IssueDiffStats) -> bool {
    !prev.list_items.is_empty()
        && prev.recipe_name == recipe_name
        && prev.recipe_hash == recipe_hash
        && stats.total > 0
        && stats.ratio <= INCREMENTAL_LIST_MAX_CHANGE_RATIO
}

fn build_list_items(issues: &[Issue], view: &[usize], stats: Option<&GraphStats>) -> Vec<ListItem> {
    view.iter()
        .map(|&i| {
            let mut item = ListItem::new(&issues[i]);
            item.apply_scores(stats);
            item
        })
        .collect()
}

/// Reuse previous rows for unchanged issues; rebuild added and modified ones.
fn build_list_items_incremental(
    issues: &[Issue],
    view: &[usize],
    stats: Option<&GraphStats>,
    previous: &[ListItem],
    diff: &IssueDiff,
) -> Vec<ListItem> {
    let prev_by_id: HashMap<&str, &ListItem> = previous.iter().map(|it| (it.id.as_str(), it)).collect();
    let changed: HashSet<&str> = diff
        .added
        .iter()
        .chain(&diff.modified)
        .map(String::as_str)
        .collect();

    view.iter()
        .map(|&i| {
            let issue = &issues[i];
            let mut item = match prev_by_id.get(issue.id.as_str()) {
                Some(prev) if !changed.contains(issue.id.as_str()) => (*prev).clone(),
                _ => ListItem::new(issue),
            };
            item.apply_scores(stats);
            item
        })
        .collect()
}

fn build_layout(issues: &[Issue]) -> GraphLayout {
    let mut layout = GraphLayout::default();
    for issue in issues {
        layout.sorted_ids.push(issue.id.clone());
        for dep in issue.blocking_dependency_ids() {
            layout
                .blockers
                .entry(issue.id.clone())
                .or_default()
                .push(dep.to_string());
            layout
                .dependents
                .entry(dep.to_string())
                .or_default()
                .push(issue.id.clone());
        }
    }
    layout.sorted_ids.sort_unstable();
    layout
}

fn build_tree(issues: &[Issue], by_id: &HashMap<String, usize>) -> IssueTree {
    let mut tree = IssueTree::default();
    for issue in issues {
        match issue.parent_id().filter(|p| *p != issue.id && by_id.contains_key(*p)) {
            Some(parent) => tree
                .children
                .entry(parent.to_string())
                .or_default()
                .push(issue.id.clone()),
            None => tree.roots.push(issue.id.clone()),
        }
    }
    tree
}

/// `bw-123` -> `bw`. IDs without a dash have no prefix.
fn repo_prefix(id: &str) -> &str {
    id.split_once('-').map(|(p, _)| p).unwrap_or("")
}

/// `1234` -> `1k`, `2500000` -> `2m`.
pub fn compact_count(n: usize) -> String {
    match n {
        1_000_000.. => format!("{}m", n / 1_000_000),
        1_000.. => format!("{}k", n / 1_000),
        _ => n.to_string(),
    }
}

/// Footer warning for large and huge datasets; empty for smaller tiers.
pub fn large_dataset_warning(tier: DatasetTier, source_hint: usize, loaded: usize, open_only: bool) -> String {
    let total = if source_hint > 0 { source_hint } else { loaded };
    match tier {
        DatasetTier::Large => format!("⚠ large {} issues", compact_count(total)),
        DatasetTier::Huge if open_only && source_hint > 0 => format!(
            "⚠ huge open-only {}/{}",
            compact_count(loaded),
            compact_count(source_hint)
        ),
        DatasetTier::Huge => format!("⚠ huge {} issues", compact_count(total)),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{RecipeFilters, SortConfig, SortDirection};
    use crate::types::{Dependency, DependencyType};

    fn issue(id: &str, status: Status, blocked_by: &[&str], created: i64) -> Issue {
        Issue {
            id: id.to_string(),
            title: id.to_uppercase(),
            status,
            created_at: Timestamp::from_second(created).ok(),
            dependencies: blocked_by
                .iter()
                .map(|d| Dependency {
                    issue_id: id.to_string(),
                    depends_on_id: d.to_string(),
                    dep_type: DependencyType::Blocks,
                    created_by: String::new(),
                })
                .collect(),
            ..Issue::default()
        }
    }

    fn sample() -> Vec<Issue> {
        vec![
            issue("bw-1", Status::Open, &[], 100),
            issue("bw-2", Status::Open, &["bw-1"], 200),
            issue("bw-3", Status::Closed, &[], 300),
            issue("bw-4", Status::Blocked, &[], 400),
            issue("bw-5", Status::Open, &["bw-3"], 500),
        ]
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(DatasetTier::for_count(0), DatasetTier::Unknown);
        assert_eq!(DatasetTier::for_count(999), DatasetTier::Small);
        assert_eq!(DatasetTier::for_count(1_000), DatasetTier::Medium);
        assert_eq!(DatasetTier::for_count(19_999), DatasetTier::Large);
        assert_eq!(DatasetTier::for_count(20_000), DatasetTier::Huge);
        assert!(SnapshotBuildConfig::for_tier(DatasetTier::Huge).skip_phase2);
        assert!(!SnapshotBuildConfig::for_tier(DatasetTier::Large).precompute_layout);
        assert_eq!(SnapshotBuildConfig::for_tier(DatasetTier::Small), SnapshotBuildConfig::default());
    }

    #[test]
    fn test_warning_strings() {
        assert_eq!(large_dataset_warning(DatasetTier::Large, 25_000, 0, false), "⚠ large 25k issues");
        assert_eq!(
            large_dataset_warning(DatasetTier::Huge, 40_000, 3_200, true),
            "⚠ huge open-only 3k/40k"
        );
        assert_eq!(large_dataset_warning(DatasetTier::Huge, 0, 2_500_000, false), "⚠ huge 2m issues");
        assert!(large_dataset_warning(DatasetTier::Medium, 2_000, 2_000, false).is_empty());
    }

    #[tokio::test]
    async fn test_build_counts_sort_and_lookup() {
        let snap = SnapshotBuilder::new(PooledIssues::detached(sample())).build();

        assert_eq!(snap.len(), 5);
        assert_eq!(snap.issues()[0].id, "bw-5", "newest first");
        assert_eq!(snap.count_closed, 1);
        assert_eq!(snap.count_open, 4);
        assert_eq!(snap.count_blocked, 1);
        // bw-1 and bw-5 (its blocker is closed); bw-2 waits on bw-1
        assert_eq!(snap.count_ready, 2);
        assert_eq!(snap.get_issue("bw-3").map(|i| i.status.clone()), Some(Status::Closed));
        assert!(snap.get_issue("nope").is_none());

        let layout = snap.layout.as_ref().unwrap();
        assert_eq!(layout.dependents["bw-1"], vec!["bw-2"]);
        assert_eq!(snap.tree.as_ref().unwrap().roots.len(), 5);

        snap.analysis().wait_for_phase2().await;
        assert!(snap.phase2_ready());
        let scored = snap.scored_list_items();
        let bw1 = scored.iter().find(|i| i.id == "bw-1").unwrap();
        assert!(bw1.graph_score > 0.0);
        assert_eq!(bw1.repo_prefix, "bw");
    }

    #[tokio::test]
    async fn test_recipe_view_filters_and_sorts() {
        let recipe = Recipe {
            name: "open-work".to_string(),
            filters: RecipeFilters {
                status: vec!["open".to_string()],
                ..RecipeFilters::default()
            },
            sort: SortConfig {
                field: "priority".to_string(),
                direction: SortDirection::Desc,
            },
            ..Recipe::default()
        };
        let snap = SnapshotBuilder::new(PooledIssues::detached(sample()))
            .with_recipe(Some(&recipe))
            .build();

        let ids: Vec<_> = snap.view_issues().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bw-1", "bw-2", "bw-5"]);
        assert_eq!(snap.list_items.len(), 3);
        assert_eq!(snap.recipe_name, "open-work");
        assert_eq!(snap.recipe_hash, recipe.fingerprint());
    }

    #[test]
    fn test_incremental_list_used_for_small_change() {
        let base: Vec<Issue> = (0..10).map(|i| issue(&format!("bw-{i}"), Status::Open, &[], i)).collect();
        let cfg = SnapshotBuildConfig {
            skip_phase2: true,
            ..SnapshotBuildConfig::default()
        };
        let first = SnapshotBuilder::new(PooledIssues::detached(base.clone()))
            .with_build_config(cfg)
            .build();

        let mut next = base.clone();
        next[4].title = "renamed".to_string();
        let diff = IssueDiff::compute(first.issues(), &next);
        let second = SnapshotBuilder::new(PooledIssues::detached(next))
            .with_build_config(cfg)
            .with_previous_snapshot(&first, diff)
            .build();
        assert!(second.incremental_list_used);
        assert_eq!(second.diff_stats.changed, 1);
        let renamed = second.list_items.iter().find(|i| i.id == "bw-4").unwrap();
        assert_eq!(renamed.title, "renamed");

        let mut many = base;
        for issue in many.iter_mut().take(5) {
            issue.priority = 0;
        }
        let diff = IssueDiff::compute(second.issues(), &many);
        let third = SnapshotBuilder::new(PooledIssues::detached(many))
            .with_build_config(cfg)
            .with_previous_snapshot(&second, diff)
            .build();
        assert!(!third.incremental_list_used);
    }

    #[test]
    fn test_huge_tier_skips_phase2() {
        let snap = SnapshotBuilder::new(PooledIssues::detached(sample()))
            .with_build_config(SnapshotBuildConfig::for_tier(DatasetTier::Huge))
            .build();
        assert!(snap.phase2_ready());
        assert!(snap.layout.is_none());
        assert!(snap.tree.is_none());
    }

    #[test]
    fn test_parent_child_tree() {
        let mut child = issue("bw-2", Status::Open, &[], 2);
        child.dependencies.push(Dependency {
            issue_id: "bw-2".to_string(),
            depends_on_id: "bw-1".to_string(),
            dep_type: DependencyType::ParentChild,
            created_by: String::new(),
        });
        let snap = SnapshotBuilder::new(PooledIssues::detached(vec![issue("bw-1", Status::Open, &[], 1), child]))
            .with_build_config(SnapshotBuildConfig {
                skip_phase2: true,
                ..SnapshotBuildConfig::default()
            })
            .build();
        let tree = snap.tree.as_ref().unwrap();
        assert_eq!(tree.roots, vec!["bw-1"]);
        assert_eq!(tree.children["bw-1"], vec!["bw-2"]);
    }
}
