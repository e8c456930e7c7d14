//! Two-phase dependency graph analysis.
//!
//! Phase 1 (degrees, topological order, cycle flag) is computed synchronously
//! by [`GraphStats::analyze`] and is readable as soon as it returns. Phase 2
//! (PageRank and critical-path impact) runs on a background thread; callers
//! check [`GraphStats::is_phase2_ready`] or await
//! [`GraphStats::wait_for_phase2`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::thread;

use tokio::sync::watch;

use crate::types::Issue;

const PAGERANK_DAMPING: f64 = 0.85;
const PAGERANK_TOLERANCE: f64 = 1e-6;
const PAGERANK_MAX_ITERATIONS: usize = 100;

/// Metrics that become available once Phase 2 completes.
#[derive(Debug, Default)]
pub struct Phase2Metrics {
    pub pagerank: HashMap<String, f64>,
    /// Length of the longest chain of work this issue (transitively) blocks.
    pub critical_path: HashMap<String, f64>,
    /// Set when Phase 2 was skipped rather than computed.
    pub skipped: bool,
}

#[derive(Debug)]
pub struct GraphStats {
    /// Blocking dependencies this issue has.
    pub out_degree: HashMap<String, usize>,
    /// Issues that depend on this issue.
    pub in_degree: HashMap<String, usize>,
    /// Blockers before dependents. Issues on a cycle are omitted.
    pub topological_order: Vec<String>,
    pub has_cycle: bool,
    pub node_count: usize,
    pub edge_count: usize,
    pub density: f64,

    phase2: OnceLock<Phase2Metrics>,
    phase2_ready: watch::Sender<bool>,
}

/// Owned adjacency used by the Phase 2 thread. Indices match `ids`.
struct Adjacency {
    ids: Vec<String>,
    /// `blockers[i]` are the issues `i` depends on.
    blockers: Vec<Vec<usize>>,
    /// `dependents[i]` are the issues that depend on `i`.
    dependents: Vec<Vec<usize>>,
    topo: Vec<usize>,
}

impl GraphStats {
    /// Run Phase 1 now and start Phase 2 in the background (unless skipped).
    pub fn analyze(issues: &[Issue], skip_phase2: bool) -> Arc<GraphStats> {
        let adjacency = Adjacency::build(issues);
        let node_count = adjacency.ids.len();
        let edge_count: usize = adjacency.blockers.iter().map(Vec::len).sum();

        let mut out_degree = HashMap::with_capacity(node_count);
        let mut in_degree = HashMap::with_capacity(node_count);
        for (i, id) in adjacency.ids.iter().enumerate() {
            out_degree.insert(id.clone(), adjacency.blockers[i].len());
            in_degree.insert(id.clone(), adjacency.dependents[i].len());
        }

        let density = if node_count > 1 {
            edge_count as f64 / (node_count as f64 * (node_count as f64 - 1.0))
        } else {
            0.0
        };

        let (phase2_ready, _) = watch::channel(false);
        let stats = Arc::new(GraphStats {
            out_degree,
            in_degree,
            topological_order: adjacency.topo.iter().map(|&i| adjacency.ids[i].clone()).collect(),
            has_cycle: adjacency.topo.len() < node_count,
            node_count,
            edge_count,
            density,
            phase2: OnceLock::new(),
            phase2_ready,
        });

        if skip_phase2 {
            stats.complete_phase2(Phase2Metrics {
                skipped: true,
                ..Phase2Metrics::default()
            });
            return stats;
        }

        let worker = Arc::clone(&stats);
        let spawned = thread::Builder::new()
            .name("beadwork-phase2".to_string())
            .spawn(move || {
                let metrics = adjacency.compute_phase2();
                worker.complete_phase2(metrics);
            });
        if let Err(e) = spawned {
            tracing::warn!("phase 2 thread failed to start, computing inline: {e}");
            // The closure (and the adjacency it owned) is gone; rebuild.
            stats.complete_phase2(Adjacency::build(issues).compute_phase2());
        }

        stats
    }

    fn complete_phase2(&self, metrics: Phase2Metrics) {
        let _ = self.phase2.set(metrics);
        self.phase2_ready.send_replace(true);
    }

    pub fn is_phase2_ready(&self) -> bool {
        self.phase2.get().is_some()
    }

    /// Resolve once Phase 2 has completed (immediately if it already has).
    pub async fn wait_for_phase2(&self) {
        let mut rx = self.phase2_ready.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn phase2(&self) -> Option<&Phase2Metrics> {
        self.phase2.get()
    }

    /// PageRank score, 0 until Phase 2 completes.
    pub fn pagerank(&self, id: &str) -> f64 {
        self.phase2
            .get()
            .and_then(|m| m.pagerank.get(id).copied())
            .unwrap_or(0.0)
    }

    /// Critical-path impact, 0 until Phase 2 completes.
    pub fn impact(&self, id: &str) -> f64 {
        self.phase2
            .get()
            .and_then(|m| m.critical_path.get(id).copied())
            .unwrap_or(0.0)
    }
}

impl Adjacency {
    fn build(issues: &[Issue]) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(issues.len());
        let mut ids = Vec::with_capacity(issues.len());
        for issue in issues {
            if !index.contains_key(issue.id.as_str()) {
                index.insert(issue.id.as_str(), ids.len());
                ids.push(issue.id.clone());
            }
        }

        let n = ids.len();
        let mut blockers: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for issue in issues {
            let Some(&from) = index.get(issue.id.as_str()) else {
                continue;
            };
            for dep in issue.blocking_dependency_ids() {
                let Some(&to) = index.get(dep) else {
                    continue;
                };
                if to == from || blockers[from].contains(&to) {
                    continue;
                }
                blockers[from].push(to);
                dependents[to].push(from);
            }
        }

        let topo = topological_order(&ids, &blockers, &dependents);
        Self {
            ids,
            blockers,
            dependents,
            topo,
        }
    }

    fn compute_phase2(&self) -> Phase2Metrics {
        Phase2Metrics {
            pagerank: self.pagerank(),
            critical_path: self.critical_path(),
            skipped: false,
        }
    }

    /// Power iteration where rank flows from a dependent to its blockers.
    fn pagerank(&self) -> HashMap<String, f64> {
        let n = self.ids.len();
        if n == 0 {
            return HashMap::new();
        }
        let nf = n as f64;
        let mut rank = vec![1.0 / nf; n];
        let mut next = vec![0.0; n];

        for _ in 0..PAGERANK_MAX_ITERATIONS {
            let dangling: f64 = (0..n)
                .filter(|&i| self.blockers[i].is_empty())
                .map(|i| rank[i])
                .sum();
            let base = (1.0 - PAGERANK_DAMPING) / nf + PAGERANK_DAMPING * dangling / nf;
            next.iter_mut().for_each(|v| *v = base);

            for (i, targets) in self.blockers.iter().enumerate() {
                if targets.is_empty() {
                    continue;
                }
                let share = PAGERANK_DAMPING * rank[i] / targets.len() as f64;
                for &t in targets {
                    next[t] += share;
                }
            }

            let delta: f64 = rank.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
            std::mem::swap(&mut rank, &mut next);
            if delta < PAGERANK_TOLERANCE {
                break;
            }
        }

        self.ids.iter().cloned().zip(rank).collect()
    }

    /// Height of each node in the "blocks" DAG. Nodes on a cycle score 0.
    fn critical_path(&self) -> HashMap<String, f64> {
        let mut height = vec![0.0_f64; self.ids.len()];
        for &i in self.topo.iter().rev() {
            let below = self.dependents[i]
                .iter()
                .map(|&d| height[d])
                .fold(0.0_f64, f64::max);
            height[i] = below + 1.0;
        }
        self.ids.iter().cloned().zip(height).collect()
    }
}

/// Kahn's algorithm, lowest ID first among ready nodes for determinism.
fn topological_order(ids: &[String], blockers: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = blockers.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<(&str, usize)> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| (ids[i].as_str(), i))
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some((_, i)) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert((ids[d].as_str(), d));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dependency, DependencyType};

    fn issue(id: &str, blocked_by: &[&str]) -> Issue {
        Issue {
            id: id.to_string(),
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

    #[tokio::test]
    async fn test_phase1_and_phase2_on_chain() {
        // c depends on b depends on a
        let issues = vec![issue("c", &["b"]), issue("a", &[]), issue("b", &["a"])];
        let stats = GraphStats::analyze(&issues, false);

        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.edge_count, 2);
        assert_eq!(stats.topological_order, vec!["a", "b", "c"]);
        assert!(!stats.has_cycle);
        assert_eq!(stats.in_degree["a"], 1);
        assert_eq!(stats.out_degree["c"], 1);

        stats.wait_for_phase2().await;
        assert!(stats.is_phase2_ready());
        assert!(stats.pagerank("a") > stats.pagerank("c"));
        assert_eq!(stats.impact("a"), 3.0);
        assert_eq!(stats.impact("c"), 1.0);
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let issues = vec![issue("x", &["y"]), issue("y", &["x"]), issue("z", &[])];
        let stats = GraphStats::analyze(&issues, false);
        assert!(stats.has_cycle);
        assert_eq!(stats.topological_order, vec!["z"]);
        stats.wait_for_phase2().await;
        assert_eq!(stats.impact("x"), 0.0);
    }

    #[tokio::test]
    async fn test_skip_phase2_is_ready_immediately() {
        let stats = GraphStats::analyze(&[issue("a", &[])], true);
        assert!(stats.is_phase2_ready());
        assert!(stats.phase2().is_some_and(|m| m.skipped));
        stats.wait_for_phase2().await;
        assert_eq!(stats.pagerank("a"), 0.0);
    }

    #[test]
    fn test_missing_and_non_blocking_edges_ignored() {
        let mut rel = issue("a", &["ghost"]);
        rel.dependencies.push(Dependency {
            issue_id: "a".to_string(),
            depends_on_id: "b".to_string(),
            dep_type: DependencyType::Related,
            created_by: String::new(),
        });
        let stats = GraphStats::analyze(&[rel, issue("b", &[])], true);
        assert_eq!(stats.edge_count, 0);
        assert_eq!(stats.density, 0.0);
    }
}
