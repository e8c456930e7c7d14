//! Reading the JSONL issues file into pooled issue collections.

pub mod pool;

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BeadworkError, Result};
use crate::types::Issue;

pub use pool::{IssuePool, PoolStats, PooledIssues};

/// Longest accepted line unless overridden.
pub const DEFAULT_MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

const READ_BUFFER: usize = 64 * 1024;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Per-load knobs. Borrowed closures keep the call site allocation-free.
#[derive(Default)]
pub struct LoadOptions<'a> {
    /// Maximum line length in bytes. `None` uses [`DEFAULT_MAX_LINE_SIZE`].
    pub max_line_size: Option<usize>,
    /// Issues for which this returns `false` are not kept.
    pub filter: Option<&'a (dyn Fn(&Issue) -> bool + Sync)>,
    /// Receives non-fatal problems (malformed lines, missing IDs).
    pub on_warning: Option<&'a (dyn Fn(&str) + Sync)>,
    /// Expected record count, used to presize the collection.
    pub capacity_hint: usize,
}

impl LoadOptions<'_> {
    fn warn(&self, msg: &str) {
        match self.on_warning {
            Some(f) => f(msg),
            None => tracing::warn!("{msg}"),
        }
    }
}

/// A source of issues the worker can reload on demand.
pub trait IssueLoader: Send + Sync {
    /// Cheap approximate record count (the line count for JSONL).
    fn count_records(&self) -> Result<usize>;

    fn load(&self, opts: &LoadOptions<'_>) -> Result<PooledIssues>;

    /// Backing file, if any. Used for logging and watcher setup.
    fn source_path(&self) -> Option<&Path> {
        None
    }
}

/// Loads a beads-style JSONL file, one issue per line.
#[derive(Debug, Clone)]
pub struct JsonlLoader {
    path: PathBuf,
    pool: Arc<IssuePool>,
}

impl JsonlLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_pool(path, IssuePool::global())
    }

    pub fn with_pool(path: impl Into<PathBuf>, pool: Arc<IssuePool>) -> Self {
        Self {
            path: path.into(),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<IssuePool> {
        &self.pool
    }

    fn open(&self) -> Result<File> {
        if !self.path.exists() {
            return Err(BeadworkError::DataFileNotFound(self.path.clone()));
        }
        Ok(File::open(&self.path)?)
    }
}

impl IssueLoader for JsonlLoader {
    fn count_records(&self) -> Result<usize> {
        count_lines(self.open()?)
    }

    fn load(&self, opts: &LoadOptions<'_>) -> Result<PooledIssues> {
        let file = self.open()?;
        let mut issues = self.pool.acquire(opts.capacity_hint);
        parse_into(BufReader::with_capacity(READ_BUFFER, file), opts, issues.as_vec_mut())?;
        Ok(issues)
    }

    fn source_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Parse JSONL from `reader`, appending accepted issues to `out`.
///
/// Blank lines are skipped. Malformed lines and issues without an ID are
/// reported through the warning callback and skipped. A line longer than the
/// limit aborts the load.
pub fn parse_into<R: BufRead>(mut reader: R, opts: &LoadOptions<'_>, out: &mut Vec<Issue>) -> Result<()> {
    let limit = opts.max_line_size.unwrap_or(DEFAULT_MAX_LINE_SIZE);
    let mut buf = Vec::with_capacity(4096);
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let n = (&mut reader).take(limit as u64 + 1).read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        line_no += 1;

        let mut line = buf.as_slice();
        if line.last() == Some(&b'\n') {
            line = &line[..line.len() - 1];
        } else if n > limit {
            return Err(BeadworkError::LineTooLong { line: line_no, limit });
        }
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line_no == 1 {
            line = line.strip_prefix(UTF8_BOM).unwrap_or(line);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let issue: Issue = match serde_json::from_slice(line) {
            Ok(issue) => issue,
            Err(e) => {
                opts.warn(&format!("skipping malformed JSON on line {line_no}: {e}"));
                continue;
            }
        };
        if issue.id.trim().is_empty() {
            opts.warn(&format!("skipping invalid issue on line {line_no}: missing id"));
            continue;
        }
        if opts.filter.is_some_and(|keep| !keep(&issue)) {
            continue;
        }
        out.push(issue);
    }

    Ok(())
}

/// Count newline-terminated lines, plus a trailing unterminated one.
pub fn count_lines<R: Read>(mut reader: R) -> Result<usize> {
    let mut buf = vec![0u8; 32 * 1024];
    let mut lines = 0usize;
    let mut last = None;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count();
        last = Some(buf[n - 1]);
    }

    if last.is_some_and(|b| b != b'\n') {
        lines += 1;
    }
    Ok(lines)
}

/// Rough retained size of a collection, for metrics.
pub fn estimate_issue_bytes(issues: &[Issue]) -> u64 {
    issues
        .iter()
        .map(|i| {
            let strings = i.id.len()
                + i.title.len()
                + i.description.len()
                + i.design.len()
                + i.acceptance_criteria.len()
                + i.notes.len()
                + i.assignee.len()
                + i.source_repo.len();
            let deps: usize = i
                .dependencies
                .iter()
                .map(|d| 64 + d.issue_id.len() + d.depends_on_id.len())
                .sum();
            let comments: usize = i
                .comments
                .iter()
                .map(|c| 128 + c.author.len() + c.text.len())
                .sum();
            let labels: usize = i.labels.iter().map(|l| 16 + l.len()).sum();
            (256 + strings + deps + comments + labels) as u64
        })
        .sum()
}
