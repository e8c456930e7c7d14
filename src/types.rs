use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BeadworkError;

/// Lifecycle status of an issue.
///
/// Unknown status strings are kept verbatim in `Other` so that data written by
/// newer tools still loads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Pinned,
    Hooked,
    Review,
    Closed,
    Tombstone,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::Deferred => "deferred",
            Status::Pinned => "pinned",
            Status::Hooked => "hooked",
            Status::Review => "review",
            Status::Closed => "closed",
            Status::Tombstone => "tombstone",
            Status::Other(s) => s,
        }
    }

    /// Closed and tombstoned issues are treated alike by every view.
    pub fn is_closed_like(&self) -> bool {
        matches!(self, Status::Closed | Status::Tombstone)
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "open" => Status::Open,
            "in_progress" | "in-progress" => Status::InProgress,
            "blocked" => Status::Blocked,
            "deferred" => Status::Deferred,
            "pinned" => Status::Pinned,
            "hooked" => Status::Hooked,
            "review" => Status::Review,
            "closed" => Status::Closed,
            "tombstone" => Status::Tombstone,
            _ => Status::Other(s),
        }
    }
}

impl From<Status> for String {
    fn from(s: Status) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = BeadworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(BeadworkError::Other("empty status".to_string()));
        }
        Ok(Status::from(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum IssueType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
    Other(String),
}

impl IssueType {
    pub fn as_str(&self) -> &str {
        match self {
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Task => "task",
            IssueType::Epic => "epic",
            IssueType::Chore => "chore",
            IssueType::Other(s) => s,
        }
    }
}

impl From<String> for IssueType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "task" => IssueType::Task,
            "bug" => IssueType::Bug,
            "feature" => IssueType::Feature,
            "epic" => IssueType::Epic,
            "chore" => IssueType::Chore,
            _ => IssueType::Other(s),
        }
    }
}

impl From<IssueType> for String {
    fn from(t: IssueType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum DependencyType {
    #[default]
    Blocks,
    Related,
    ParentChild,
    DiscoveredFrom,
    Other(String),
}

impl DependencyType {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Related => "related",
            DependencyType::ParentChild => "parent-child",
            DependencyType::DiscoveredFrom => "discovered-from",
            DependencyType::Other(s) => s,
        }
    }

    /// Whether an open target of this edge keeps the dependent issue from being ready.
    pub fn is_blocking(&self) -> bool {
        matches!(self, DependencyType::Blocks)
    }
}

impl From<String> for DependencyType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "blocks" => DependencyType::Blocks,
            "related" => DependencyType::Related,
            "parent-child" | "parent_child" => DependencyType::ParentChild,
            "discovered-from" | "discovered_from" => DependencyType::DiscoveredFrom,
            _ => DependencyType::Other(s),
        }
    }
}

impl From<DependencyType> for String {
    fn from(t: DependencyType) -> Self {
        t.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default)]
    pub issue_id: String,

    pub depends_on_id: String,

    #[serde(rename = "type", default)]
    pub dep_type: DependencyType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub author: String,

    #[serde(default)]
    pub text: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
}

/// One line of the issues file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub design: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acceptance_criteria: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    #[serde(default)]
    pub status: Status,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub issue_type: IssueType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignee: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repo: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
}

fn default_priority() -> i32 {
    2
}

impl Issue {
    /// IDs of issues this one is blocked by (blocking edges only).
    pub fn blocking_dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| d.dep_type.is_blocking() && !d.depends_on_id.is_empty())
            .map(|d| d.depends_on_id.as_str())
    }

    /// The parent issue ID, if this issue declares a parent-child edge.
    pub fn parent_id(&self) -> Option<&str> {
        self.dependencies
            .iter()
            .find(|d| d.dep_type == DependencyType::ParentChild)
            .map(|d| d.depends_on_id.as_str())
    }
}
