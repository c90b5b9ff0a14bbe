//! Trigger events and the run/no-run filter.

use serde::{Deserialize, Serialize};

use crate::domain::error::{JoblineError, Result};

/// Kind of repository activity that invoked the runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::PullRequest => "pull_request",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = JoblineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(EventType::Push),
            "pull_request" | "pr" => Ok(EventType::PullRequest),
            other => Err(JoblineError::InvalidEvent(format!(
                "unsupported event type: {other}"
            ))),
        }
    }
}

/// Pull-request action carried by a `pull_request` event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PrAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    Edited,
    Other(String),
}

impl PrAction {
    pub fn as_str(&self) -> &str {
        match self {
            PrAction::Opened => "opened",
            PrAction::Reopened => "reopened",
            PrAction::Synchronize => "synchronize",
            PrAction::Closed => "closed",
            PrAction::Edited => "edited",
            PrAction::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for PrAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "opened" => PrAction::Opened,
            "reopened" => PrAction::Reopened,
            "synchronize" => PrAction::Synchronize,
            "closed" => PrAction::Closed,
            "edited" => PrAction::Edited,
            _ => PrAction::Other(s),
        }
    }
}

impl From<&str> for PrAction {
    fn from(s: &str) -> Self {
        PrAction::from(s.to_string())
    }
}

impl From<PrAction> for String {
    fn from(action: PrAction) -> Self {
        action.as_str().to_string()
    }
}

impl std::fmt::Display for PrAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An incoming repository event. Immutable once constructed.
///
/// For pull requests `branch` is the base (target) branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_type: EventType,
    pub branch: String,
    pub pr_action: Option<PrAction>,
    /// Head commit, when the platform supplies one.
    #[serde(default)]
    pub sha: Option<String>,
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Push,
            branch: branch.into(),
            pr_action: None,
            sha: None,
        }
    }

    pub fn pull_request(base_branch: impl Into<String>, action: impl Into<PrAction>) -> Self {
        Self {
            event_type: EventType::PullRequest,
            branch: base_branch.into(),
            pr_action: Some(action.into()),
            sha: None,
        }
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    /// Parse a GitHub-style webhook payload.
    ///
    /// `push` reads `ref` (`refs/heads/<branch>`) and `after`;
    /// `pull_request` reads `action`, `pull_request.base.ref` and
    /// `pull_request.head.sha`.
    pub fn from_webhook(event_name: &str, payload: &serde_json::Value) -> Result<Self> {
        let event_type: EventType = event_name.parse()?;
        match event_type {
            EventType::Push => {
                let git_ref = payload["ref"].as_str().ok_or_else(|| {
                    JoblineError::InvalidEvent("push payload missing `ref`".to_string())
                })?;
                let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
                let mut event = TriggerEvent::push(branch);
                event.sha = payload["after"].as_str().map(str::to_string);
                Ok(event)
            }
            EventType::PullRequest => {
                let action = payload["action"].as_str().ok_or_else(|| {
                    JoblineError::InvalidEvent("pull_request payload missing `action`".to_string())
                })?;
                let base = payload["pull_request"]["base"]["ref"]
                    .as_str()
                    .ok_or_else(|| {
                        JoblineError::InvalidEvent(
                            "pull_request payload missing `pull_request.base.ref`".to_string(),
                        )
                    })?;
                let mut event = TriggerEvent::pull_request(base, action);
                event.sha = payload["pull_request"]["head"]["sha"]
                    .as_str()
                    .map(str::to_string);
                Ok(event)
            }
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pr_action {
            Some(action) => write!(f, "{}:{} -> {}", self.event_type, action, self.branch),
            None => write!(f, "{} -> {}", self.event_type, self.branch),
        }
    }
}

/// Branch list for push triggers. An empty list matches every branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFilter {
    #[serde(default)]
    pub branches: Vec<String>,
}

impl BranchFilter {
    pub fn new(branches: &[&str]) -> Self {
        Self {
            branches: branches.iter().map(|b| b.to_string()).collect(),
        }
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.branches.is_empty() || self.branches.iter().any(|p| branch_matches(p, branch))
    }
}

fn default_pr_types() -> Vec<PrAction> {
    vec![PrAction::Opened, PrAction::Reopened, PrAction::Synchronize]
}

/// Pull-request trigger: target branches and accepted actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestFilter {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default = "default_pr_types")]
    pub types: Vec<PrAction>,
}

impl Default for PullRequestFilter {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            types: default_pr_types(),
        }
    }
}

/// `name` matches `pattern` exactly, or by prefix when the pattern ends in `*`.
fn branch_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Outcome of trigger evaluation. A skip is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    Run,
    Skip { reason: String },
}

impl TriggerDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, TriggerDecision::Run)
    }
}

/// Which events start the job (`on:` block of a workflow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFilter {
    #[serde(default)]
    pub push: Option<BranchFilter>,
    #[serde(default)]
    pub pull_request: Option<PullRequestFilter>,
}

impl Default for TriggerFilter {
    /// Push to `main`; pull requests opened, reopened or synchronized against `main`.
    fn default() -> Self {
        Self {
            push: Some(BranchFilter::new(&["main"])),
            pull_request: Some(PullRequestFilter {
                branches: vec!["main".to_string()],
                types: default_pr_types(),
            }),
        }
    }
}

impl TriggerFilter {
    /// Decide run/no-run for an incoming event.
    pub fn evaluate(&self, event: &TriggerEvent) -> TriggerDecision {
        match event.event_type {
            EventType::Push => {
                let Some(filter) = &self.push else {
                    return skip("push events are not configured");
                };
                if filter.matches(&event.branch) {
                    TriggerDecision::Run
                } else {
                    skip(format!("push to `{}` is not a watched branch", event.branch))
                }
            }
            EventType::PullRequest => {
                let Some(filter) = &self.pull_request else {
                    return skip("pull_request events are not configured");
                };
                let Some(action) = &event.pr_action else {
                    return skip("pull_request event without an action");
                };
                if !filter.types.contains(action) {
                    return skip(format!("pull_request action `{action}` is not watched"));
                }
                let branch_ok = filter.branches.is_empty()
                    || filter.branches.iter().any(|p| branch_matches(p, &event.branch));
                if branch_ok {
                    TriggerDecision::Run
                } else {
                    skip(format!(
                        "pull_request targets `{}`, not a watched branch",
                        event.branch
                    ))
                }
            }
        }
    }
}

fn skip(reason: impl Into<String>) -> TriggerDecision {
    TriggerDecision::Skip {
        reason: reason.into(),
    }
}
