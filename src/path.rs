//! Structural keys for the metadata tree.
//!
//! Everything the engine addresses inside the store is a [`TreePath`]: an
//! ordered sequence of validated segments. Projects, commits and targets
//! carry their own newtypes so the rest of the crate cannot mix them up.

use std::fmt;
use std::str::FromStr;

use snafu::Snafu;
use snafu::ensure;

/// Result type for path parsing.
pub type Result<T> = std::result::Result<T, PathError>;

/// Path parsing and validation errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum PathError {
    /// A segment was empty.
    #[snafu(display("empty path segment"))]
    EmptySegment,

    /// A segment was `.` or `..`.
    #[snafu(display("reserved path segment: {segment}"))]
    ReservedSegment {
        /// The offending segment.
        segment: String,
    },

    /// A segment contained a slash.
    #[snafu(display("path segment contains '/': {segment}"))]
    SlashInSegment {
        /// The offending segment.
        segment: String,
    },

    /// A commit hash was not 40 lowercase hex characters.
    #[snafu(display("invalid commit hash: {value}"))]
    InvalidCommitHash {
        /// The rejected value.
        value: String,
    },

    /// A project identifier was not of the form `user/repo`.
    #[snafu(display("invalid project id: {value}"))]
    InvalidProjectId {
        /// The rejected value.
        value: String,
    },
}

/// A single validated path segment.
///
/// Never empty, never `.` or `..`, never contains `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Step(String);

impl Step {
    /// Validate a single segment.
    pub fn new(segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        ensure!(!segment.is_empty(), EmptySegmentSnafu);
        ensure!(
            segment != "." && segment != "..",
            ReservedSegmentSnafu { segment }
        );
        ensure!(!segment.contains('/'), SlashInSegmentSnafu { segment });
        Ok(Self(segment))
    }

    /// The segment as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered sequence of path segments.
///
/// Equality and ordering are lexicographic over segments, so `TreePath`
/// is usable as a `BTreeMap` key. The empty path is the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreePath(Vec<Step>);

impl TreePath {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a `/`-separated path. The empty string, `.` and `..`
    /// components are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for segment in s.split('/') {
            steps.push(Step::new(segment)?);
        }
        Ok(Self(steps))
    }

    /// Append one validated segment.
    pub fn child(&self, step: Step) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        Self(steps)
    }

    /// Concatenate two paths.
    pub fn join(&self, other: &TreePath) -> Self {
        let mut steps = self.0.clone();
        steps.extend(other.0.iter().cloned());
        Self(steps)
    }

    /// The segments in order.
    pub fn segments(&self) -> &[Step] {
        &self.0
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `prefix` is a prefix of this path.
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The path without its first `n` segments, or `None` if shorter.
    pub fn strip_prefix(&self, prefix: &TreePath) -> Option<TreePath> {
        if self.starts_with(prefix) {
            Some(TreePath(self.0[prefix.0.len()..].to_vec()))
        } else {
            None
        }
    }

    /// The parent path, or `None` at the root.
    pub fn parent(&self) -> Option<TreePath> {
        if self.0.is_empty() {
            None
        } else {
            Some(TreePath(self.0[..self.0.len() - 1].to_vec()))
        }
    }
}

impl FromIterator<Step> for TreePath {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for step in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            f.write_str(step.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for TreePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A repository on the forge, identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectId {
    /// Repository owner.
    pub user: String,
    /// Repository name.
    pub repo: String,
}

impl ProjectId {
    /// Build a project id from validated owner and name segments.
    pub fn new(user: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let user = user.into();
        let repo = repo.into();
        Step::new(user.as_str())?;
        Step::new(repo.as_str())?;
        Ok(Self { user, repo })
    }

    /// The project's path inside the metadata tree: `user/repo`.
    pub fn tree_path(&self) -> TreePath {
        // Segments were validated at construction.
        TreePath(vec![Step(self.user.clone()), Step(self.repo.clone())])
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.repo)
    }
}

impl FromStr for ProjectId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((user, repo)) if !repo.contains('/') => {
                Self::new(user, repo).map_err(|_| PathError::InvalidProjectId { value: s.to_string() })
            }
            _ => InvalidProjectIdSnafu { value: s }.fail(),
        }
    }
}

/// A forge commit hash: 40 lowercase hex characters (SHA-1).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitHash(String);

impl CommitHash {
    /// Validate and normalize a hex commit hash.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let bytes = hex::decode(&value).map_err(|_| PathError::InvalidCommitHash { value: value.clone() })?;
        ensure!(bytes.len() == 20, InvalidCommitHashSnafu { value });
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// The full 40-character hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in commit messages.
    pub fn short(&self) -> &str {
        &self.0[..6]
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind half of a target: a PR number or a ref name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKind {
    /// A pull request, by number.
    Pr(u64),
    /// A ref, by `heads/...` or `tags/...` path.
    Ref(TreePath),
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Pr(n) => write!(f, "PR#{n}"),
            TargetKind::Ref(name) => write!(f, "Ref {name}"),
        }
    }
}

/// A target: the unit pipelines attach to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId {
    /// Owning project.
    pub project: ProjectId,
    /// PR number or ref name.
    pub kind: TargetKind,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_rejects_invalid_segments() {
        assert_eq!(Step::new(""), Err(PathError::EmptySegment));
        assert!(matches!(Step::new("."), Err(PathError::ReservedSegment { .. })));
        assert!(matches!(Step::new(".."), Err(PathError::ReservedSegment { .. })));
        assert!(matches!(Step::new("a/b"), Err(PathError::SlashInSegment { .. })));
        assert!(Step::new(".monitor").is_ok());
    }

    #[test]
    fn test_path_round_trip() {
        for raw in ["a", "a/b", "heads/release/v1", "user/repo/pr/7/head"] {
            let path = TreePath::parse(raw).unwrap();
            assert_eq!(path.to_string(), raw);
        }
    }

    #[test]
    fn test_path_rejects_bad_components() {
        assert!(TreePath::parse("").is_err());
        assert!(TreePath::parse("a//b").is_err());
        assert!(TreePath::parse("a/./b").is_err());
        assert!(TreePath::parse("a/../b").is_err());
    }

    #[test]
    fn test_path_ordering_is_lexicographic() {
        let a = TreePath::parse("a/b").unwrap();
        let b = TreePath::parse("a/b/c").unwrap();
        let c = TreePath::parse("a/c").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_path_prefix_operations() {
        let base = TreePath::parse("user/repo").unwrap();
        let full = TreePath::parse("user/repo/ref/heads/main").unwrap();
        assert!(full.starts_with(&base));
        assert_eq!(
            full.strip_prefix(&base).unwrap().to_string(),
            "ref/heads/main"
        );
        assert!(base.strip_prefix(&full).is_none());
    }

    #[test]
    fn test_commit_hash_validation() {
        let hex40 = "abcdef0123456789abcdef0123456789abcdef01";
        let hash = CommitHash::new(hex40).unwrap();
        assert_eq!(hash.as_str(), hex40);
        assert_eq!(hash.short(), "abcdef");
        assert!(CommitHash::new("abcdef").is_err());
        assert!(CommitHash::new("zz".repeat(20)).is_err());
    }

    #[test]
    fn test_project_id_parse() {
        let id: ProjectId = "foo/bar".parse().unwrap();
        assert_eq!(id.tree_path().to_string(), "foo/bar");
        assert!("foo".parse::<ProjectId>().is_err());
        assert!("foo/bar/baz".parse::<ProjectId>().is_err());
    }
}
