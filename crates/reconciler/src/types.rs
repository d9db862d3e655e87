//! Artefact identity, lifecycle, and phase model.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Separator between the segments of a derived artefact key.
pub const KEY_SEPARATOR: char = ':';

/// Stable cross-type identifier of an artefact.
///
/// Derived as `<type>:<location>:<name>`, so a key alone is unique across
/// every artefact type. This is the unit listed in `dependencies`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtefactKey(String);

impl ArtefactKey {
    /// Wrap an already-formed key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key of an artefact from its identity fields.
    pub fn derive(artefact_type: &str, location: &str, name: &str) -> Self {
        Self(format!(
            "{artefact_type}{KEY_SEPARATOR}{location}{KEY_SEPARATOR}{name}"
        ))
    }

    /// Borrow the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtefactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtefactKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Surrogate identity assigned by a store on first insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtefactId(Ulid);

impl ArtefactId {
    /// Create a new random artefact ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for ArtefactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtefactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an artefact relative to reconciliation.
///
/// Failures never advance the lifecycle: a failed create stays `New`
/// with its error recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtefactLifecycle {
    /// Parsed, never applied.
    #[default]
    New,
    /// Applied by a CREATE phase.
    Created,
    /// Source changed since it was last applied.
    Modified,
    /// Applied by an UPDATE phase.
    Updated,
    /// Removed. Terminal.
    Deleted,
}

impl ArtefactLifecycle {
    /// Check if the lifecycle is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Whether the artefact's declared state is live.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }

    /// Check if the lifecycle can move to `target`.
    ///
    /// Staying in place is always allowed except from `Deleted`; that is
    /// how a failed attempt is recorded.
    pub fn can_transition_to(&self, target: ArtefactLifecycle) -> bool {
        use ArtefactLifecycle::*;
        match (self, target) {
            (Deleted, _) => false,
            (from, to) if *from == to => true,
            (_, Deleted) => true,
            (New, Created) | (Modified, Updated) => true,
            (Created | Updated, Modified) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ArtefactLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Created => "CREATED",
            Self::Modified => "MODIFIED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Operation attempted on an artefact during one depletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtefactPhase {
    Create,
    Update,
    Delete,
    Start,
    Stop,
}

impl ArtefactPhase {
    /// Whether an artefact in `lifecycle` is eligible for this phase.
    pub fn accepts(&self, lifecycle: ArtefactLifecycle) -> bool {
        match self {
            Self::Create => lifecycle == ArtefactLifecycle::New,
            Self::Update => lifecycle == ArtefactLifecycle::Modified,
            Self::Delete => !lifecycle.is_terminal(),
            Self::Start | Self::Stop => lifecycle.is_applied(),
        }
    }

    /// Lifecycle reached when the phase succeeds on an artefact in `current`.
    pub fn target_lifecycle(&self, current: ArtefactLifecycle) -> ArtefactLifecycle {
        match self {
            Self::Create => ArtefactLifecycle::Created,
            Self::Update => ArtefactLifecycle::Updated,
            Self::Delete => ArtefactLifecycle::Deleted,
            Self::Start | Self::Stop => current,
        }
    }

    /// Dependents must be processed before their dependencies.
    pub fn is_reverse(&self) -> bool {
        matches!(self, Self::Delete | Self::Stop)
    }

    /// Outcome label for a successful attempt.
    pub fn success_state(&self) -> ArtefactState {
        match self {
            Self::Create => ArtefactState::SuccessfulCreate,
            Self::Update => ArtefactState::SuccessfulUpdate,
            Self::Delete => ArtefactState::SuccessfulDelete,
            Self::Start => ArtefactState::SuccessfulStart,
            Self::Stop => ArtefactState::SuccessfulStop,
        }
    }

    /// Outcome label for a failed attempt.
    pub fn failure_state(&self) -> ArtefactState {
        match self {
            Self::Create => ArtefactState::FailedCreate,
            Self::Update => ArtefactState::FailedUpdate,
            Self::Delete => ArtefactState::FailedDelete,
            Self::Start => ArtefactState::FailedStart,
            Self::Stop => ArtefactState::FailedStop,
        }
    }
}

impl fmt::Display for ArtefactPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Start => "START",
            Self::Stop => "STOP",
        };
        f.write_str(s)
    }
}

/// Outcome of one phase attempt, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtefactState {
    SuccessfulCreate,
    SuccessfulUpdate,
    SuccessfulDelete,
    SuccessfulStart,
    SuccessfulStop,
    FailedCreate,
    FailedUpdate,
    FailedDelete,
    FailedStart,
    FailedStop,
}

impl ArtefactState {
    /// Check if this is a failure outcome.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FailedCreate
                | Self::FailedUpdate
                | Self::FailedDelete
                | Self::FailedStart
                | Self::FailedStop
        )
    }
}

impl fmt::Display for ArtefactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SuccessfulCreate => "SUCCESSFUL_CREATE",
            Self::SuccessfulUpdate => "SUCCESSFUL_UPDATE",
            Self::SuccessfulDelete => "SUCCESSFUL_DELETE",
            Self::SuccessfulStart => "SUCCESSFUL_START",
            Self::SuccessfulStop => "SUCCESSFUL_STOP",
            Self::FailedCreate => "FAILED_CREATE",
            Self::FailedUpdate => "FAILED_UPDATE",
            Self::FailedDelete => "FAILED_DELETE",
            Self::FailedStart => "FAILED_START",
            Self::FailedStop => "FAILED_STOP",
        };
        f.write_str(s)
    }
}

/// A declaratively-described object under reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artefact {
    /// Surrogate identity, assigned by the store on first insert.
    pub id: Option<ArtefactId>,
    /// Path of the source definition, e.g. `/project/roles/admin.role`.
    pub location: String,
    /// Display name, by default the file stem of `location`.
    pub name: String,
    /// Type tag routing the artefact to its synchronizer.
    #[serde(rename = "type")]
    pub artefact_type: String,
    /// Optional free text.
    pub description: Option<String>,
    /// Derived identity used for upserts and dependency references.
    pub key: ArtefactKey,
    /// Keys that must be applied before this artefact.
    pub dependencies: BTreeSet<ArtefactKey>,
    /// Current lifecycle.
    pub lifecycle: ArtefactLifecycle,
    /// Last recorded failure.
    pub error: Option<String>,
    /// SHA-256 of the source bytes, hex encoded.
    pub checksum: String,
    /// Raw source bytes.
    #[serde(default)]
    pub content: Vec<u8>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Artefact {
    /// Create a `New` artefact for the source at `location`.
    pub fn new(artefact_type: impl Into<String>, location: impl Into<String>, content: &[u8]) -> Self {
        let artefact_type = artefact_type.into();
        let location = location.into();
        let name = name_from_location(&location);
        let key = ArtefactKey::derive(&artefact_type, &location, &name);
        Self {
            id: None,
            location,
            name,
            artefact_type,
            description: None,
            key,
            dependencies: BTreeSet::new(),
            lifecycle: ArtefactLifecycle::New,
            error: None,
            checksum: checksum(content),
            content: content.to_vec(),
            created_by: None,
            created_at: None,
            updated_by: None,
            updated_at: None,
        }
    }

    /// Override the display name. The key is re-derived.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.update_key();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a dependency key.
    pub fn with_dependency(mut self, key: impl Into<ArtefactKey>) -> Self {
        self.dependencies.insert(key.into());
        self
    }

    /// Set the lifecycle.
    pub fn with_lifecycle(mut self, lifecycle: ArtefactLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Re-derive the key from type, location and name.
    pub fn update_key(&mut self) {
        self.key = ArtefactKey::derive(&self.artefact_type, &self.location, &self.name);
    }

    /// Whether this artefact lists itself as a dependency.
    pub fn depends_on_itself(&self) -> bool {
        self.dependencies.contains(&self.key)
    }
}

/// SHA-256 of `content`, lowercase hex.
pub fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Whether `location` lies inside `scope`, matching whole path segments.
///
/// `/p` covers `/p` and `/p/x.role` but not `/project/x.role`. An empty
/// scope or `/` covers everything.
pub fn is_within(location: &str, scope: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    scope.is_empty()
        || location
            .strip_prefix(scope)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// File stem of a location, or the whole location when it has none.
fn name_from_location(location: &str) -> String {
    Path::new(location)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map_or_else(|| location.to_string(), str::to_string)
}
