/// Work item definitions for tracking harvest progress
///
/// This module defines the targets a cycle works on, the states an item moves
/// through, and the discoveries an item can produce.
use std::fmt;

/// Represents the current state of one item in a wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    // ===== Active States =====
    /// Waiting to be handed to a worker
    Queued,

    /// Placed in a worker's partition
    Assigned,

    /// The worker is processing it
    Fetching,

    // ===== Outcome States =====
    /// Processed and persisted
    Succeeded,

    /// Deliberately not processed (gone, private, banned, or nothing to do)
    Skipped,

    /// Errored or timed out
    Failed,

    // ===== Final State =====
    /// Its discoveries were merged into the cycle's discovery set
    Expanded,
}

impl ItemState {
    /// Returns true once the worker is done with the item
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Skipped | Self::Failed | Self::Expanded
        )
    }

    /// Returns true if moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Assigned)
                | (Self::Assigned, Self::Fetching)
                | (Self::Assigned, Self::Skipped)
                | (Self::Fetching, Self::Succeeded)
                | (Self::Fetching, Self::Skipped)
                | (Self::Fetching, Self::Failed)
                | (Self::Succeeded, Self::Expanded)
                | (Self::Skipped, Self::Expanded)
                | (Self::Failed, Self::Expanded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Fetching => "fetching",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Expanded => "expanded",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a target names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Community,
    User,
}

/// Which wave of a cycle a target belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wave {
    /// Configured seeds
    One,
    /// Promoted discoveries
    Two,
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    pub wave: Wave,
    /// Target whose processing discovered this one; None for seeds
    pub source: Option<String>,
}

impl Target {
    /// A wave-one community seed
    pub fn seed(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            kind: TargetKind::Community,
            wave: Wave::One,
            source: None,
        }
    }

    /// Identity used for deduplication; names compare case-insensitively
    pub fn key(&self) -> String {
        target_key(self.kind, &self.name)
    }
}

pub(crate) fn target_key(kind: TargetKind, name: &str) -> String {
    let prefix = match kind {
        TargetKind::Community => "r",
        TargetKind::User => "u",
    };
    format!("{}/{}", prefix, name.to_ascii_lowercase())
}

/// How a discovery was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryReason {
    /// The community a crossposted post came from
    Crosspost,
    /// An `r/name` mention in a title or body
    Mention,
    /// The author of a harvested post
    Author,
    /// A community a harvested user posts in
    Activity,
}

/// A candidate for wave two produced while processing a target
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    pub name: String,
    pub kind: TargetKind,
    pub reason: DiscoveryReason,
    /// Name of the target being processed when this was found
    pub source: String,
    /// Engagement signal from the source (score of the post that referenced it)
    pub weight: i64,
}

impl DiscoveryResult {
    pub fn key(&self) -> String {
        target_key(self.kind, &self.name)
    }

    /// Converts into a wave-two target
    pub fn into_target(self) -> Target {
        Target {
            name: self.name,
            kind: self.kind,
            wave: Wave::Two,
            source: Some(self.source),
        }
    }
}

/// A target together with its progress through the state machine
#[derive(Debug, Clone)]
pub struct TrackedItem {
    pub target: Target,
    state: ItemState,
}

impl TrackedItem {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            state: ItemState::Queued,
        }
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Moves to `next`; returns false and keeps the state on an illegal transition
    pub fn advance(&mut self, next: ItemState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
