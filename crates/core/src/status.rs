use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Sent,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub const ALL: [ProposalStatus; 5] = [
        Self::Draft,
        Self::Sent,
        Self::Accepted,
        Self::Rejected,
        Self::Expired,
    ];

    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Human readable label used in timelines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Sent => "Sent",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
        }
    }

    /// Parses canonical values as well as the free-text labels older records carry.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let normalized = normalized
            .strip_prefix("proposal ")
            .unwrap_or(&normalized)
            .trim();
        match normalized {
            "draft" => Some(Self::Draft),
            "sent" | "follow up 1" | "follow up 2" | "follow up 3" => Some(Self::Sent),
            "accepted" | "done" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Accepted and rejected proposals never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }

    fn allowed_targets(self) -> &'static [ProposalStatus] {
        match self {
            Self::Draft => &[Self::Sent, Self::Accepted, Self::Rejected],
            Self::Sent => &[Self::Accepted, Self::Rejected, Self::Expired, Self::Draft],
            Self::Expired => &[Self::Sent, Self::Accepted],
            Self::Accepted | Self::Rejected => &[],
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = TransitionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| TransitionError::UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown proposal status '{0}'")]
    UnknownStatus(String),
    #[error("cannot move a proposal from {from} to {to}")]
    NotAllowed {
        from: ProposalStatus,
        to: ProposalStatus,
    },
}

/// Validates a status change. Returns `Ok(false)` when the status is unchanged.
pub fn transition(from: ProposalStatus, to: ProposalStatus) -> Result<bool, TransitionError> {
    if from == to {
        return Ok(false);
    }
    if from.allowed_targets().contains(&to) {
        Ok(true)
    } else {
        Err(TransitionError::NotAllowed { from, to })
    }
}

/// Entry in a proposal's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub status: String,
    pub label: String,
    pub at: DateTime<Utc>,
}

impl TimelineEntry {
    fn new(status: &str, label: &str, at: DateTime<Utc>) -> Self {
        Self {
            status: status.to_string(),
            label: label.to_string(),
            at,
        }
    }
}

/// Timestamps a timeline is derived from.
#[derive(Debug, Clone, Copy)]
pub struct TimelineInput {
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Builds the chronological status history shown on the proposal page.
pub fn timeline(input: TimelineInput) -> Vec<TimelineEntry> {
    let mut entries = vec![TimelineEntry::new("created", "Created", input.created_at)];

    if let Some(sent_at) = input.sent_at {
        entries.push(TimelineEntry::new(
            ProposalStatus::Sent.as_str(),
            ProposalStatus::Sent.label(),
            sent_at,
        ));
    }

    if let Some(accepted_at) = input.accepted_at {
        entries.push(TimelineEntry::new(
            ProposalStatus::Accepted.as_str(),
            ProposalStatus::Accepted.label(),
            accepted_at,
        ));
    }

    if !matches!(
        input.status,
        ProposalStatus::Draft | ProposalStatus::Sent | ProposalStatus::Accepted
    ) {
        entries.push(TimelineEntry::new(
            input.status.as_str(),
            input.status.label(),
            input.updated_at,
        ));
    }

    entries
}
