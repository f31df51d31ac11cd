//! Deployment gate
//!
//! Decides from a verified event's metadata whether the deployment should
//! run. Pure and deterministic.

use std::fmt;

use crate::models::event::InboundEvent;

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateOptions {
    /// Only pushes to this ref deploy
    pub target_ref: String,

    /// Commit messages containing this marker do not deploy. Empty disables the check.
    pub skip_tag: String,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            target_ref: "refs/heads/main".to_string(),
            skip_tag: "[LOGS_UPDATE]".to_string(),
        }
    }
}

/// Gate decision, with the ref or tag that drove it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Run { target_ref: String },
    SkipBranch {
        target_ref: String,
        required_ref: String,
    },
    SkipTag { tag: String },
}

impl GateDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, GateDecision::Run { .. })
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Run { target_ref } => write!(f, "Deploying {}", target_ref),
            GateDecision::SkipBranch {
                target_ref,
                required_ref,
            } => write!(
                f,
                "Push to {} is not {}, no action taken",
                target_ref, required_ref
            ),
            GateDecision::SkipTag { tag } => {
                write!(f, "Commit contains skip marker {}, no action taken", tag)
            }
        }
    }
}

/// Decide whether `event` should trigger a deployment
pub fn decide(event: &InboundEvent, required_ref: &str, skip_tag: &str) -> GateDecision {
    if event.target_ref() != required_ref {
        return GateDecision::SkipBranch {
            target_ref: event.target_ref().to_string(),
            required_ref: required_ref.to_string(),
        };
    }

    if !skip_tag.is_empty() {
        if let Some(message) = event.commit_message() {
            if message.contains(skip_tag) {
                return GateDecision::SkipTag {
                    tag: skip_tag.to_string(),
                };
            }
        }
    }

    GateDecision::Run {
        target_ref: event.target_ref().to_string(),
    }
}
