//! Market target subscription: request and event types.

use serde::{Deserialize, Serialize};

use super::{FeedEvent, FeedStatus, Fields};

/// Subscribe to market targets, optionally restricted to one portfolio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeForTargetsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TargetEvent {
    Added { fields: Fields },
    FeedStatus { status: FeedStatus },
}

impl FeedEvent for TargetEvent {
    fn disconnected() -> Self {
        Self::FeedStatus {
            status: FeedStatus::Disconnected,
        }
    }

    fn feed_status(&self) -> Option<FeedStatus> {
        match self {
            Self::FeedStatus { status } => Some(*status),
            Self::Added { .. } => None,
        }
    }
}
