//! Portfolio subscription: request and event types.

use serde::{Deserialize, Serialize};

use super::{FeedEvent, FeedStatus};

/// Subscribe to portfolio lifecycle events. Carries no parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeForPortfoliosRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PortfolioEvent {
    Added { portfolio_name: String },
    Removed { portfolio_name: String },
    Updated { portfolio_name: String },
    FeedStatus { status: FeedStatus },
}

impl FeedEvent for PortfolioEvent {
    fn disconnected() -> Self {
        Self::FeedStatus {
            status: FeedStatus::Disconnected,
        }
    }

    fn feed_status(&self) -> Option<FeedStatus> {
        match self {
            Self::FeedStatus { status } => Some(*status),
            _ => None,
        }
    }
}
