//! Market data subscription: request and event types.

use serde::{Deserialize, Serialize};

use super::{FeedEvent, FeedStatus, Fields};

/// Subscribe to field updates for a set of instruments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeForMarketDataRequest {
    pub instruments: Vec<String>,
    /// Field names the server should include in each update.
    pub fields: Vec<String>,
}

/// Event delivered on a market data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MarketDataEvent {
    Update { instrument: String, fields: Fields },
    FeedStatus { status: FeedStatus },
}

impl FeedEvent for MarketDataEvent {
    fn disconnected() -> Self {
        Self::FeedStatus {
            status: FeedStatus::Disconnected,
        }
    }

    fn feed_status(&self) -> Option<FeedStatus> {
        match self {
            Self::FeedStatus { status } => Some(*status),
            Self::Update { .. } => None,
        }
    }
}
