//! Stateless portfolio subscriber.
//!
//! Holds no state of its own: the registry owns the listener and callers keep
//! the returned id to stop or terminate it.

use tms_core::transport::TmsRemote;
use tms_core::{ListenerId, PortfolioEvent, SubscribeForPortfoliosRequest, TmsError};
use tracing::info;

use crate::registry::ListenerRegistry;

pub struct PortfolioSubscriber;

impl PortfolioSubscriber {
    /// Subscribe to portfolio events and log them.
    pub fn start<S: TmsRemote>(
        registry: &ListenerRegistry<S>,
        name: &str,
        debug: bool,
    ) -> Result<ListenerId, TmsError> {
        registry.start_listening(
            S::subscribe_for_portfolios,
            &SubscribeForPortfoliosRequest::default(),
            Self::process_portfolio_event,
            name,
            debug,
        )
    }

    pub fn stop<S: TmsRemote>(registry: &ListenerRegistry<S>, id: ListenerId, caller: &str) {
        registry.stop_listener(id, caller);
    }

    pub fn terminate<S: TmsRemote>(registry: &ListenerRegistry<S>, id: ListenerId, caller: &str) {
        registry.terminate_listener(id, caller);
    }

    /// Log one portfolio event. Never asks the listener to stop.
    pub fn process_portfolio_event(event: &PortfolioEvent, caller: &str) -> bool {
        match event {
            PortfolioEvent::Added { portfolio_name } => {
                info!("{caller}portfolio added: {portfolio_name}");
            }
            PortfolioEvent::Removed { portfolio_name } => {
                info!("{caller}portfolio removed: {portfolio_name}");
            }
            PortfolioEvent::Updated { portfolio_name } => {
                info!("{caller}portfolio updated: {portfolio_name}");
            }
            PortfolioEvent::FeedStatus { status } => {
                info!("{caller}portfolio feed status: {status:?}");
            }
        }
        true
    }
}
