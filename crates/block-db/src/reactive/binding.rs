//! LiveBinding: a live query result held in a `tokio::sync::watch` cell.

use tokio::sync::watch;

use super::registry::SubscriptionHandle;
use crate::error::{BlockDbError, Result};
use crate::query::QueryResult;

/// Holds the latest result of a live query. The subscription stays attached
/// for as long as the binding lives.
#[derive(Debug)]
pub struct LiveBinding {
    receiver: watch::Receiver<QueryResult>,
    handle: SubscriptionHandle,
}

impl LiveBinding {
    pub(crate) fn new(receiver: watch::Receiver<QueryResult>, handle: SubscriptionHandle) -> Self {
        Self { receiver, handle }
    }

    pub fn current(&self) -> QueryResult {
        self.receiver.borrow().clone()
    }

    /// Wait for the next result.
    pub async fn changed(&mut self) -> Result<QueryResult> {
        self.receiver
            .changed()
            .await
            .map_err(|_| BlockDbError::Internal("live binding closed".into()))?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// A receiver that observes the same value; it stops updating once the
    /// binding is dropped.
    pub fn receiver(&self) -> watch::Receiver<QueryResult> {
        self.receiver.clone()
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn disconnect(self) {
        self.handle.unsubscribe();
    }
}
