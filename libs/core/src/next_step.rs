use std::{future::Future, sync::Arc};

use dashmap::DashMap;

use crate::handler::{HandlerContext, HandlerFn, HandlerResult, handler_fn};

/// Single-use continuations keyed by chat.
///
/// Entries registered for a chat run on the next message that arrives in it
/// and are removed before they run. Arguments are bound by closure capture.
#[derive(Clone, Default)]
pub struct NextStepRegistry {
    pending: Arc<DashMap<i64, Vec<HandlerFn>>>,
}

impl NextStepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut, R>(&self, chat_id: i64, callback: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<HandlerResult>,
    {
        self.pending
            .entry(chat_id)
            .or_default()
            .push(handler_fn(callback));
    }

    /// Drops every pending entry for the chat. Returns how many were removed.
    pub fn clear(&self, chat_id: i64) -> usize {
        self.pending
            .remove(&chat_id)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }

    /// Removes and returns the chat's entries in registration order.
    pub fn take(&self, chat_id: i64) -> Vec<HandlerFn> {
        self.pending
            .remove(&chat_id)
            .map(|(_, entries)| entries)
            .unwrap_or_default()
    }

    pub fn pending(&self, chat_id: i64) -> usize {
        self.pending
            .get(&chat_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_entries() {
        let steps = NextStepRegistry::new();
        steps.register(5, |_| async { anyhow::Ok(()) });
        steps.register(5, |_| async { anyhow::Ok(()) });
        steps.register(6, |_| async { anyhow::Ok(()) });
        assert_eq!(steps.pending(5), 2);

        assert_eq!(steps.take(5).len(), 2);
        assert!(steps.take(5).is_empty());
        assert_eq!(steps.pending(6), 1);
    }

    #[test]
    fn clear_reports_removed_count() {
        let steps = NextStepRegistry::new();
        steps.register(1, |_| async { anyhow::Ok(()) });
        assert_eq!(steps.clear(1), 1);
        assert_eq!(steps.clear(1), 0);
    }
}
