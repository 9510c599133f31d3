use std::sync::Arc;

use relaybot_session::SharedStateStore;
use tracing::debug;

use crate::{
    handler::HandlerContext,
    next_step::NextStepRegistry,
    registry::{DispatchEnv, DispatchReport, HandlerRegistry, state_for},
    update::{Update, UpdateKind},
};

/// Entry point for one bot: next-step continuations first, then the
/// handler registry.
#[derive(Clone)]
pub struct Router {
    registry: Arc<HandlerRegistry>,
    next_steps: NextStepRegistry,
    store: Option<SharedStateStore>,
    bot_id: Option<i64>,
    per_topic_state: bool,
}

impl Router {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            next_steps: NextStepRegistry::new(),
            store: None,
            bot_id: None,
            per_topic_state: false,
        }
    }

    pub fn with_state_store(mut self, store: SharedStateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Scopes conversation keys to one bot when several share a store.
    pub fn with_bot_id(mut self, bot_id: i64) -> Self {
        self.bot_id = Some(bot_id);
        self
    }

    /// Keys forum-topic messages per topic instead of per (chat, user).
    pub fn per_topic_state(mut self, enabled: bool) -> Self {
        self.per_topic_state = enabled;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn next_steps(&self) -> &NextStepRegistry {
        &self.next_steps
    }

    pub fn state_store(&self) -> Option<&SharedStateStore> {
        self.store.as_ref()
    }

    pub async fn process_update(&self, update: Update) -> DispatchReport {
        let update = Arc::new(update);
        let env = DispatchEnv {
            store: self.store.clone(),
            state_key: update.conversation_key(self.bot_id, self.per_topic_state),
            next_steps: self.next_steps.clone(),
        };

        if let UpdateKind::Message(message) = &update.kind {
            let pending = self.next_steps.take(message.chat.id);
            if !pending.is_empty() {
                debug!(
                    update_id = update.update_id,
                    chat_id = message.chat.id,
                    steps = pending.len(),
                    "running next-step handlers"
                );
                let mut report = DispatchReport::for_update(&update);
                report.consumed_by_next_step = true;
                for step in &pending {
                    let ctx = HandlerContext {
                        update: Arc::clone(&update),
                        state: state_for(&env),
                        next_steps: self.next_steps.clone(),
                    };
                    report.run_callback("next_step", step, ctx).await;
                }
                return report;
            }
        }

        self.registry.dispatch(update, &env).await
    }
}
