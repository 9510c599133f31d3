//! relaybot core: the update model and the dispatch engine.
//!
//! An [`Update`] is routed by a [`Router`]: pending [`NextStepRegistry`]
//! entries for the chat run first, otherwise the [`HandlerRegistry`] picks
//! handlers whose filters all pass, in priority-then-registration order.
pub mod callback_data;
pub mod filters;
pub mod handler;
pub mod metrics;
pub mod next_step;
pub mod registry;
pub mod router;
pub mod update;

pub use callback_data::{CallbackData, CallbackDataError, CallbackDataFilter};
pub use filters::{
    CustomFilter, FilterError, FilterSpec, FilterTable, FilterValue, StateFilter, TextMatch,
    extract_command,
};
pub use handler::{Handler, HandlerContext, HandlerResult};
pub use metrics::{MetricsSink, UpdateMetrics};
pub use next_step::NextStepRegistry;
pub use registry::{DispatchEnv, DispatchFailure, DispatchReport, FailureStage, HandlerRegistry};
pub use router::Router;
pub use update::{
    Chat, ChatType, ContentCategory, ContentType, Message, Update, UpdateDecodeError, UpdateKind,
    User,
};
