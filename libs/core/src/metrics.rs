//! Per-update metrics record handed to metrics sinks.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{
    registry::{DispatchReport, FailureStage},
    update::Update,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    pub user_id_hash: String,
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageInfo {
    pub is_forwarded: bool,
    pub is_reply: bool,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateMetrics {
    pub bot_prefix: String,
    /// Seconds since the Unix epoch.
    pub received_at: f64,
    pub update_id: i64,
    pub update_type: Option<String>,
    /// `None` when no handler matched.
    pub handler_name: Option<String>,
    pub handler_metrics: Map<String, Value>,
    pub handler_test_durations: Vec<f64>,
    pub processing_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_info: Option<ExceptionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_info: Option<MessageInfo>,
}

impl UpdateMetrics {
    pub fn new(bot_prefix: impl Into<String>, received_at: SystemTime) -> Self {
        Self {
            bot_prefix: bot_prefix.into(),
            received_at: received_at
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or_default(),
            update_id: 0,
            update_type: None,
            handler_name: None,
            handler_metrics: Map::new(),
            handler_test_durations: Vec::new(),
            processing_duration: None,
            exception_info: None,
            user_info: None,
            message_info: None,
        }
    }

    /// Fills the record from a decoded update and its dispatch outcome.
    pub fn record(&mut self, update: &Update, report: &DispatchReport) {
        self.update_id = update.update_id;
        self.update_type = update.category().map(|c| c.as_str().to_string());
        self.handler_name = report.handled_by.first().cloned();
        self.handler_metrics = report.handler_metrics.clone();
        self.handler_test_durations = report
            .test_durations
            .iter()
            .map(Duration::as_secs_f64)
            .collect();
        self.processing_duration = report.processing_duration.map(|d| d.as_secs_f64());
        self.exception_info = report
            .errors
            .iter()
            .find(|failure| failure.stage == FailureStage::Handler)
            .map(|failure| ExceptionInfo {
                type_name: failure.type_name.clone(),
                body: failure.message.clone(),
            });
        self.user_info = update.user().map(|user| UserInfo {
            user_id_hash: hash_user_id(user.id),
            language_code: user.language_code.clone(),
        });
        self.message_info = update.message().map(|message| MessageInfo {
            is_forwarded: message.is_forwarded(),
            is_reply: message.is_reply(),
            content_type: message.content_type().to_string(),
        });
    }
}

/// Hex SHA-256 of the decimal user id; raw ids never leave the process.
pub fn hash_user_id(user_id: i64) -> String {
    hex::encode(Sha256::digest(user_id.to_string().as_bytes()))
}

/// Receives finished metrics records.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn handle(&self, metrics: &UpdateMetrics) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DispatchFailure;
    use serde_json::json;

    #[test]
    fn record_captures_update_and_outcome() {
        let update = Update::from_value(json!({
            "update_id": 77,
            "message": {
                "message_id": 1,
                "date": 0,
                "chat": {"id": 1, "type": "private"},
                "from": {"id": 42, "is_bot": false, "first_name": "A", "language_code": "fr"},
                "text": "hi",
                "forward_origin": {"type": "hidden_user"}
            }
        }))
        .unwrap();
        let report = DispatchReport {
            update_id: 77,
            handled_by: vec!["greet".into()],
            test_durations: vec![Duration::from_millis(2), Duration::from_millis(3)],
            processing_duration: Some(Duration::from_millis(10)),
            errors: vec![DispatchFailure {
                handler: "greet".into(),
                stage: FailureStage::Handler,
                type_name: "HandlerError".into(),
                message: "boom".into(),
            }],
            ..DispatchReport::default()
        };

        let mut metrics = UpdateMetrics::new("echo", UNIX_EPOCH + Duration::from_secs(5));
        metrics.record(&update, &report);

        assert_eq!(metrics.received_at, 5.0);
        assert_eq!(metrics.update_type.as_deref(), Some("message"));
        assert_eq!(metrics.handler_name.as_deref(), Some("greet"));
        assert_eq!(metrics.handler_test_durations.len(), 2);
        assert_eq!(metrics.exception_info.as_ref().unwrap().body, "boom");
        let user = metrics.user_info.as_ref().unwrap();
        assert_eq!(user.user_id_hash, hash_user_id(42));
        assert_ne!(user.user_id_hash, "42");
        assert_eq!(user.language_code.as_deref(), Some("fr"));
        let message = metrics.message_info.unwrap();
        assert!(message.is_forwarded);
        assert!(!message.is_reply);
        assert_eq!(message.content_type, "text");
    }
}
