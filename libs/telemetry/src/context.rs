/// Labels attached to relaybot metric series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryLabels {
    pub bot: String,
    pub update_type: Option<String>,
    pub handler: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(bot: impl Into<String>) -> Self {
        Self {
            bot: bot.into(),
            ..Self::default()
        }
    }

    pub fn with_update_type(mut self, update_type: impl Into<String>) -> Self {
        self.update_type = Some(update_type.into());
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        tags.push(("bot".into(), self.bot.clone()));
        if let Some(update_type) = &self.update_type {
            tags.push(("update_type".into(), update_type.clone()));
        }
        if let Some(handler) = &self.handler {
            tags.push(("handler".into(), handler.clone()));
        }
        for (key, value) in &self.extra {
            tags.push((key.clone(), value.clone()));
        }
        tags
    }
}
