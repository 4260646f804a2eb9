use std::fmt;
use std::sync::Arc;

use super::{DeadLetterSink, DeliveryStyle, LoggingDeadLetterSink, TriggerHandler};
use crate::schema::DecodingMode;

/// A handler subscribed to one topic as a member of one consumer group.
#[derive(Clone)]
pub struct TriggerBinding {
    name: String,
    topic: String,
    group: String,
    mode: DecodingMode,
    style: DeliveryStyle,
    handler: Arc<dyn TriggerHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl TriggerBinding {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        group: impl Into<String>,
        mode: DecodingMode,
        handler: Arc<dyn TriggerHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            group: group.into(),
            mode,
            style: DeliveryStyle::Batch,
            handler,
            dead_letters: Arc::new(LoggingDeadLetterSink),
        }
    }

    pub fn with_style(mut self, style: DeliveryStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn mode(&self) -> &DecodingMode {
        &self.mode
    }

    pub fn style(&self) -> DeliveryStyle {
        self.style
    }

    pub fn handler(&self) -> &Arc<dyn TriggerHandler> {
        &self.handler
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterSink> {
        &self.dead_letters
    }
}

impl fmt::Debug for TriggerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerBinding")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("mode", &self.mode)
            .field("style", &self.style)
            .finish_non_exhaustive()
    }
}
