//! Lifecycle event dispatch.
//!
//! The panel announces actions (server start, user login, ...) as events.
//! A plugin may veto an action by returning a block verdict. Events without
//! a registered handler are allowed: an unknown event never blocks the
//! underlying action.

use std::sync::Arc;

use tracing::debug;

use crate::envelope::EventCall;
use crate::envelope::EventReply;
use crate::envelope::StringMap;
use crate::registry::HandlerRegistry;

/// Callback invoked for one event type.
pub type EventHandler = Arc<dyn Fn(Event) -> EventResult + Send + Sync>;

/// An event delivered to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub data: StringMap,
    /// Whether the panel waits on this verdict before proceeding.
    pub sync: bool,
}

/// Allow/block verdict returned by an event handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    allow: bool,
    message: String,
}

impl EventResult {
    /// Let the action proceed.
    pub fn allow() -> Self {
        Self {
            allow: true,
            message: String::new(),
        }
    }

    /// Stop the action, with a reason shown to the user.
    pub fn block(message: impl Into<String>) -> Self {
        Self {
            allow: false,
            message: message.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<EventResult> for EventReply {
    fn from(result: EventResult) -> Self {
        EventReply {
            allow: result.allow,
            message: result.message,
        }
    }
}

/// Run the handler registered for `call.event_type`, defaulting to allow.
pub(crate) fn dispatch(registry: &HandlerRegistry, call: EventCall) -> EventReply {
    let Some(handler) = registry.event_handler(&call.event_type) else {
        debug!(event = %call.event_type, "no event handler registered, allowing");
        return EventResult::allow().into();
    };

    let result = handler(Event {
        event_type: call.event_type,
        data: call.data,
        sync: call.sync,
    });
    result.into()
}
