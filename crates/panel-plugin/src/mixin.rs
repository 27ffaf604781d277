//! Mixin chain dispatch.
//!
//! A mixin is a named extension point where the panel asks plugins whether
//! and how to alter an operation in progress. The panel orders handlers
//! across plugins by the advertised priority and threads `chain_data`
//! between them; locally exactly one handler runs per target, the first one
//! registered.
//!
//! The plugin never interprets the verdict. Whatever [`MixinAction`] code
//! the handler returns is forwarded as-is.

use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::envelope::MixinAction;
use crate::envelope::MixinCall;
use crate::envelope::MixinReply;
use crate::envelope::Notification;
use crate::registry::HandlerRegistry;

/// Callback invoked for a mixin target.
pub type MixinHandler = Arc<dyn Fn(&MixinContext) -> MixinResult + Send + Sync>;

/// A registered mixin handler.
#[derive(Clone)]
pub struct MixinRegistration {
    pub target: String,
    pub priority: i32,
    pub handler: MixinHandler,
}

impl std::fmt::Debug for MixinRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixinRegistration")
            .field("target", &self.target)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Input handed to a mixin handler.
#[derive(Debug, Clone, PartialEq)]
pub struct MixinContext {
    pub target: String,
    /// Correlation id of the inbound call.
    pub request_id: String,
    input: Map<String, Value>,
    chain_data: Map<String, Value>,
}

impl MixinContext {
    pub fn new(
        target: impl Into<String>,
        request_id: impl Into<String>,
        input: Map<String, Value>,
        chain_data: Map<String, Value>,
    ) -> Self {
        Self {
            target: target.into(),
            request_id: request_id.into(),
            input,
            chain_data,
        }
    }

    /// The operation's input document.
    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.input.get(key)
    }

    /// Data left by handlers earlier in the panel-side chain.
    pub fn chain_data(&self) -> &Map<String, Value> {
        &self.chain_data
    }

    pub fn get_chain(&self, key: &str) -> Option<&Value> {
        self.chain_data.get(key)
    }
}

/// Verdict and optional payloads returned by a mixin handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixinResult {
    action: MixinAction,
    output: Option<Value>,
    modified_input: Option<Value>,
    error: Option<String>,
    notifications: Vec<Notification>,
}

impl MixinResult {
    /// Continue the chain unchanged.
    pub fn next() -> Self {
        Self::with_action(MixinAction::NEXT)
    }

    /// Continue the chain with a rewritten input document.
    pub fn next_with_input(input: Value) -> Self {
        Self {
            modified_input: Some(input),
            ..Self::next()
        }
    }

    /// Short-circuit the chain and answer with `output`.
    pub fn returning(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::with_action(MixinAction::RETURN)
        }
    }

    /// Deny the operation with an error message.
    pub fn deny(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_action(MixinAction::BLOCK)
        }
    }

    /// Use a panel-defined verdict code not covered by the named constructors.
    pub fn with_action(action: MixinAction) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// Attach a notification for the user.
    pub fn notify(mut self, title: &str, message: &str, kind: &str) -> Self {
        self.notifications.push(Notification {
            title: title.to_string(),
            message: message.to_string(),
            kind: kind.to_string(),
        });
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn action(&self) -> MixinAction {
        self.action
    }

    fn into_reply(self, target: &str) -> MixinReply {
        MixinReply {
            action: self.action,
            output: self.output.and_then(|v| encode_document(target, "output", &v)),
            modified_input: self.modified_input.and_then(|v| encode_document(target, "modified_input", &v)),
            error: self.error.filter(|e| !e.is_empty()),
            notifications: self.notifications,
        }
    }
}

fn encode_document(target: &str, field: &str, value: &Value) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(target_name = %target, field, error = %e, "failed to encode mixin document");
            None
        }
    }
}

/// Decode a JSON object document. Empty input is an empty object.
fn decode_document(target: &str, field: &str, bytes: &[u8]) -> Map<String, Value> {
    if bytes.is_empty() {
        return Map::new();
    }
    match serde_json::from_slice(bytes) {
        Ok(map) => map,
        Err(e) => {
            debug!(target_name = %target, field, error = %e, "mixin document is not a JSON object, using empty");
            Map::new()
        }
    }
}

/// Run the first handler registered for `call.target`.
pub(crate) fn dispatch(registry: &HandlerRegistry, request_id: &str, call: MixinCall) -> MixinReply {
    let Some(handler) = registry.mixin_handler(&call.target) else {
        debug!(target_name = %call.target, "no mixin handler registered, continuing");
        return MixinResult::next().into_reply(&call.target);
    };

    let input = decode_document(&call.target, "input", &call.input);
    let chain_data = decode_document(&call.target, "chain_data", &call.chain_data);
    let ctx = MixinContext::new(call.target.clone(), request_id, input, chain_data);

    handler(&ctx).into_reply(&call.target)
}
