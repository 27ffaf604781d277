//! Dispatch router.
//!
//! Classifies each inbound call envelope by payload kind and hands it to the
//! subsystem that owns that kind. Every call kind produces exactly one reply
//! payload; shutdown, reply-shaped and unrecognized kinds produce none.

use std::sync::Arc;

use tracing::debug;

use crate::addon;
use crate::addon::AddonTypeResponse;
use crate::envelope::Envelope;
use crate::envelope::EventReply;
use crate::envelope::MixinAction;
use crate::envelope::MixinReply;
use crate::envelope::Payload;
use crate::events;
use crate::http;
use crate::http::Response;
use crate::mixin;
use crate::registry::HandlerRegistry;
use crate::scheduler;

/// Inbound call kinds that expect exactly one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Event,
    Http,
    Schedule,
    Mixin,
    AddonType,
}

impl CallKind {
    /// Classify a payload, or `None` if it is not an inbound call.
    pub fn of(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Event(_) => Some(CallKind::Event),
            Payload::HttpRequest(_) => Some(CallKind::Http),
            Payload::ScheduleTrigger(_) => Some(CallKind::Schedule),
            Payload::MixinCall(_) => Some(CallKind::Mixin),
            Payload::AddonTypeCall(_) => Some(CallKind::AddonType),
            _ => None,
        }
    }

    /// Reply sent when the handler for a call of this kind panicked.
    ///
    /// Events and mixins fail open; HTTP answers 500; installs fail.
    pub fn failure_reply(self) -> Payload {
        match self {
            CallKind::Event => Payload::EventResponse(EventReply {
                allow: true,
                message: String::new(),
            }),
            CallKind::Http => Payload::HttpResponse(Response::error(500, "internal plugin error").into()),
            CallKind::Schedule => Payload::ScheduleAck,
            CallKind::Mixin => Payload::MixinResponse(MixinReply {
                action: MixinAction::NEXT,
                ..Default::default()
            }),
            CallKind::AddonType => Payload::AddonTypeResponse(AddonTypeResponse::failure("addon type handler failed").into()),
        }
    }
}

/// Routes inbound calls to their handlers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run the handler for `envelope` and return its reply payload.
    ///
    /// The caller attaches the inbound correlation id to the reply.
    pub fn dispatch(&self, envelope: Envelope) -> Option<Payload> {
        let registry = self.registry.as_ref();
        match envelope.payload {
            Payload::Event(call) => Some(Payload::EventResponse(events::dispatch(registry, call))),
            Payload::HttpRequest(call) => Some(Payload::HttpResponse(http::dispatch(registry, call))),
            Payload::ScheduleTrigger(call) => {
                scheduler::dispatch(registry, &call);
                Some(Payload::ScheduleAck)
            }
            Payload::MixinCall(call) => {
                Some(Payload::MixinResponse(mixin::dispatch(registry, &envelope.request_id, call)))
            }
            Payload::AddonTypeCall(call) => Some(Payload::AddonTypeResponse(addon::dispatch(registry, call))),
            other => {
                debug!(kind = other.kind_name(), request_id = %envelope.request_id, "no dispatch for payload kind");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::AddonTypeCall;
    use crate::envelope::EventCall;
    use crate::envelope::HttpCall;
    use crate::envelope::MixinCall;
    use crate::envelope::ScheduleCall;
    use crate::events::EventResult;
    use crate::mixin::MixinResult;
    use crate::registry::Plugin;

    fn http(method: &str, path: &str, body: &[u8]) -> Envelope {
        Envelope::new("h-1", Payload::HttpRequest(HttpCall {
            method: method.to_string(),
            path: path.to_string(),
            body: body.to_vec(),
            ..Default::default()
        }))
    }

    fn items_plugin() -> Dispatcher {
        let registry = Plugin::new("items", "0.1.0")
            .route("POST", "/items", |req| {
                let name = req.body_field("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                Response::json(&json!({ "created": name })).with_status(201)
            })
            .route("GET", "/items/*", |req| Response::json(&json!({ "path": req.path })))
            .into_registry();
        Dispatcher::new(Arc::new(registry))
    }

    fn http_reply(payload: Option<Payload>) -> crate::envelope::HttpReply {
        match payload {
            Some(Payload::HttpResponse(reply)) => reply,
            other => panic!("expected http response, got {other:?}"),
        }
    }

    #[test]
    fn item_routes_end_to_end() {
        let dispatcher = items_plugin();

        let created = http_reply(dispatcher.dispatch(http("POST", "/items", br#"{"name":"x"}"#)));
        assert_eq!(created.status, 201);
        let body: serde_json::Value = serde_json::from_slice(&created.body).expect("json body");
        assert_eq!(body, json!({ "success": true, "data": { "created": "x" } }));

        let fetched = http_reply(dispatcher.dispatch(http("GET", "/items/42", b"")));
        assert_eq!(fetched.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&fetched.body).expect("json body");
        assert_eq!(body["data"]["path"], "/items/42");

        let missing = http_reply(dispatcher.dispatch(http("DELETE", "/items/42", b"")));
        assert_eq!(missing.status, 404);
        let body: serde_json::Value = serde_json::from_slice(&missing.body).expect("json body");
        assert_eq!(body["success"], false);
    }

    #[test]
    fn malformed_body_still_reaches_handler() {
        let dispatcher = items_plugin();
        let reply = http_reply(dispatcher.dispatch(http("POST", "/items", b"not json")));
        assert_eq!(reply.status, 201);
    }

    #[test]
    fn each_call_kind_gets_its_reply_kind() {
        let registry = Plugin::new("t", "0.1.0")
            .on_event("server_start", |_| EventResult::block("maintenance"))
            .mixin("server.create", |_| MixinResult::deny("no"))
            .into_registry();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let event = dispatcher.dispatch(Envelope::new("e", Payload::Event(EventCall {
            event_type: "server_start".into(),
            ..Default::default()
        })));
        assert!(matches!(event, Some(Payload::EventResponse(ref r)) if !r.allow && r.message == "maintenance"));

        let ack = dispatcher.dispatch(Envelope::new("s", Payload::ScheduleTrigger(ScheduleCall {
            schedule_id: "unregistered".into(),
        })));
        assert_eq!(ack, Some(Payload::ScheduleAck));

        let mixin = dispatcher.dispatch(Envelope::new("m", Payload::MixinCall(MixinCall {
            target: "server.create".into(),
            ..Default::default()
        })));
        assert!(matches!(mixin, Some(Payload::MixinResponse(ref r)) if r.action == MixinAction::BLOCK));

        let addon = dispatcher.dispatch(Envelope::new("a", Payload::AddonTypeCall(AddonTypeCall {
            type_id: "missing".into(),
            ..Default::default()
        })));
        assert!(matches!(addon, Some(Payload::AddonTypeResponse(ref r)) if r.error == addon::HANDLER_NOT_FOUND));
    }

    #[test]
    fn non_call_kinds_produce_nothing() {
        let dispatcher = items_plugin();
        assert_eq!(dispatcher.dispatch(Envelope::uncorrelated(Payload::Unknown)), None);
        assert_eq!(dispatcher.dispatch(Envelope::uncorrelated(Payload::Shutdown)), None);
        assert_eq!(dispatcher.dispatch(Envelope::uncorrelated(Payload::RegistrationAck)), None);
    }

    #[test]
    fn failure_replies_fail_open_where_it_matters() {
        assert!(matches!(CallKind::Event.failure_reply(), Payload::EventResponse(ref r) if r.allow));
        assert!(matches!(CallKind::Http.failure_reply(), Payload::HttpResponse(ref r) if r.status == 500));
        assert!(matches!(CallKind::Mixin.failure_reply(), Payload::MixinResponse(ref r) if r.action == MixinAction::NEXT));
        assert!(matches!(CallKind::AddonType.failure_reply(), Payload::AddonTypeResponse(ref r) if !r.success));
        assert_eq!(CallKind::of(&Payload::Shutdown), None);
        assert_eq!(CallKind::of(&Payload::ScheduleAck), None);
    }
}
