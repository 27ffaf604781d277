//! Wire data model exchanged between the plugin and the panel.
//!
//! Every message on the duplex connection is an [`Envelope`]: a correlation
//! id plus exactly one [`Payload`] kind. Calls that expect a reply carry a
//! correlation id and the reply echoes it unchanged.
//!
//! ## JSON form
//!
//! The payload is internally tagged by a `kind` field (snake_case variant
//! name). Binary fields are base64 strings. A `kind` this crate does not know
//! decodes to [`Payload::Unknown`] so newer panels never crash older plugins.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::ui::UiDescriptor;

/// Free-form string map used for headers, query strings and event data.
pub type StringMap = HashMap<String, String>;

/// One discrete message on the plugin connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id. Empty for envelopes that expect no reply.
    #[serde(default)]
    pub request_id: String,
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope carrying `payload` under `request_id`.
    pub fn new(request_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
        }
    }

    /// Create an envelope that expects no reply.
    pub fn uncorrelated(payload: Payload) -> Self {
        Self::new(String::new(), payload)
    }
}

/// Payload kinds carried by an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Plugin capability surface, sent once on connect.
    Registration(PluginInfo),
    /// Panel acceptance of the registration.
    RegistrationAck,
    Event(EventCall),
    EventResponse(EventReply),
    HttpRequest(HttpCall),
    HttpResponse(HttpReply),
    ScheduleTrigger(ScheduleCall),
    ScheduleAck,
    MixinCall(MixinCall),
    MixinResponse(MixinReply),
    AddonTypeCall(AddonTypeCall),
    AddonTypeResponse(AddonTypeReply),
    /// Plugin-initiated call toward the panel.
    HostCall(HostCall),
    /// Panel answer to a [`Payload::HostCall`].
    HostReply(HostReply),
    /// Fire-and-forget log line forwarded to the panel.
    Log(LogRecord),
    Shutdown,
    /// Any kind this version does not recognize.
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// Stable name of the payload kind, used in logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Registration(_) => "registration",
            Payload::RegistrationAck => "registration_ack",
            Payload::Event(_) => "event",
            Payload::EventResponse(_) => "event_response",
            Payload::HttpRequest(_) => "http_request",
            Payload::HttpResponse(_) => "http_response",
            Payload::ScheduleTrigger(_) => "schedule_trigger",
            Payload::ScheduleAck => "schedule_ack",
            Payload::MixinCall(_) => "mixin_call",
            Payload::MixinResponse(_) => "mixin_response",
            Payload::AddonTypeCall(_) => "addon_type_call",
            Payload::AddonTypeResponse(_) => "addon_type_response",
            Payload::HostCall(_) => "host_call",
            Payload::HostReply(_) => "host_reply",
            Payload::Log(_) => "log",
            Payload::Shutdown => "shutdown",
            Payload::Unknown => "unknown",
        }
    }

    /// Whether this payload answers a call the plugin itself issued.
    ///
    /// Reply-shaped envelopes go to the pending-call table instead of the
    /// dispatch router.
    pub fn is_reply(&self) -> bool {
        matches!(self, Payload::HostReply(_))
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Full capability surface advertised during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteInfo>,
    #[serde(default)]
    pub schedules: Vec<ScheduleInfo>,
    #[serde(default)]
    pub mixins: Vec<MixinInfo>,
    #[serde(default)]
    pub addon_types: Vec<AddonTypeInfo>,
    #[serde(default)]
    pub ui: UiDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
}

/// Rate-limit metadata for a route. Either a named preset or explicit values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub burst_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub id: String,
    pub cron: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixinInfo {
    pub target: String,
    /// Ordering hint for the panel. Not used for local dispatch.
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonTypeInfo {
    pub type_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCall {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: StringMap,
    #[serde(default)]
    pub sync: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReply {
    pub allow: bool,
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpCall {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: StringMap,
    #[serde(default)]
    pub query: StringMap,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpReply {
    pub status: u16,
    #[serde(default)]
    pub headers: StringMap,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCall {
    pub schedule_id: String,
}

// ---------------------------------------------------------------------------
// Mixins
// ---------------------------------------------------------------------------

/// Mixin verdict code.
///
/// The vocabulary belongs to the panel; the plugin passes the code through
/// untouched, so codes outside the named constants survive a round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MixinAction(pub i32);

impl MixinAction {
    /// Continue with the next handler or the panel's default behavior.
    pub const NEXT: MixinAction = MixinAction(0);
    /// Short-circuit and use the handler's output.
    pub const RETURN: MixinAction = MixinAction(1);
    /// Deny the operation.
    pub const BLOCK: MixinAction = MixinAction(2);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixinCall {
    pub target: String,
    #[serde(default, with = "b64")]
    pub input: Vec<u8>,
    #[serde(default, with = "b64")]
    pub chain_data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixinReply {
    pub action: MixinAction,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub output: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub modified_input: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

/// User-facing notification attached to a mixin result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Addon types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonTypeCall {
    pub type_id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub install_path: String,
    #[serde(default)]
    pub source_info: StringMap,
    #[serde(default)]
    pub server_variables: StringMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonTypeReply {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub actions: Vec<WireInstallAction>,
}

/// Install primitive understood by the panel. Codes are part of the wire contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ActionType {
    #[default]
    DownloadFile = 0,
    ExtractArchive = 1,
    DeleteFile = 2,
    CreateFolder = 3,
    WriteFile = 4,
    RunCommand = 5,
    ProxyToNode = 6,
}

impl ActionType {
    /// Numeric wire code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Flat wire form of an install action; fields unused by the tag stay empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireInstallAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, with = "b64")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub headers: StringMap,
    #[serde(default, with = "b64")]
    pub node_payload: Vec<u8>,
    #[serde(default)]
    pub node_endpoint: String,
}

// ---------------------------------------------------------------------------
// Plugin-initiated traffic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCall {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostReply {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub plugin_id: String,
    pub level: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Base64 field codecs
// ---------------------------------------------------------------------------

pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod b64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
