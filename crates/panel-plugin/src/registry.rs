//! Handler registry and the builder that assembles it.
//!
//! A [`Plugin`] collects handlers, metadata and the UI descriptor before the
//! connection opens. Opening the connection freezes it into a
//! [`HandlerRegistry`], which is read-only for the rest of the process and
//! shared by every dispatch.
//!
//! ## Lookup rules
//!
//! - Events: one handler per type, last registration wins.
//! - Routes: one route per method+path, last registration wins in place;
//!   wildcard fallback scans routes in registration order.
//! - Schedules: keyed by id and cron; dispatch runs the first matching id.
//! - Mixins: several handlers may share a target, only the first runs. The
//!   priority is advertised to the panel and not used locally.
//! - Addon types: one installer per type id, last registration wins.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::addon::AddonTypeHandler;
use crate::addon::AddonTypeRegistration;
use crate::addon::AddonTypeRequest;
use crate::addon::AddonTypeResponse;
use crate::connection::PanelClient;
use crate::envelope::AddonTypeInfo;
use crate::envelope::MixinInfo;
use crate::envelope::PluginInfo;
use crate::envelope::RateLimitInfo;
use crate::envelope::RouteInfo;
use crate::envelope::ScheduleInfo;
use crate::events::Event;
use crate::events::EventHandler;
use crate::events::EventResult;
use crate::http::Request;
use crate::http::Response;
use crate::http::RouteHandler;
use crate::mixin::MixinContext;
use crate::mixin::MixinHandler;
use crate::mixin::MixinRegistration;
use crate::mixin::MixinResult;
use crate::route;
use crate::scheduler::ScheduleConfig;
use crate::scheduler::ScheduleHandler;
use crate::ui::UiDescriptor;

/// Rate-limit preset for read-heavy routes.
pub const PRESET_READ: &str = "read";
/// Rate-limit preset for mutating routes.
pub const PRESET_WRITE: &str = "write";
/// Rate-limit preset for sensitive routes.
pub const PRESET_STRICT: &str = "strict";

/// Hook run once after the handshake, before inbound dispatch starts.
pub type StartHook = Box<dyn FnOnce(&PanelClient) + Send>;

/// Rate-limit descriptor advertised for a route. Enforced by the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimit {
    /// A named panel preset such as [`PRESET_READ`].
    Preset(String),
    /// Explicit requests per minute with a burst allowance.
    Custom { requests_per_minute: u32, burst: u32 },
}

impl From<&RateLimit> for RateLimitInfo {
    fn from(limit: &RateLimit) -> Self {
        match limit {
            RateLimit::Preset(name) => RateLimitInfo {
                preset: name.clone(),
                ..Default::default()
            },
            RateLimit::Custom {
                requests_per_minute,
                burst,
            } => RateLimitInfo {
                preset: String::new(),
                requests_per_minute: *requests_per_minute,
                burst_limit: *burst,
            },
        }
    }
}

/// A route registration.
#[derive(Clone)]
pub struct RouteConfig {
    pub method: String,
    pub path: String,
    pub handler: RouteHandler,
    pub rate_limit: Option<RateLimit>,
}

impl RouteConfig {
    pub fn new<F>(method: impl Into<String>, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Response + Send + Sync + 'static,
    {
        Self {
            method: method.into(),
            path: path.into(),
            handler: Arc::new(handler),
            rate_limit: None,
        }
    }

    /// Ask the panel to limit this route to `requests_per_minute` with `burst`.
    pub fn rate_limit(mut self, requests_per_minute: u32, burst: u32) -> Self {
        self.rate_limit = Some(RateLimit::Custom {
            requests_per_minute,
            burst,
        });
        self
    }

    /// Ask the panel to apply a named rate-limit preset.
    pub fn rate_limit_preset(mut self, preset: impl Into<String>) -> Self {
        self.rate_limit = Some(RateLimit::Preset(preset.into()));
        self
    }

    fn info(&self) -> RouteInfo {
        RouteInfo {
            method: self.method.clone(),
            path: self.path.clone(),
            rate_limit: self.rate_limit.as_ref().map(RateLimitInfo::from),
        }
    }
}

impl std::fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteConfig")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

/// Builder for a plugin's capability surface.
pub struct Plugin {
    id: String,
    name: String,
    version: String,
    events: BTreeMap<String, EventHandler>,
    routes: Vec<RouteConfig>,
    schedules: Vec<ScheduleConfig>,
    mixins: Vec<MixinRegistration>,
    addon_types: BTreeMap<String, AddonTypeRegistration>,
    ui: UiDescriptor,
    use_data_dir: bool,
    on_start: Option<StartHook>,
    client: PanelClient,
}

impl Plugin {
    /// Start a plugin with the given id and version. The display name
    /// defaults to the id.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            client: PanelClient::new(id.clone()),
            id,
            version: version.into(),
            events: BTreeMap::new(),
            routes: Vec::new(),
            schedules: Vec::new(),
            mixins: Vec::new(),
            addon_types: BTreeMap::new(),
            ui: UiDescriptor::default(),
            use_data_dir: false,
            on_start: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Set the display name shown by the panel.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create the per-plugin data directory on start.
    pub fn use_data_dir(mut self) -> Self {
        self.use_data_dir = true;
        self
    }

    pub(crate) fn wants_data_dir(&self) -> bool {
        self.use_data_dir
    }

    /// Run `hook` once after the handshake, before any inbound call is
    /// dispatched. The hook runs on a blocking worker and may use
    /// [`PanelClient::call_blocking`]. Calls that arrive meanwhile are held
    /// and dispatched in arrival order once it returns.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&PanelClient) + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_event<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Event) -> EventResult + Send + Sync + 'static,
    {
        self.events.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn route<F>(self, method: impl Into<String>, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Response + Send + Sync + 'static,
    {
        self.add_route(RouteConfig::new(method, path, handler))
    }

    /// Register a fully configured route, replacing any route with the
    /// same method and path.
    pub fn add_route(mut self, config: RouteConfig) -> Self {
        match self.routes.iter_mut().find(|r| r.method == config.method && r.path == config.path) {
            Some(existing) => *existing = config,
            None => self.routes.push(config),
        }
        self
    }

    pub fn schedule<F>(mut self, id: impl Into<String>, cron: impl Into<String>, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = id.into();
        let cron = cron.into();
        let handler: ScheduleHandler = Arc::new(handler);
        match self.schedules.iter_mut().find(|s| s.id == id && s.cron == cron) {
            Some(existing) => existing.handler = handler,
            None => self.schedules.push(ScheduleConfig { id, cron, handler }),
        }
        self
    }

    pub fn mixin<F>(self, target: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&MixinContext) -> MixinResult + Send + Sync + 'static,
    {
        self.mixin_with_priority(target, 0, handler)
    }

    pub fn mixin_with_priority<F>(mut self, target: impl Into<String>, priority: i32, handler: F) -> Self
    where
        F: Fn(&MixinContext) -> MixinResult + Send + Sync + 'static,
    {
        self.mixins.push(MixinRegistration {
            target: target.into(),
            priority,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn addon_type<F>(
        mut self,
        type_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(AddonTypeRequest) -> AddonTypeResponse + Send + Sync + 'static,
    {
        let type_id = type_id.into();
        self.addon_types.insert(type_id.clone(), AddonTypeRegistration {
            type_id,
            name: name.into(),
            description: description.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Edit the UI descriptor.
    pub fn ui(mut self, f: impl FnOnce(UiDescriptor) -> UiDescriptor) -> Self {
        self.ui = f(std::mem::take(&mut self.ui));
        self
    }

    /// Handle for calls toward the panel. Usable once the connection is open.
    pub fn client(&self) -> PanelClient {
        self.client.clone()
    }

    /// Freeze the handlers into a registry.
    pub fn into_registry(self) -> HandlerRegistry {
        self.into_parts().0
    }

    pub(crate) fn into_parts(self) -> (HandlerRegistry, Option<StartHook>, PanelClient) {
        let route_index = self
            .routes
            .iter()
            .enumerate()
            .map(|(i, r)| ((r.method.clone(), r.path.clone()), i))
            .collect();

        let registry = HandlerRegistry {
            plugin_id: self.id,
            name: self.name,
            version: self.version,
            events: self.events,
            routes: self.routes,
            route_index,
            schedules: self.schedules,
            mixins: self.mixins,
            addon_types: self.addon_types,
            ui: self.ui,
        };
        (registry, self.on_start, self.client)
    }
}

/// Immutable handler lookup shared by every dispatch.
pub struct HandlerRegistry {
    plugin_id: String,
    name: String,
    version: String,
    events: BTreeMap<String, EventHandler>,
    routes: Vec<RouteConfig>,
    /// Exact (method, path) to position in `routes`.
    route_index: HashMap<(String, String), usize>,
    schedules: Vec<ScheduleConfig>,
    mixins: Vec<MixinRegistration>,
    addon_types: BTreeMap<String, AddonTypeRegistration>,
    ui: UiDescriptor,
}

impl HandlerRegistry {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn event_handler(&self, event_type: &str) -> Option<&EventHandler> {
        self.events.get(event_type)
    }

    /// Resolve a request to a route: exact method+path first, then the
    /// first route in registration order whose method and pattern match.
    pub fn resolve_route(&self, method: &str, path: &str) -> Option<&RouteConfig> {
        if let Some(&i) = self.route_index.get(&(method.to_string(), path.to_string())) {
            return self.routes.get(i);
        }
        self.routes
            .iter()
            .find(|r| route::match_method(&r.method, method) && route::match_path(&r.path, path))
    }

    pub fn schedule_handler(&self, id: &str) -> Option<&ScheduleHandler> {
        self.schedules.iter().find(|s| s.id == id).map(|s| &s.handler)
    }

    pub fn mixin_handler(&self, target: &str) -> Option<&MixinHandler> {
        self.mixins.iter().find(|m| m.target == target).map(|m| &m.handler)
    }

    pub fn addon_type_handler(&self, type_id: &str) -> Option<&AddonTypeHandler> {
        self.addon_types.get(type_id).map(|a| &a.handler)
    }

    /// Capability summary sent in the registration payload.
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.plugin_id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            events: self.events.keys().cloned().collect(),
            routes: self.routes.iter().map(RouteConfig::info).collect(),
            schedules: self
                .schedules
                .iter()
                .map(|s| ScheduleInfo {
                    id: s.id.clone(),
                    cron: s.cron.clone(),
                })
                .collect(),
            mixins: self
                .mixins
                .iter()
                .map(|m| MixinInfo {
                    target: m.target.clone(),
                    priority: m.priority,
                })
                .collect(),
            addon_types: self
                .addon_types
                .values()
                .map(|a| AddonTypeInfo {
                    type_id: a.type_id.clone(),
                    name: a.name.clone(),
                    description: a.description.clone(),
                })
                .collect(),
            ui: self.ui.clone(),
        }
    }
}
