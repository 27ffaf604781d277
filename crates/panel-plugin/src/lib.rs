//! Plugin-side runtime for panel extensions.
//!
//! A plugin is a separate process that holds one duplex connection to the
//! panel. It declares its capabilities up front (event hooks, HTTP routes,
//! scheduled jobs, mixin points, addon installers and UI contributions),
//! registers them during a handshake, and then answers the calls the panel
//! routes to it.
//!
//! ## Lifecycle
//!
//! 1. Build a [`Plugin`] and register handlers on it
//! 2. [`Plugin::start`] parses launch arguments and connects over TCP, or
//!    [`Plugin::run`] drives any [`Transport`]
//! 3. The registration is sent and the panel acknowledges it
//! 4. The optional start hook runs once; it may call the panel, and calls
//!    that arrive meanwhile wait until it returns
//! 5. Inbound calls are dispatched to handlers on blocking workers; each
//!    reply echoes the call's correlation id
//! 6. A shutdown envelope, end of stream or [`ShutdownHandle::shutdown`]
//!    ends the loop and fails any outstanding [`PanelClient`] calls
//!
//! ```no_run
//! use panel_plugin::EventResult;
//! use panel_plugin::Plugin;
//! use panel_plugin::Response;
//!
//! # async fn launch() -> anyhow::Result<()> {
//! Plugin::new("motd", "1.0.0")
//!     .name("Message of the Day")
//!     .on_event("server_start", |_| EventResult::allow())
//!     .route("GET", "/motd", |_| Response::text("hello"))
//!     .start("127.0.0.1:50051")
//!     .await
//! # }
//! ```

pub mod addon;
mod connection;
pub mod data_dir;
pub mod dispatch;
pub mod envelope;
mod error;
pub mod events;
pub mod http;
pub mod mixin;
pub mod pending;
mod registry;
pub mod route;
pub mod scheduler;
pub mod transport;
pub mod ui;

pub use addon::AddonTypeRequest;
pub use addon::AddonTypeResponse;
pub use addon::InstallAction;
pub use connection::Connection;
pub use connection::ConnectionState;
pub use connection::Exit;
pub use connection::PanelClient;
pub use connection::ShutdownHandle;
pub use data_dir::DataDir;
pub use data_dir::StartupArgs;
pub use envelope::Envelope;
pub use envelope::MixinAction;
pub use envelope::Payload;
pub use error::Error;
pub use error::Result;
pub use error::TransportError;
pub use events::Event;
pub use events::EventResult;
pub use http::Request;
pub use http::Response;
pub use mixin::MixinContext;
pub use mixin::MixinResult;
pub use registry::HandlerRegistry;
pub use registry::PRESET_READ;
pub use registry::PRESET_STRICT;
pub use registry::PRESET_WRITE;
pub use registry::Plugin;
pub use registry::RateLimit;
pub use registry::RouteConfig;
pub use transport::ChannelTransport;
pub use transport::FrameTransport;
pub use transport::HostEnd;
pub use transport::Transport;
pub use ui::UiDescriptor;
