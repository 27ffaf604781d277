//! Addon-type installers.
//!
//! An addon type teaches the panel how to install a kind of addon (a mod
//! loader, a plugin marketplace entry, ...). The handler does not touch the
//! server itself; it answers with an ordered list of primitive
//! [`InstallAction`]s and the panel executes them strictly in that order.

use std::sync::Arc;

use tracing::debug;

use crate::envelope::ActionType;
use crate::envelope::AddonTypeCall;
use crate::envelope::AddonTypeReply;
use crate::envelope::StringMap;
use crate::envelope::WireInstallAction;
use crate::registry::HandlerRegistry;

/// Error returned when no installer is registered for the requested type.
pub const HANDLER_NOT_FOUND: &str = "addon type handler not found";

/// Callback invoked for an install request.
pub type AddonTypeHandler = Arc<dyn Fn(AddonTypeRequest) -> AddonTypeResponse + Send + Sync>;

/// A registered installer together with its display metadata.
#[derive(Clone)]
pub struct AddonTypeRegistration {
    pub type_id: String,
    pub name: String,
    pub description: String,
    pub handler: AddonTypeHandler,
}

impl std::fmt::Debug for AddonTypeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonTypeRegistration")
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Install request handed to an installer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddonTypeRequest {
    pub type_id: String,
    pub server_id: String,
    pub node_id: String,
    pub download_url: String,
    pub file_name: String,
    pub install_path: String,
    pub source_info: StringMap,
    pub server_variables: StringMap,
}

impl From<AddonTypeCall> for AddonTypeRequest {
    fn from(call: AddonTypeCall) -> Self {
        Self {
            type_id: call.type_id,
            server_id: call.server_id,
            node_id: call.node_id,
            download_url: call.download_url,
            file_name: call.file_name,
            install_path: call.install_path,
            source_info: call.source_info,
            server_variables: call.server_variables,
        }
    }
}

/// Installer verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddonTypeResponse {
    pub success: bool,
    pub error: Option<String>,
    pub message: Option<String>,
    pub actions: Vec<InstallAction>,
}

impl AddonTypeResponse {
    /// Successful plan, executed by the panel in the given order.
    pub fn success(message: impl Into<String>, actions: Vec<InstallAction>) -> Self {
        Self {
            success: true,
            error: None,
            message: Some(message.into()),
            actions,
        }
    }

    /// Refuse the install.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: None,
            actions: Vec::new(),
        }
    }
}

/// One primitive step of an install plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallAction {
    DownloadFile {
        url: String,
        path: String,
        headers: StringMap,
    },
    ExtractArchive {
        path: String,
    },
    DeleteFile {
        path: String,
    },
    CreateFolder {
        path: String,
    },
    WriteFile {
        path: String,
        content: Vec<u8>,
    },
    RunCommand {
        command: String,
    },
    ProxyToNode {
        endpoint: String,
        payload: Vec<u8>,
    },
}

impl InstallAction {
    pub fn download_file(url: impl Into<String>, path: impl Into<String>, headers: StringMap) -> Self {
        InstallAction::DownloadFile {
            url: url.into(),
            path: path.into(),
            headers,
        }
    }

    pub fn extract_archive(path: impl Into<String>) -> Self {
        InstallAction::ExtractArchive { path: path.into() }
    }

    pub fn delete_file(path: impl Into<String>) -> Self {
        InstallAction::DeleteFile { path: path.into() }
    }

    pub fn create_folder(path: impl Into<String>) -> Self {
        InstallAction::CreateFolder { path: path.into() }
    }

    pub fn write_file(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        InstallAction::WriteFile {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn run_command(command: impl Into<String>) -> Self {
        InstallAction::RunCommand {
            command: command.into(),
        }
    }

    pub fn proxy_to_node(endpoint: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InstallAction::ProxyToNode {
            endpoint: endpoint.into(),
            payload: payload.into(),
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            InstallAction::DownloadFile { .. } => ActionType::DownloadFile,
            InstallAction::ExtractArchive { .. } => ActionType::ExtractArchive,
            InstallAction::DeleteFile { .. } => ActionType::DeleteFile,
            InstallAction::CreateFolder { .. } => ActionType::CreateFolder,
            InstallAction::WriteFile { .. } => ActionType::WriteFile,
            InstallAction::RunCommand { .. } => ActionType::RunCommand,
            InstallAction::ProxyToNode { .. } => ActionType::ProxyToNode,
        }
    }
}

impl From<InstallAction> for WireInstallAction {
    fn from(action: InstallAction) -> Self {
        let action_type = action.action_type();
        let base = WireInstallAction {
            action_type,
            ..Default::default()
        };
        match action {
            InstallAction::DownloadFile { url, path, headers } => WireInstallAction {
                url,
                path,
                headers,
                ..base
            },
            InstallAction::ExtractArchive { path }
            | InstallAction::DeleteFile { path }
            | InstallAction::CreateFolder { path } => WireInstallAction { path, ..base },
            InstallAction::WriteFile { path, content } => WireInstallAction { path, content, ..base },
            InstallAction::RunCommand { command } => WireInstallAction { command, ..base },
            InstallAction::ProxyToNode { endpoint, payload } => WireInstallAction {
                node_endpoint: endpoint,
                node_payload: payload,
                ..base
            },
        }
    }
}

impl From<AddonTypeResponse> for AddonTypeReply {
    fn from(resp: AddonTypeResponse) -> Self {
        AddonTypeReply {
            success: resp.success,
            error: resp.error.unwrap_or_default(),
            message: resp.message.unwrap_or_default(),
            actions: resp.actions.into_iter().map(WireInstallAction::from).collect(),
        }
    }
}

/// Run the installer registered for `call.type_id`.
pub(crate) fn dispatch(registry: &HandlerRegistry, call: AddonTypeCall) -> AddonTypeReply {
    let Some(handler) = registry.addon_type_handler(&call.type_id) else {
        debug!(type_id = %call.type_id, "no addon type handler registered");
        return AddonTypeResponse::failure(HANDLER_NOT_FOUND).into();
    };
    handler(AddonTypeRequest::from(call)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Plugin;

    fn call(type_id: &str) -> AddonTypeCall {
        AddonTypeCall {
            type_id: type_id.to_string(),
            server_id: "srv-1".into(),
            install_path: "/data/plugins".into(),
            download_url: "https://example.invalid/pack.zip".into(),
            file_name: "pack.zip".into(),
            ..Default::default()
        }
    }

    #[test]
    fn unregistered_type_fails_with_fixed_error() {
        let registry = Plugin::new("test", "0.1.0").into_registry();
        let reply = dispatch(&registry, call("modpack"));
        assert!(!reply.success);
        assert_eq!(reply.error, HANDLER_NOT_FOUND);
        assert!(!reply.error.is_empty());
        assert!(reply.actions.is_empty());
    }

    #[test]
    fn action_order_is_preserved() {
        let registry = Plugin::new("test", "0.1.0")
            .addon_type("modpack", "Modpack", "Installs a zipped modpack", |req| {
                let archive = format!("{}/{}", req.install_path, req.file_name);
                AddonTypeResponse::success("installing", vec![
                    InstallAction::create_folder(req.install_path.clone()),
                    InstallAction::download_file(req.download_url, archive.clone(), StringMap::new()),
                    InstallAction::extract_archive(archive.clone()),
                    InstallAction::delete_file(archive),
                    InstallAction::run_command("chown -R 1000:1000 /data"),
                ])
            })
            .into_registry();

        let reply = dispatch(&registry, call("modpack"));
        assert!(reply.success);
        assert_eq!(reply.message, "installing");
        let kinds: Vec<_> = reply.actions.iter().map(|a| a.action_type).collect();
        assert_eq!(kinds, [
            ActionType::CreateFolder,
            ActionType::DownloadFile,
            ActionType::ExtractArchive,
            ActionType::DeleteFile,
            ActionType::RunCommand,
        ]);
        assert_eq!(reply.actions[1].url, "https://example.invalid/pack.zip");
        assert_eq!(reply.actions[1].path, "/data/plugins/pack.zip");
    }

    #[test]
    fn only_tag_relevant_fields_are_populated() {
        let wire = WireInstallAction::from(InstallAction::proxy_to_node("/api/install", b"{}".to_vec()));
        assert_eq!(wire.action_type, ActionType::ProxyToNode);
        assert_eq!(wire.node_endpoint, "/api/install");
        assert_eq!(wire.node_payload, b"{}");
        assert!(wire.path.is_empty());
        assert!(wire.url.is_empty());
        assert!(wire.content.is_empty());
        assert!(wire.command.is_empty());

        let wire = WireInstallAction::from(InstallAction::write_file("server.properties", "motd=hi"));
        assert_eq!(wire.path, "server.properties");
        assert_eq!(wire.content, b"motd=hi");
        assert!(wire.node_endpoint.is_empty());
    }

    #[test]
    fn request_fields_reach_handler() {
        let registry = Plugin::new("test", "0.1.0")
            .addon_type("modpack", "Modpack", "", |req| {
                assert_eq!(req.server_id, "srv-1");
                assert_eq!(req.type_id, "modpack");
                AddonTypeResponse::failure(format!("refusing {}", req.file_name))
            })
            .into_registry();
        let reply = dispatch(&registry, call("modpack"));
        assert!(!reply.success);
        assert_eq!(reply.error, "refusing pack.zip");
    }
}
