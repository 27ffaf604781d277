//! UI descriptor builder.
//!
//! Accumulates the pages, tabs and sidebar entries a plugin contributes to
//! the panel frontend. The descriptor is pure data; it travels inside the
//! registration payload and has no runtime behavior on the plugin side.

use serde::Deserialize;
use serde::Serialize;

use crate::envelope::b64;

/// Tab target: the per-server view.
pub const TAB_TARGET_SERVER: &str = "server";
/// Tab target: the user settings view.
pub const TAB_TARGET_USER_SETTINGS: &str = "user-settings";

pub const SIDEBAR_SECTION_NAV: &str = "nav";
pub const SIDEBAR_SECTION_PLATFORM: &str = "platform";
pub const SIDEBAR_SECTION_ADMIN: &str = "admin";

const ADMIN_GUARD: &str = "admin";

/// Frontend contributions advertised in the registration payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiDescriptor {
    #[serde(default)]
    pub has_bundle: bool,
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub bundle_data: Vec<u8>,
    #[serde(default)]
    pub pages: Vec<UiPage>,
    #[serde(default)]
    pub tabs: Vec<UiTab>,
    #[serde(default)]
    pub sidebar_items: Vec<UiSidebarItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiPage {
    pub path: String,
    pub component: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub guard: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiTab {
    pub id: String,
    pub component: String,
    pub target: String,
    pub label: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSidebarItem {
    pub id: String,
    pub label: String,
    pub href: String,
    pub section: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub guard: String,
    #[serde(default)]
    pub children: Vec<UiSidebarChild>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSidebarChild {
    pub label: String,
    pub href: String,
}

impl UiDescriptor {
    /// Mark the plugin as shipping a frontend bundle served elsewhere.
    pub fn with_bundle(mut self) -> Self {
        self.has_bundle = true;
        self
    }

    /// Ship the frontend bundle bytes inline with the registration.
    pub fn with_bundle_bytes(mut self, data: Vec<u8>) -> Self {
        self.bundle_data = data;
        self.has_bundle = true;
        self
    }

    /// Add a page and configure it through `f`.
    pub fn page(mut self, path: &str, component: &str, f: impl FnOnce(UiPage) -> UiPage) -> Self {
        self.pages.push(f(UiPage {
            path: path.to_string(),
            component: component.to_string(),
            ..Default::default()
        }));
        self
    }

    /// Add a tab and configure it through `f`.
    pub fn tab(
        mut self,
        id: &str,
        component: &str,
        target: &str,
        label: &str,
        f: impl FnOnce(UiTab) -> UiTab,
    ) -> Self {
        self.tabs.push(f(UiTab {
            id: id.to_string(),
            component: component.to_string(),
            target: target.to_string(),
            label: label.to_string(),
            ..Default::default()
        }));
        self
    }

    /// Add a sidebar item and configure it through `f`.
    pub fn sidebar_item(
        mut self,
        id: &str,
        label: &str,
        href: &str,
        section: &str,
        f: impl FnOnce(UiSidebarItem) -> UiSidebarItem,
    ) -> Self {
        self.sidebar_items.push(f(UiSidebarItem {
            id: id.to_string(),
            label: label.to_string(),
            href: href.to_string(),
            section: section.to_string(),
            ..Default::default()
        }));
        self
    }
}

impl UiPage {
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_string();
        self
    }

    pub fn guard(mut self, guard: &str) -> Self {
        self.guard = guard.to_string();
        self
    }

    pub fn admin_only(self) -> Self {
        self.guard(ADMIN_GUARD)
    }
}

impl UiTab {
    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_string();
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

impl UiSidebarItem {
    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_string();
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn admin_only(mut self) -> Self {
        self.guard = ADMIN_GUARD.to_string();
        self
    }

    pub fn child(mut self, label: &str, href: &str) -> Self {
        self.children.push(UiSidebarChild {
            label: label.to_string(),
            href: href.to_string(),
        });
        self
    }
}
