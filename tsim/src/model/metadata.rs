// Traceroute fleet simulator
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version.

//! Optional `<router>_metadata.json` sidecar, with defaults filled when absent.

use serde::{Deserialize, Serialize};

/// Role a router plays in the fleet topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Internet/WAN-facing edge router.
    Gateway,
    /// Backbone/distribution router.
    Core,
    /// Access-layer router, closest to end hosts.
    Access,
    /// No particular role recorded.
    None,
}

impl Default for Role {
    fn default() -> Self {
        Role::None
    }
}

/// Per-router metadata, loaded from `<router>_metadata.json` if present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterMetadata {
    /// Whether this router is a real Linux box we can realize in the fabric. Non-Linux hops are
    /// treated as opaque.
    pub linux: bool,
    /// Free-form device type string (e.g. vendor/model), purely informational.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Free-form location label.
    pub location: String,
    /// Topological role.
    pub role: Role,
    /// Free-form vendor string.
    pub vendor: String,
    /// Whether this router can be managed (facts refreshed, fabric-realized).
    pub manageable: bool,
    /// Whether this router is the Ansible fact-collection controller (out of scope to act on
    /// here; recorded for completeness of the on-disk format).
    pub ansible_controller: bool,
}

impl Default for RouterMetadata {
    fn default() -> Self {
        Self {
            linux: true,
            device_type: String::new(),
            location: String::new(),
            role: Role::None,
            vendor: String::new(),
            manageable: true,
            ansible_controller: false,
        }
    }
}
