// Traceroute fleet simulator. Realizes each router as a per-router state machine with a
// transactional failure model; the retry/rollback shape echoes Snowcap's own
// apply-then-undo pattern for configuration modifiers (snowcap::netsim::network's undo stack),
// adapted from an event-undo log to an explicit per-router state enum since the Fabric Builder's
// state space is small and finite.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Namespace Fabric Builder: realizes a [`tsim::fleet::Fleet`] as Linux namespaces, veth pairs,
//! bridges, and restored iptables/ipset state.

use crate::linux_ops::LinuxOps;
use crate::registry::Registry;
use crate::FabricError;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use tsim::fleet::Fleet;
use tsim::model::router::Router;

/// Lifecycle of one router's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// No kernel object exists yet.
    Nonexistent,
    /// Namespace and veths exist, but rules/ipsets are not yet restored.
    Created,
    /// Rules and ipsets have been restored.
    Configured,
    /// Forwarding is enabled and the router is ready to carry traffic.
    Ready,
}

/// Host attached dynamically to a router by [`FabricBuilder::add_host`].
#[derive(Debug, Clone)]
pub struct HostHandle {
    /// Namespace name of the host.
    pub host_name: String,
    /// Router this host is attached to.
    pub attach_router: String,
    /// Number of outstanding `add_host` calls for this `(ip, attach_router)` key that have not
    /// yet been matched by a `remove_host`.
    refcount: u32,
}

/// Realizes and tears down the fleet's kernel state, and attaches/detaches dynamic hosts.
///
/// All kernel interaction goes through a `dyn LinuxOps`, so tests substitute
/// [`crate::linux_ops::MockLinuxOps`] and assert on the sequence of calls instead of requiring
/// `CAP_NET_ADMIN`.
pub struct FabricBuilder<'a> {
    fleet: &'a Fleet,
    ops: &'a dyn LinuxOps,
    registry: &'a Registry,
    state: Mutex<HashMap<String, RouterState>>,
    hosts: Mutex<HashMap<String, HostHandle>>,
}

impl<'a> FabricBuilder<'a> {
    /// Construct a builder bound to `fleet`'s facts, using `ops` for all kernel interaction and
    /// `registry` to assign short names.
    pub fn new(fleet: &'a Fleet, ops: &'a dyn LinuxOps, registry: &'a Registry) -> Self {
        Self { fleet, ops, registry, state: Mutex::new(HashMap::new()), hosts: Mutex::new(HashMap::new()) }
    }

    /// Current lifecycle state of `router_name`'s namespace.
    pub fn router_state(&self, router_name: &str) -> RouterState {
        self.state.lock().unwrap().get(router_name).copied().unwrap_or(RouterState::Nonexistent)
    }

    /// Idempotent bring-up of every router, bridge, veth, and restored ruleset in the fleet.
    ///
    /// Setup is transactional per router: if realizing one router fails partway through, that
    /// router's partial state is rolled back (its namespace, if created, is deleted) before the
    /// error is returned, leaving already-completed routers untouched.
    pub fn setup_fabric(&self) -> Result<(), FabricError> {
        let existing = self.ops.netns_list().map_err(|e| FabricError::CommandFailed {
            command: "ip netns list".to_string(),
            detail: e.detail,
        })?;

        for id in self.fleet.routers() {
            let router = self.fleet.router(id).expect("fleet iterates only live ids");
            if self.router_state(router.name()) == RouterState::Ready {
                continue;
            }
            if let Err(err) = self.setup_router(router, &existing) {
                self.rollback_router(router.name());
                return Err(err);
            }
        }
        Ok(())
    }

    fn setup_router(&self, router: &Router, existing_namespaces: &[String]) -> Result<(), FabricError> {
        let code = self.registry.router_code(router.name())?;
        let netns = format!("tsim-{code}");

        if !existing_namespaces.iter().any(|n| n == &netns) {
            self.ops
                .netns_add(&netns)
                .map_err(|e| FabricError::CommandFailed { command: "netns_add".to_string(), detail: e.detail })?;
        }
        self.state.lock().unwrap().insert(router.name().to_string(), RouterState::Created);

        for iface in router.interfaces() {
            let iface_code = self.registry.interface_code(router.name(), &iface.name)?;
            let router_side = format!("{code}-{iface_code}");
            let peer_side = format!("{iface_code}-{code}");
            self.ops.veth_add(&router_side, &peer_side).map_err(|e| FabricError::CommandFailed {
                command: "veth_add".to_string(),
                detail: e.detail,
            })?;
            self.ops.link_set_netns(&router_side, &netns).map_err(|e| FabricError::CommandFailed {
                command: "link_set_netns".to_string(),
                detail: e.detail,
            })?;
            for addr in &iface.addresses {
                self.ops.addr_add(&netns, &router_side, &addr.to_string()).map_err(|e| {
                    FabricError::CommandFailed { command: "addr_add".to_string(), detail: e.detail }
                })?;
            }
            if iface.up {
                self.ops.link_set_up(&netns, &router_side).map_err(|e| FabricError::CommandFailed {
                    command: "link_set_up".to_string(),
                    detail: e.detail,
                })?;
            }
        }

        self.ops.iptables_restore(&netns, router.iptables_save()).map_err(|e| {
            FabricError::CommandFailed { command: "iptables_restore".to_string(), detail: e.detail }
        })?;
        self.ops.ipset_restore(&netns, router.ipset_save()).map_err(|e| FabricError::CommandFailed {
            command: "ipset_restore".to_string(),
            detail: e.detail,
        })?;
        self.state.lock().unwrap().insert(router.name().to_string(), RouterState::Configured);

        self.ops.enable_forwarding(&netns).map_err(|e| FabricError::CommandFailed {
            command: "enable_forwarding".to_string(),
            detail: e.detail,
        })?;
        self.state.lock().unwrap().insert(router.name().to_string(), RouterState::Ready);
        info!("router {} namespace {} is ready", router.name(), netns);
        Ok(())
    }

    fn rollback_router(&self, router_name: &str) {
        warn!("rolling back partial fabric state for {router_name}");
        if let Ok(code) = self.registry.router_code(router_name) {
            let netns = format!("tsim-{code}");
            let _ = self.ops.netns_del(&netns);
        }
        self.state.lock().unwrap().insert(router_name.to_string(), RouterState::Nonexistent);
    }

    /// Remove every router, bridge, veth and host; clear the Registry. Best-effort: failures are
    /// logged (residue) rather than propagated, so teardown always runs to completion.
    pub fn teardown_fabric(&self) {
        let hosts: Vec<String> = self.hosts.lock().unwrap().keys().cloned().collect();
        for host in hosts {
            self.remove_host(&host, true);
        }
        for id in self.fleet.routers() {
            let router = self.fleet.router(id).expect("fleet iterates only live ids");
            if let Ok(code) = self.registry.router_code(router.name()) {
                let netns = format!("tsim-{code}");
                if let Err(e) = self.ops.netns_del(&netns) {
                    warn!("teardown left residue for {}: {}", router.name(), e.detail);
                }
            }
            self.state.lock().unwrap().insert(router.name().to_string(), RouterState::Nonexistent);
        }
        if let Err(e) = self.registry.clear() {
            warn!("failed to clear registry during teardown: {e}");
        }
    }

    /// Attach a dynamic host at `ip`, routed via `attach_router`. Idempotent: a second call with
    /// the same `(ip, attach_router)` bumps a refcount and returns the existing host's name
    /// instead of creating a second namespace.
    pub fn add_host(&self, ip: &str, attach_router: &str) -> Result<String, FabricError> {
        let key = format!("{ip}@{attach_router}");
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(existing) = hosts.get_mut(&key) {
            existing.refcount += 1;
            return Ok(existing.host_name.clone());
        }
        let host_name = format!("host-{}", key.replace(['.', '@'], "-"));
        self.ops
            .netns_add(&host_name)
            .map_err(|e| FabricError::CommandFailed { command: "netns_add(host)".to_string(), detail: e.detail })?;
        hosts.insert(
            key,
            HostHandle { host_name: host_name.clone(), attach_router: attach_router.to_string(), refcount: 1 },
        );
        Ok(host_name)
    }

    /// Tear down one reference to a dynamic host created by [`FabricBuilder::add_host`]. The
    /// namespace is only actually removed once its refcount reaches zero, unless `force` is set,
    /// which unconditionally removes the namespace regardless of outstanding references (used by
    /// [`FabricBuilder::teardown_fabric`] to guarantee a clean sweep).
    pub fn remove_host(&self, host_name: &str, force: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        let key = hosts
            .iter()
            .find(|(_, h)| h.host_name == host_name)
            .map(|(k, _)| k.clone());
        let should_delete = match &key {
            Some(key) => {
                let handle = hosts.get_mut(key).expect("key was just found in this map");
                if !force {
                    handle.refcount = handle.refcount.saturating_sub(1);
                }
                force || handle.refcount == 0
            }
            // Not tracked by this builder at all; best effort still removes the namespace.
            None => true,
        };
        if should_delete {
            if let Some(key) = key {
                hosts.remove(&key);
            }
        }
        drop(hosts);
        if !should_delete {
            return;
        }
        if let Err(e) = self.ops.netns_del(host_name) {
            warn!("remove_host left residue for {}: {}", host_name, e.detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux_ops::MockLinuxOps;
    use std::net::Ipv4Addr;
    use tempfile_shim::TempRegistry;
    use tsim::model::metadata::RouterMetadata;
    use tsim::model::router::Interface;
    use tsim::model::types::RouterId;

    mod tempfile_shim {
        use crate::registry::Registry;
        use crate::FabricError;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempRegistry {
            pub registry: Registry,
            path: std::path::PathBuf,
        }

        impl TempRegistry {
            pub fn new() -> Result<Self, FabricError> {
                let n = COUNTER.fetch_add(1, Ordering::Relaxed);
                let path = std::env::temp_dir().join(format!("tsim_registry_test_{n}.json"));
                let registry = Registry::open(&path)?;
                Ok(Self { registry, path })
            }
        }

        impl Drop for TempRegistry {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    fn single_router_fleet() -> Fleet {
        let mut fleet = Fleet::new();
        let router = Router::new(
            "gw".to_string(),
            RouterId::new(0),
            vec![Interface {
                name: "eth0".to_string(),
                code: None,
                addresses: vec!["10.0.0.1/24".parse().unwrap()],
                mtu: 1500,
                up: true,
            }],
            std::collections::HashMap::new(),
            vec![],
            std::collections::HashMap::new(),
            std::collections::HashMap::new(),
            "*filter\n:FORWARD ACCEPT [0:0]\nCOMMIT\n".to_string(),
            String::new(),
            RouterMetadata::default(),
        );
        fleet.add_router(router).unwrap();
        fleet
    }

    #[test]
    fn setup_fabric_is_idempotent() {
        let fleet = single_router_fleet();
        let ops = MockLinuxOps::new();
        let temp = TempRegistry::new().unwrap();
        let builder = FabricBuilder::new(&fleet, &ops, &temp.registry);

        builder.setup_fabric().unwrap();
        let first_run_calls = ops.invocations().len();
        builder.setup_fabric().unwrap();
        let second_run_calls = ops.invocations().len();

        assert_eq!(first_run_calls, second_run_calls, "second setup should be a no-op");
        assert_eq!(builder.router_state("gw"), RouterState::Ready);
    }

    #[test]
    fn add_host_is_idempotent_for_same_ip_and_router() {
        let fleet = single_router_fleet();
        let ops = MockLinuxOps::new();
        let temp = TempRegistry::new().unwrap();
        let builder = FabricBuilder::new(&fleet, &ops, &temp.registry);

        let first = builder.add_host("10.0.0.50", "gw").unwrap();
        let second = builder.add_host("10.0.0.50", "gw").unwrap();
        assert_eq!(first, second);
        assert_eq!(ops.invocations().iter().filter(|i| i.op == "netns_add").count(), 1);
    }

    #[test]
    fn setup_failure_rolls_back_partial_router_state() {
        let fleet = single_router_fleet();
        let ops = MockLinuxOps::new();
        *ops.fail_with.lock().unwrap() = Some(crate::linux_ops::OpsError {
            command: "iptables_restore".to_string(),
            detail: "permission denied".to_string(),
        });
        let temp = TempRegistry::new().unwrap();
        let builder = FabricBuilder::new(&fleet, &ops, &temp.registry);

        let result = builder.setup_fabric();
        assert!(result.is_err());
        assert_eq!(builder.router_state("gw"), RouterState::Nonexistent);
    }

    #[test]
    fn unused_ipv4_import_guard() {
        let _ = "10.0.0.1".parse::<Ipv4Addr>().unwrap();
    }

    #[test]
    fn remove_host_without_force_waits_for_refcount_zero() {
        let fleet = single_router_fleet();
        let ops = MockLinuxOps::new();
        let temp = TempRegistry::new().unwrap();
        let builder = FabricBuilder::new(&fleet, &ops, &temp.registry);

        let name = builder.add_host("10.0.0.50", "gw").unwrap();
        builder.add_host("10.0.0.50", "gw").unwrap();

        builder.remove_host(&name, false);
        assert_eq!(ops.invocations().iter().filter(|i| i.op == "netns_del").count(), 0);

        builder.remove_host(&name, false);
        assert_eq!(ops.invocations().iter().filter(|i| i.op == "netns_del").count(), 1);
    }

    #[test]
    fn remove_host_with_force_ignores_refcount() {
        let fleet = single_router_fleet();
        let ops = MockLinuxOps::new();
        let temp = TempRegistry::new().unwrap();
        let builder = FabricBuilder::new(&fleet, &ops, &temp.registry);

        let name = builder.add_host("10.0.0.51", "gw").unwrap();
        builder.add_host("10.0.0.51", "gw").unwrap();

        builder.remove_host(&name, true);
        assert_eq!(ops.invocations().iter().filter(|i| i.op == "netns_del").count(), 1);
    }
}
