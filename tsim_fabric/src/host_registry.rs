// Traceroute fleet simulator. Adapted from the Registry's own locked-state read-modify-write
// idiom so concurrent acquire/release calls stay consistent.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Host Registry: refcounts dynamically-attached hosts so a host namespace is only removed once
//! every probe that acquired it has released it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// A dynamically-attached host and how many live references hold it up.
#[derive(Debug, Clone)]
pub struct HostRef {
    /// IP address the host was attached at.
    pub ip: Ipv4Addr,
    /// Router the host is attached to.
    pub attach_router: String,
    /// Namespace name realizing the host.
    pub host_namespace_name: String,
    /// Number of live acquisitions.
    pub refcount: u32,
}

/// In-memory refcounted registry of attached hosts, keyed by `(ip, attach_router)`.
///
/// One process holds one `HostRegistry`; the Fabric Builder consults it before tearing down a
/// host namespace so a host still in use by another in-flight probe is never removed out from
/// under it.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Mutex<HashMap<(Ipv4Addr, String), HostRef>>,
}

impl HostRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a reference to the host at `ip` attached to `attach_router`, creating it (refcount
    /// 1) if this is the first acquisition, or incrementing the refcount if it already exists.
    /// Returns the namespace name to use, and whether this call created it.
    pub fn acquire_host_ref(
        &self,
        ip: Ipv4Addr,
        attach_router: &str,
        namespace_name_for_new: impl FnOnce() -> String,
    ) -> (String, bool) {
        let mut hosts = self.hosts.lock().unwrap();
        let key = (ip, attach_router.to_string());
        if let Some(existing) = hosts.get_mut(&key) {
            existing.refcount += 1;
            return (existing.host_namespace_name.clone(), false);
        }
        let host_namespace_name = namespace_name_for_new();
        hosts.insert(
            key,
            HostRef {
                ip,
                attach_router: attach_router.to_string(),
                host_namespace_name: host_namespace_name.clone(),
                refcount: 1,
            },
        );
        (host_namespace_name, true)
    }

    /// Release a reference previously acquired. Returns `true` if the refcount dropped to zero
    /// and the caller should now tear down the host's namespace; `false` if other references
    /// remain, or if no such host was registered (a double-release, which is a caller bug but not
    /// fatal here).
    pub fn release_host_ref(&self, ip: Ipv4Addr, attach_router: &str) -> bool {
        let mut hosts = self.hosts.lock().unwrap();
        let key = (ip, attach_router.to_string());
        let Some(existing) = hosts.get_mut(&key) else {
            return false;
        };
        existing.refcount = existing.refcount.saturating_sub(1);
        if existing.refcount == 0 {
            hosts.remove(&key);
            true
        } else {
            false
        }
    }

    /// True if `ip` is already attached to some router other than `attach_router`, which the
    /// caller should treat as a conflict: a host address has exactly one attachment point.
    pub fn check_conflicts(&self, ip: Ipv4Addr, attach_router: &str) -> Option<String> {
        self.hosts
            .lock()
            .unwrap()
            .keys()
            .find(|(host_ip, router)| *host_ip == ip && router != attach_router)
            .map(|(_, router)| router.clone())
    }

    /// Current refcount for `(ip, attach_router)`, or 0 if not registered.
    pub fn refcount(&self, ip: Ipv4Addr, attach_router: &str) -> u32 {
        self.hosts
            .lock()
            .unwrap()
            .get(&(ip, attach_router.to_string()))
            .map(|h| h.refcount)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_increments_instead_of_recreating() {
        let registry = HostRegistry::new();
        let ip: Ipv4Addr = "10.0.0.50".parse().unwrap();
        let (name_a, created_a) = registry.acquire_host_ref(ip, "gw", || "host-a".to_string());
        let (name_b, created_b) = registry.acquire_host_ref(ip, "gw", || "host-b".to_string());
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(name_a, name_b);
        assert_eq!(registry.refcount(ip, "gw"), 2);
    }

    #[test]
    fn host_only_tears_down_after_last_release() {
        let registry = HostRegistry::new();
        let ip: Ipv4Addr = "10.0.0.50".parse().unwrap();
        registry.acquire_host_ref(ip, "gw", || "host-a".to_string());
        registry.acquire_host_ref(ip, "gw", || "host-a".to_string());

        assert!(!registry.release_host_ref(ip, "gw"), "one reference remains");
        assert!(registry.release_host_ref(ip, "gw"), "last reference should signal teardown");
        assert_eq!(registry.refcount(ip, "gw"), 0);
    }

    #[test]
    fn conflicting_attach_router_is_detected() {
        let registry = HostRegistry::new();
        let ip: Ipv4Addr = "10.0.0.50".parse().unwrap();
        registry.acquire_host_ref(ip, "gw-a", || "host-a".to_string());
        assert_eq!(registry.check_conflicts(ip, "gw-b"), Some("gw-a".to_string()));
        assert_eq!(registry.check_conflicts(ip, "gw-a"), None);
    }
}
