// Traceroute fleet simulator, adapted from Snowcap's telnet device connection's request/response
// shape (snowcap_runtime::frr_conn::FrrConnection), applied here to a namespace-bound TCP/UDP
// probe instead of a telnet session.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Service Runner: starts/stops a minimal echo listener inside a namespace and probes it from
//! another.

use crate::linux_ops::{LinuxOps, OpsError};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tsim::model::types::{Dscp, Proto};

/// Opaque handle to a started listener, returned by [`ServiceRunner::start_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(u64);

#[derive(Debug, Clone)]
struct ServiceEntry {
    pid: u32,
}

/// Final result of one [`ServiceRunner::test_service`] probe against one router in the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The connection or datagram exchange completed successfully.
    Ok,
    /// The router's counters show the packet was dropped or rejected.
    Fail,
    /// No response was observed before the timeout elapsed.
    Timeout,
    /// The probe itself could not be executed (namespace missing, listener not running, ...).
    Error,
}

/// Records a started listener and runs connectivity probes against it.
///
/// All namespace interaction goes through a `dyn LinuxOps`, matching the Namespace Fabric
/// Builder's isolation of kernel access, so tests exercise the lifecycle with
/// [`crate::linux_ops::MockLinuxOps`] instead of binding real sockets.
pub struct ServiceRunner<'a> {
    ops: &'a dyn LinuxOps,
    services: Mutex<std::collections::HashMap<u64, ServiceEntry>>,
    next_handle: AtomicU64,
}

impl<'a> ServiceRunner<'a> {
    /// Bind all listener/probe operations to `ops`.
    pub fn new(ops: &'a dyn LinuxOps) -> Self {
        Self { ops, services: Mutex::new(std::collections::HashMap::new()), next_handle: AtomicU64::new(1) }
    }

    /// `LinuxOps::run_ping` from `src_host` to `dst_ip`. Exposed so the orchestrator's probe fan-out
    /// never has to hold a `&dyn LinuxOps` of its own.
    pub fn ping(&self, src_host: &str, dst_ip: Ipv4Addr, timeout: Duration) -> Result<bool, OpsError> {
        self.ops.run_ping(src_host, &dst_ip.to_string(), timeout)
    }

    /// `LinuxOps::run_traceroute` from `src_host` to `dst_ip`.
    pub fn traceroute(&self, src_host: &str, dst_ip: Ipv4Addr, max_hops: u8) -> Result<Vec<String>, OpsError> {
        self.ops.run_traceroute(src_host, &dst_ip.to_string(), max_hops)
    }

    /// Spawn a minimal echo listener bound to `(bind_ip, port)` inside `host_namespace`.
    pub fn start_service(
        &self,
        host_namespace: &str,
        bind_ip: Ipv4Addr,
        port: u16,
        proto: Proto,
    ) -> Result<ServiceHandle, OpsError> {
        self.ops.link_set_up(host_namespace, "lo")?;
        let pid = self.ops.start_listener(host_namespace, &bind_ip.to_string(), port, proto)?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.services.lock().unwrap().insert(id, ServiceEntry { pid });
        Ok(ServiceHandle(id))
    }

    /// Terminate the listener. Idempotent: stopping an already-stopped or unknown handle is not
    /// an error.
    pub fn stop_service(&self, handle: ServiceHandle) {
        if let Some(entry) = self.services.lock().unwrap().remove(&handle.0) {
            let _ = self.ops.stop_listener(entry.pid);
        }
    }

    /// True if `handle` still refers to a running listener.
    pub fn is_running(&self, handle: ServiceHandle) -> bool {
        self.services.lock().unwrap().contains_key(&handle.0)
    }

    /// Probe connectivity from `src_host` to `dst_ip:dport`, optionally marking outgoing packets
    /// with `dscp` so the Packet-Count Analyzer can disambiguate this job's traffic from
    /// concurrent ones sharing the same five-tuple.
    ///
    /// The verdict comes from a real connection attempt issued inside `src_host`'s namespace
    /// (`LinuxOps::run_connect`), so it depends on whatever routing and iptables state the fleet
    /// actually has, not on anything tracked in this process.
    pub fn test_service(
        &self,
        src_host: &str,
        dst_ip: Ipv4Addr,
        dport: u16,
        proto: Proto,
        timeout: Duration,
        dscp: Option<Dscp>,
    ) -> ProbeVerdict {
        match self.ops.run_connect(src_host, &dst_ip.to_string(), dport, proto, dscp, timeout) {
            Ok(true) => ProbeVerdict::Ok,
            Ok(false) => ProbeVerdict::Fail,
            Err(_) => ProbeVerdict::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux_ops::MockLinuxOps;

    #[test]
    fn probe_succeeds_once_service_is_started() {
        let ops = MockLinuxOps::new();
        let runner = ServiceRunner::new(&ops);
        let dst: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let handle = runner.start_service("host-dst", dst, 8080, Proto::Tcp).unwrap();
        assert!(runner.is_running(handle));

        let verdict = runner.test_service("host-src", dst, 8080, Proto::Tcp, Duration::from_secs(1), None);
        assert_eq!(verdict, ProbeVerdict::Ok);

        runner.stop_service(handle);
        assert!(!runner.is_running(handle));
        let verdict_after_stop =
            runner.test_service("host-src", dst, 8080, Proto::Tcp, Duration::from_secs(1), None);
        assert_eq!(verdict_after_stop, ProbeVerdict::Fail);
    }

    #[test]
    fn stop_service_is_idempotent() {
        let ops = MockLinuxOps::new();
        let runner = ServiceRunner::new(&ops);
        let handle = ServiceHandle(999);
        runner.stop_service(handle);
        runner.stop_service(handle);
    }
}
