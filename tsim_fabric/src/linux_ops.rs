// Traceroute fleet simulator, adapted from Snowcap's telnet device connection
// (snowcap_runtime::frr_conn::FrrConnection), which isolates all interaction with a real device
// behind a narrow API so the rest of the crate never shells out or opens a socket directly.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! `LinuxOps`: the capability interface through which the Namespace Fabric Builder touches the
//! kernel. Isolating every subprocess/syscall call behind this trait is what lets
//! [`MockLinuxOps`] replace the kernel in unit tests instead of shelling out to `ip`/`iptables`.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tsim::model::types::{Dscp, Proto};

/// Error returned by a `LinuxOps` call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{command} failed: {detail}")]
pub struct OpsError {
    /// Command or syscall that failed.
    pub command: String,
    /// stderr text or errno description.
    pub detail: String,
}

/// The Linux primitives the Fabric Builder and Service Runner need: namespace lifecycle,
/// interface/veth/bridge management, and verbatim restoration of iptables/ipset state.
///
/// Every method takes borrowed string slices and returns `Result<(), OpsError>` or a small typed
/// result; nothing here keeps state beyond the underlying kernel objects, so a `LinuxOps` impl can
/// be freely shared behind a `&dyn LinuxOps`.
pub trait LinuxOps: Send + Sync {
    /// `ip netns add <name>`
    fn netns_add(&self, name: &str) -> Result<(), OpsError>;
    /// `ip netns del <name>`
    fn netns_del(&self, name: &str) -> Result<(), OpsError>;
    /// `ip link add <veth_a> type veth peer name <veth_b>`
    fn veth_add(&self, veth_a: &str, veth_b: &str) -> Result<(), OpsError>;
    /// `ip link del <veth>` (deletes both ends of the pair)
    fn veth_del(&self, veth: &str) -> Result<(), OpsError>;
    /// `ip link set <iface> netns <netns>`
    fn link_set_netns(&self, iface: &str, netns: &str) -> Result<(), OpsError>;
    /// `ip -n <netns> addr add <cidr> dev <iface>`
    fn addr_add(&self, netns: &str, iface: &str, cidr: &str) -> Result<(), OpsError>;
    /// `ip -n <netns> link set <iface> up`
    fn link_set_up(&self, netns: &str, iface: &str) -> Result<(), OpsError>;
    /// `ip link add name <bridge> type bridge`
    fn bridge_add(&self, bridge: &str) -> Result<(), OpsError>;
    /// `ip link set <iface> master <bridge>`
    fn bridge_attach(&self, bridge: &str, iface: &str) -> Result<(), OpsError>;
    /// `ip netns exec <netns> iptables-restore < <text>` (applied per table)
    fn iptables_restore(&self, netns: &str, iptables_save_text: &str) -> Result<(), OpsError>;
    /// `ip netns exec <netns> ipset restore < <text>`
    fn ipset_restore(&self, netns: &str, ipset_save_text: &str) -> Result<(), OpsError>;
    /// `ip netns exec <netns> sysctl -w net.ipv4.ip_forward=1`
    fn enable_forwarding(&self, netns: &str) -> Result<(), OpsError>;
    /// `ip -n <netns> route add <dest> via <gateway> dev <iface>`
    fn route_add(&self, netns: &str, dest: &str, gateway: &str, iface: &str) -> Result<(), OpsError>;
    /// List network namespaces currently present (`ip netns list`), used by idempotent setup to
    /// decide what already exists.
    fn netns_list(&self) -> Result<Vec<String>, OpsError>;
    /// `ip netns exec <netns> ping -c1 -W<timeout> <dst>`. Returns whether a reply was received;
    /// a non-reply is an ordinary probe outcome, not an `OpsError`.
    fn run_ping(&self, netns: &str, dst: &str, timeout: Duration) -> Result<bool, OpsError>;
    /// `ip netns exec <netns> traceroute -n -m<max_hops> <dst>`. Returns the responding hop
    /// addresses in order, one per discovered hop.
    fn run_traceroute(&self, netns: &str, dst: &str, max_hops: u8) -> Result<Vec<String>, OpsError>;
    /// Start a background listener bound to `(bind_ip, port)` inside `netns`, returning its pid so
    /// it can later be killed by [`LinuxOps::stop_listener`].
    fn start_listener(&self, netns: &str, bind_ip: &str, port: u16, proto: Proto) -> Result<u32, OpsError>;
    /// Kill a listener previously started by [`LinuxOps::start_listener`].
    fn stop_listener(&self, pid: u32) -> Result<(), OpsError>;
    /// `ip netns exec <netns> nc [-u] -z -w<timeout> [-T <dscp>] <dst> <port>`. Returns whether the
    /// connection (or, for UDP, the datagram round trip) succeeded; this is what actually routes
    /// the probe through the namespace's real FORWARD chain, so the verdict depends on the fleet's
    /// firewall state rather than anything tracked in this process. `dscp`, when set, tags the
    /// probe's outgoing packets so the Packet-Count Analyzer can disambiguate concurrent jobs.
    fn run_connect(
        &self,
        netns: &str,
        dst: &str,
        port: u16,
        proto: Proto,
        dscp: Option<Dscp>,
        timeout: Duration,
    ) -> Result<bool, OpsError>;
}

/// Real `LinuxOps`, shelling out to `ip`, `iptables-restore` and `ipset`.
#[derive(Debug, Default)]
pub struct SystemLinuxOps;

impl SystemLinuxOps {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), OpsError> {
        let output = Command::new(program).args(args).output().map_err(|e| OpsError {
            command: format!("{program} {}", args.join(" ")),
            detail: e.to_string(),
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OpsError {
                command: format!("{program} {}", args.join(" ")),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn run_with_stdin(&self, program: &str, args: &[&str], stdin_text: &str) -> Result<(), OpsError> {
        use std::io::Write;
        use std::process::Stdio;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OpsError { command: program.to_string(), detail: e.to_string() })?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(stdin_text.as_bytes())
            .map_err(|e| OpsError { command: program.to_string(), detail: e.to_string() })?;
        let output = child
            .wait_with_output()
            .map_err(|e| OpsError { command: program.to_string(), detail: e.to_string() })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OpsError {
                command: program.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl LinuxOps for SystemLinuxOps {
    fn netns_add(&self, name: &str) -> Result<(), OpsError> {
        self.run("ip", &["netns", "add", name])
    }

    fn netns_del(&self, name: &str) -> Result<(), OpsError> {
        self.run("ip", &["netns", "del", name])
    }

    fn veth_add(&self, veth_a: &str, veth_b: &str) -> Result<(), OpsError> {
        self.run("ip", &["link", "add", veth_a, "type", "veth", "peer", "name", veth_b])
    }

    fn veth_del(&self, veth: &str) -> Result<(), OpsError> {
        self.run("ip", &["link", "del", veth])
    }

    fn link_set_netns(&self, iface: &str, netns: &str) -> Result<(), OpsError> {
        self.run("ip", &["link", "set", iface, "netns", netns])
    }

    fn addr_add(&self, netns: &str, iface: &str, cidr: &str) -> Result<(), OpsError> {
        self.run("ip", &["-n", netns, "addr", "add", cidr, "dev", iface])
    }

    fn link_set_up(&self, netns: &str, iface: &str) -> Result<(), OpsError> {
        self.run("ip", &["-n", netns, "link", "set", iface, "up"])
    }

    fn bridge_add(&self, bridge: &str) -> Result<(), OpsError> {
        self.run("ip", &["link", "add", "name", bridge, "type", "bridge"])
    }

    fn bridge_attach(&self, bridge: &str, iface: &str) -> Result<(), OpsError> {
        self.run("ip", &["link", "set", iface, "master", bridge])
    }

    fn iptables_restore(&self, netns: &str, iptables_save_text: &str) -> Result<(), OpsError> {
        self.run_with_stdin("ip", &["netns", "exec", netns, "iptables-restore"], iptables_save_text)
    }

    fn ipset_restore(&self, netns: &str, ipset_save_text: &str) -> Result<(), OpsError> {
        self.run_with_stdin("ip", &["netns", "exec", netns, "ipset", "restore"], ipset_save_text)
    }

    fn enable_forwarding(&self, netns: &str) -> Result<(), OpsError> {
        self.run("ip", &["netns", "exec", netns, "sysctl", "-w", "net.ipv4.ip_forward=1"])
    }

    fn route_add(&self, netns: &str, dest: &str, gateway: &str, iface: &str) -> Result<(), OpsError> {
        self.run("ip", &["-n", netns, "route", "add", dest, "via", gateway, "dev", iface])
    }

    fn netns_list(&self) -> Result<Vec<String>, OpsError> {
        let output = Command::new("ip").args(["netns", "list"]).output().map_err(|e| OpsError {
            command: "ip netns list".to_string(),
            detail: e.to_string(),
        })?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .map(|s| s.to_string())
            .collect())
    }

    fn run_ping(&self, netns: &str, dst: &str, timeout: Duration) -> Result<bool, OpsError> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let output = Command::new("ip")
            .args(["netns", "exec", netns, "ping", "-c", "1", "-W", &wait_secs, dst])
            .output()
            .map_err(|e| OpsError { command: "ping".to_string(), detail: e.to_string() })?;
        Ok(output.status.success())
    }

    fn run_traceroute(&self, netns: &str, dst: &str, max_hops: u8) -> Result<Vec<String>, OpsError> {
        let max_hops = max_hops.to_string();
        let output = Command::new("ip")
            .args(["netns", "exec", netns, "traceroute", "-n", "-m", &max_hops, dst])
            .output()
            .map_err(|e| OpsError { command: "traceroute".to_string(), detail: e.to_string() })?;
        let hops = String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().nth(1).map(|s| s.to_string()))
            .collect();
        Ok(hops)
    }

    fn start_listener(&self, netns: &str, bind_ip: &str, port: u16, proto: Proto) -> Result<u32, OpsError> {
        let port = port.to_string();
        let mut args = vec!["netns", "exec", netns, "nc", "-l"];
        if proto == Proto::Udp {
            args.push("-u");
        }
        args.extend(["-s", bind_ip, &port]);
        let child = Command::new("ip")
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| OpsError { command: "nc -l".to_string(), detail: e.to_string() })?;
        Ok(child.id())
    }

    fn stop_listener(&self, pid: u32) -> Result<(), OpsError> {
        self.run("kill", &["-9", &pid.to_string()])
    }

    fn run_connect(
        &self,
        netns: &str,
        dst: &str,
        port: u16,
        proto: Proto,
        dscp: Option<Dscp>,
        timeout: Duration,
    ) -> Result<bool, OpsError> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let port = port.to_string();
        let dscp_str = dscp.map(|d| d.to_string());
        let mut args = vec!["netns", "exec", netns, "nc", "-z", "-w", &wait_secs];
        if proto == Proto::Udp {
            args.push("-u");
        }
        if let Some(dscp_str) = &dscp_str {
            args.extend(["-T", dscp_str]);
        }
        args.extend([dst, &port]);
        let output = Command::new("ip")
            .args(&args)
            .output()
            .map_err(|e| OpsError { command: "nc -z".to_string(), detail: e.to_string() })?;
        Ok(output.status.success())
    }
}

/// One recorded call to a [`MockLinuxOps`], for asserting the Fabric Builder issued the expected
/// sequence of operations without needing a real kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Operation name (`netns_add`, `veth_add`, ...).
    pub op: String,
    /// Arguments passed to the operation, in call order.
    pub args: Vec<String>,
}

/// In-memory `LinuxOps` used by unit tests: records every call and tracks namespace existence so
/// idempotent setup/teardown logic can be exercised without privilege.
#[derive(Debug)]
pub struct MockLinuxOps {
    log: Mutex<Vec<Invocation>>,
    namespaces: Mutex<Vec<String>>,
    /// When set, every call fails with this error instead of succeeding; used to test
    /// `SetupFabric`'s rollback-on-error path.
    pub fail_with: Mutex<Option<OpsError>>,
    /// Canned verdict for [`LinuxOps::run_ping`], defaulting to a reply received.
    pub ping_verdict: Mutex<bool>,
    /// Canned hop list for [`LinuxOps::run_traceroute`], defaulting to none.
    pub traceroute_hops: Mutex<Vec<String>>,
    /// Canned verdict for [`LinuxOps::run_connect`], defaulting to a successful connection.
    pub connect_verdict: Mutex<bool>,
    next_pid: Mutex<u32>,
}

impl Default for MockLinuxOps {
    fn default() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            namespaces: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            ping_verdict: Mutex::new(true),
            traceroute_hops: Mutex::new(Vec::new()),
            connect_verdict: Mutex::new(true),
            next_pid: Mutex::new(1),
        }
    }
}

impl MockLinuxOps {
    /// A fresh mock with no recorded calls and no namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls recorded so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().unwrap().clone()
    }

    /// Namespaces currently considered to exist.
    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.lock().unwrap().clone()
    }

    fn record(&self, op: &str, args: &[&str]) -> Result<(), OpsError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.log.lock().unwrap().push(Invocation {
            op: op.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        Ok(())
    }
}

impl LinuxOps for MockLinuxOps {
    fn netns_add(&self, name: &str) -> Result<(), OpsError> {
        self.record("netns_add", &[name])?;
        let mut ns = self.namespaces.lock().unwrap();
        if !ns.iter().any(|n| n == name) {
            ns.push(name.to_string());
        }
        Ok(())
    }

    fn netns_del(&self, name: &str) -> Result<(), OpsError> {
        self.record("netns_del", &[name])?;
        self.namespaces.lock().unwrap().retain(|n| n != name);
        Ok(())
    }

    fn veth_add(&self, veth_a: &str, veth_b: &str) -> Result<(), OpsError> {
        self.record("veth_add", &[veth_a, veth_b])
    }

    fn veth_del(&self, veth: &str) -> Result<(), OpsError> {
        self.record("veth_del", &[veth])
    }

    fn link_set_netns(&self, iface: &str, netns: &str) -> Result<(), OpsError> {
        self.record("link_set_netns", &[iface, netns])
    }

    fn addr_add(&self, netns: &str, iface: &str, cidr: &str) -> Result<(), OpsError> {
        self.record("addr_add", &[netns, iface, cidr])
    }

    fn link_set_up(&self, netns: &str, iface: &str) -> Result<(), OpsError> {
        self.record("link_set_up", &[netns, iface])
    }

    fn bridge_add(&self, bridge: &str) -> Result<(), OpsError> {
        self.record("bridge_add", &[bridge])
    }

    fn bridge_attach(&self, bridge: &str, iface: &str) -> Result<(), OpsError> {
        self.record("bridge_attach", &[bridge, iface])
    }

    fn iptables_restore(&self, netns: &str, iptables_save_text: &str) -> Result<(), OpsError> {
        self.record("iptables_restore", &[netns, iptables_save_text])
    }

    fn ipset_restore(&self, netns: &str, ipset_save_text: &str) -> Result<(), OpsError> {
        self.record("ipset_restore", &[netns, ipset_save_text])
    }

    fn enable_forwarding(&self, netns: &str) -> Result<(), OpsError> {
        self.record("enable_forwarding", &[netns])
    }

    fn route_add(&self, netns: &str, dest: &str, gateway: &str, iface: &str) -> Result<(), OpsError> {
        self.record("route_add", &[netns, dest, gateway, iface])
    }

    fn netns_list(&self) -> Result<Vec<String>, OpsError> {
        Ok(self.namespaces.lock().unwrap().clone())
    }

    fn run_ping(&self, netns: &str, dst: &str, timeout: Duration) -> Result<bool, OpsError> {
        self.record("run_ping", &[netns, dst, &timeout.as_secs().to_string()])?;
        Ok(*self.ping_verdict.lock().unwrap())
    }

    fn run_traceroute(&self, netns: &str, dst: &str, max_hops: u8) -> Result<Vec<String>, OpsError> {
        self.record("run_traceroute", &[netns, dst, &max_hops.to_string()])?;
        Ok(self.traceroute_hops.lock().unwrap().clone())
    }

    fn start_listener(&self, netns: &str, bind_ip: &str, port: u16, proto: Proto) -> Result<u32, OpsError> {
        self.record("start_listener", &[netns, bind_ip, &port.to_string(), &proto.to_string()])?;
        let mut next_pid = self.next_pid.lock().unwrap();
        let pid = *next_pid;
        *next_pid += 1;
        Ok(pid)
    }

    fn stop_listener(&self, pid: u32) -> Result<(), OpsError> {
        self.record("stop_listener", &[&pid.to_string()])
    }

    fn run_connect(
        &self,
        netns: &str,
        dst: &str,
        port: u16,
        proto: Proto,
        dscp: Option<Dscp>,
        timeout: Duration,
    ) -> Result<bool, OpsError> {
        self.record(
            "run_connect",
            &[
                netns,
                dst,
                &port.to_string(),
                &proto.to_string(),
                &dscp.map(|d| d.to_string()).unwrap_or_default(),
                &timeout.as_secs().to_string(),
            ],
        )?;
        Ok(*self.connect_verdict.lock().unwrap())
    }
}
