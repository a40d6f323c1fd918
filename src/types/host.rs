//! Host discovery state

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::SystemTime;

/// What we know about the host we are talking to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// True once anything has been received from the host.
    pub found: bool,
    /// Time of the latest receipt from the host.
    pub last_confirmation: Option<SystemTime>,
    pub machine_name: String,
    pub machine_address: Ipv4Addr,
    pub program_name: String,
    /// Module id, major, minor, bugfix.
    pub program_version: [u8; 4],
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            found: false,
            last_confirmation: None,
            machine_name: String::new(),
            machine_address: Ipv4Addr::UNSPECIFIED,
            program_name: String::new(),
            program_version: [0; 4],
        }
    }
}

impl HostInfo {
    /// Record a receipt from the host at `address`.
    pub fn confirm(&mut self, address: Ipv4Addr) {
        self.found = true;
        self.last_confirmation = Some(SystemTime::now());
        if self.machine_address.is_unspecified() {
            self.machine_address = address;
        }
    }

    /// Merge a discovery reply, keeping liveness fields current.
    pub fn update_identity(&mut self, reply: HostInfo) {
        self.machine_name = reply.machine_name;
        self.machine_address = reply.machine_address;
        self.program_name = reply.program_name;
        self.program_version = reply.program_version;
        self.found = true;
        self.last_confirmation = Some(SystemTime::now());
    }

    /// Version as a dotted string, e.g. `"2.3.1"` (module id omitted).
    pub fn version_string(&self) -> String {
        let [_, major, minor, bugfix] = self.program_version;
        format!("{}.{}.{}", major, minor, bugfix)
    }
}
