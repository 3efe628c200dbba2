use std::net::IpAddr;
use std::process::Command;
use std::sync::Arc;

use crate::config::GateConfig;
use crate::error::GateError;

/// Somewhere an address can be allowed in for a limited time.
pub trait AllowSet: Send + Sync {
    fn add(&self, set: &str, ip: IpAddr, timeout_secs: u64) -> Result<(), GateError>;
}

/// Runs `ipset add <set> <ip> timeout <secs>`.
pub struct IpsetCommand {
    binary: String,
}

impl IpsetCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl AllowSet for IpsetCommand {
    fn add(&self, set: &str, ip: IpAddr, timeout_secs: u64) -> Result<(), GateError> {
        let exec_error = |reason: String| GateError::AdmissionExec {
            set: set.to_string(),
            address: ip.to_string(),
            reason,
        };

        let output = Command::new(&self.binary)
            .arg("add")
            .arg(set)
            .arg(ip.to_string())
            .arg("timeout")
            .arg(timeout_secs.to_string())
            .output()
            .map_err(|e| exec_error(format!("failed to run {}: {}", self.binary, e)))?;

        // killed by a signal has no exit code and is a failure too
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(exec_error(format!("{} ({})", output.status, stderr.trim())));
        }
        Ok(())
    }
}

/// Logs the insertion and pretends it worked.
pub struct DryRun;

impl AllowSet for DryRun {
    fn add(&self, set: &str, ip: IpAddr, timeout_secs: u64) -> Result<(), GateError> {
        tracing::info!("[dry-run] ipset add {} {} timeout {}", set, ip, timeout_secs);
        Ok(())
    }
}

// Address admitter - picks the set for the address family and inserts it
pub struct Admitter {
    config: Arc<GateConfig>,
    backend: Arc<dyn AllowSet>,
}

impl Admitter {
    pub fn new(config: Arc<GateConfig>, backend: Arc<dyn AllowSet>) -> Self {
        Self { config, backend }
    }

    /// Blocks until the backend answers; keep it off the async workers.
    pub fn admit(&self, address: &str) -> Result<(), GateError> {
        let ip: IpAddr = address.trim().parse().map_err(|_| {
            tracing::error!("Invalid IP address {}", address);
            GateError::InvalidAddress(address.to_string())
        })?;

        let ip = ip.to_canonical();
        let set = self.set_for(ip);

        if let Err(e) = self.backend.add(set, ip, self.config.timeout_secs) {
            tracing::error!("{}", e);
            return Err(e);
        }

        tracing::info!("Admitted {} into {} for {}s", ip, set, self.config.timeout_secs);
        Ok(())
    }

    // IPv4-mapped IPv6 has a 4-byte form and goes with plain IPv4
    pub fn set_for(&self, ip: IpAddr) -> &str {
        match ip.to_canonical() {
            IpAddr::V4(_) => &self.config.set_v4,
            IpAddr::V6(_) => &self.config.set_v6,
        }
    }
}
