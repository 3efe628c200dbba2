use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::GateError;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "knock-gate")]
#[command(about = "Port-knock gate: admits the caller's address into an ipset allow-set")]
pub struct Args {
    // Base name of the IPSet, "v4"/"v6" gets appended
    #[arg(long, default_value = "knock")]
    pub knock: String,

    // Name of the API request (served on /<request>)
    #[arg(long, default_value = "ipset")]
    pub request: String,

    // Timeout for IP addresses in the set, in seconds
    #[arg(long, default_value_t = 7200)]
    pub timeout: u64,

    // Listen address for the HTTP server, ":8080" means every interface
    #[arg(long, default_value = ":8080")]
    pub address: String,

    // Knocks allowed inside one window before an address is blacklisted
    #[arg(long, default_value_t = 5)]
    pub max_accesses: u32,

    // Rate limit window in seconds
    #[arg(long, default_value_t = 60)]
    pub access_timeout: u64,

    // Blacklist file, empty keeps the blacklist in memory only
    #[arg(long, default_value = "blacklist.json")]
    pub blacklist: String,

    // Command used to talk to the kernel sets
    #[arg(long, default_value = "ipset")]
    pub ipset_binary: String,

    // Log admissions instead of running ipset
    #[arg(long)]
    pub dry_run: bool,

    // Expose /metrics
    #[arg(long)]
    pub metrics: bool,
}

// Paths the router serves on its own
const RESERVED_ROUTES: [&str; 3] = ["404", "favicon.ico", "metrics"];

/// Limiter settings, fixed once the limiter is built.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub max_accesses: u32,
    pub access_timeout: Duration,
    pub blacklist_path: Option<PathBuf>,
}

/// Everything the admitter and the router read at startup.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub set_v4: String,
    pub set_v6: String,
    pub timeout_secs: u64,
    pub request_name: String,
    pub listen_address: SocketAddr,
    pub ipset_binary: String,
}

impl GateConfig {
    pub fn new(base_name: &str, timeout_secs: u64) -> Self {
        Self {
            set_v4: format!("{}v4", base_name),
            set_v6: format!("{}v6", base_name),
            timeout_secs,
            request_name: "ipset".to_string(),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ipset_binary: "ipset".to_string(),
        }
    }
}

impl Args {
    pub fn gate_config(&self) -> Result<GateConfig, GateError> {
        if self.knock.trim().is_empty() {
            return Err(GateError::Config("set base name must not be empty".into()));
        }
        let request_name = self.request.trim_matches('/');
        if request_name.is_empty() {
            return Err(GateError::Config("request name must not be empty".into()));
        }
        if !is_plain_segment(request_name) {
            return Err(GateError::Config(format!(
                "request name {} must be a single literal path segment",
                request_name
            )));
        }
        if RESERVED_ROUTES.contains(&request_name) {
            return Err(GateError::Config(format!("request name {} is reserved", request_name)));
        }

        Ok(GateConfig {
            request_name: request_name.to_string(),
            listen_address: parse_listen_address(&self.address)?,
            ipset_binary: self.ipset_binary.clone(),
            ..GateConfig::new(&self.knock, self.timeout)
        })
    }

    pub fn limiter_config(&self) -> Result<LimiterConfig, GateError> {
        if self.max_accesses == 0 {
            return Err(GateError::Config("max-accesses must be greater than 0".into()));
        }
        if self.access_timeout == 0 {
            return Err(GateError::Config("access-timeout must be greater than 0".into()));
        }

        Ok(LimiterConfig {
            max_accesses: self.max_accesses,
            access_timeout: Duration::from_secs(self.access_timeout),
            blacklist_path: (!self.blacklist.is_empty()).then(|| PathBuf::from(&self.blacklist)),
        })
    }
}

// The router treats ':', '*' and braces as captures and '/' as a separator
fn is_plain_segment(name: &str) -> bool {
    !name.starts_with([':', '*']) && !name.contains(['{', '}', '/'])
}

// ":8080" binds the IPv6 wildcard, which also takes IPv4 on dual-stack hosts
fn parse_listen_address(address: &str) -> Result<SocketAddr, GateError> {
    let full = if address.starts_with(':') {
        format!("[::]{}", address)
    } else {
        address.to_string()
    };
    full.parse()
        .map_err(|_| GateError::Config(format!("invalid listen address {}", address)))
}
