//! Host identity probe used by every node's online announcement.

use crate::types::HostIdentity;
use sysinfo::System;

/// Builds the identity block for this host. `agent_name` names the
/// component ("authority", "instrumenter", "aggregator");
/// `hostname_override` lets configs pin the identity when the OS
/// hostname is unusable (containers, test rigs).
pub fn host_identity(agent_name: &str, hostname_override: Option<&str>) -> HostIdentity {
    let hostname = hostname_override
        .map(|h| h.to_string())
        .or_else(System::host_name)
        .unwrap_or_else(|| "localhost".to_string());

    HostIdentity {
        hostname,
        agent_name: agent_name.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
        os_release: System::os_version().unwrap_or_else(|| "unknown".to_string()),
        os_revision: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_probed_hostname() {
        let identity = host_identity("instrumenter", Some("rig01"));
        assert_eq!(identity.hostname, "rig01");
        assert_eq!(identity.agent_name, "instrumenter");
        assert!(!identity.agent_version.is_empty());
    }
}
