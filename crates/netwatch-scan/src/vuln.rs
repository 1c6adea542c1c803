//! Port-exposure vulnerability rules.
//!
//! A rule fires once per matching open port. Rules can be restricted to
//! certain device types and suppressed by a compensating port (plain HTTP
//! is only flagged when HTTPS is absent).

use std::path::Path;

use serde::Deserialize;

use netwatch_core::{DeviceType, VulnSeverity, Vulnerability};

use crate::error::{Result, ScanError};

/// Produces findings for a device from its open ports and type.
pub trait VulnerabilityChecker: Send + Sync {
    fn check_device(&self, open_ports: &[u16], device_type: DeviceType) -> Vec<Vulnerability>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortRule {
    pub id: String,
    pub name: String,
    pub severity: VulnSeverity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub solution: String,
    /// The rule fires for each of these that is open.
    pub ports: Vec<u16>,
    /// Restrict to these device types. Empty means any.
    #[serde(default)]
    pub device_types: Vec<DeviceType>,
    /// Skip the rule when any of these ports is also open.
    #[serde(default)]
    pub unless_open: Vec<u16>,
}

impl PortRule {
    fn applies_to(&self, open_ports: &[u16], device_type: DeviceType) -> bool {
        (self.device_types.is_empty() || self.device_types.contains(&device_type))
            && !self.unless_open.iter().any(|p| open_ports.contains(p))
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<PortRule>,
}

impl RuleSet {
    pub fn builtin() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }

    /// Parse a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<PortRule> =
            serde_json::from_str(json).map_err(|e| ScanError::Rules(e.to_string()))?;
        Ok(Self { rules })
    }

    /// Built-in rules plus those in `path`, if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut set = Self::builtin();
        if let Some(path) = path {
            let json = std::fs::read_to_string(path)?;
            let extra = Self::from_json(&json)?;
            tracing::info!(
                path = %path.display(),
                rules = extra.len(),
                "Loaded vulnerability rules"
            );
            set.extend(extra);
        }
        Ok(set)
    }

    pub fn extend(&mut self, other: RuleSet) {
        self.rules.extend(other.rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VulnerabilityChecker for RuleSet {
    fn check_device(&self, open_ports: &[u16], device_type: DeviceType) -> Vec<Vulnerability> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if !rule.applies_to(open_ports, device_type) {
                continue;
            }
            for &port in rule.ports.iter().filter(|p| open_ports.contains(p)) {
                findings.push(Vulnerability {
                    rule_id: rule.id.clone(),
                    name: rule.name.clone(),
                    severity: rule.severity,
                    description: rule.description.clone(),
                    solution: rule.solution.clone(),
                    port: Some(port),
                });
            }
        }
        findings
    }
}

fn rule(
    id: &str,
    name: &str,
    severity: VulnSeverity,
    ports: &[u16],
    description: &str,
    solution: &str,
) -> PortRule {
    PortRule {
        id: id.to_string(),
        name: name.to_string(),
        severity,
        description: description.to_string(),
        solution: solution.to_string(),
        ports: ports.to_vec(),
        device_types: Vec::new(),
        unless_open: Vec::new(),
    }
}

fn builtin_rules() -> Vec<PortRule> {
    use VulnSeverity::*;

    let mut plain_http = rule(
        "NW-010",
        "Unencrypted HTTP",
        Low,
        &[80],
        "Web interface served without TLS.",
        "Serve the interface over HTTPS and redirect port 80.",
    );
    plain_http.unless_open = vec![443, 8443];

    vec![
        rule(
            "NW-001",
            "Telnet Enabled",
            Critical,
            &[23],
            "Telnet sends credentials in cleartext.",
            "Disable telnet and use SSH.",
        ),
        rule(
            "NW-002",
            "FTP Enabled",
            High,
            &[21],
            "FTP sends credentials in cleartext.",
            "Replace FTP with SFTP or FTPS.",
        ),
        rule(
            "NW-003",
            "SMB Exposed",
            High,
            &[445],
            "SMB file sharing is reachable on the network.",
            "Restrict SMB to trusted hosts and disable SMBv1.",
        ),
        rule(
            "NW-004",
            "RDP Exposed",
            High,
            &[3389],
            "Remote Desktop is reachable on the network.",
            "Require Network Level Authentication or place RDP behind a VPN.",
        ),
        rule(
            "NW-005",
            "VNC Exposed",
            High,
            &[5900],
            "VNC often runs with weak or no authentication.",
            "Tunnel VNC over SSH or disable it.",
        ),
        rule(
            "NW-006",
            "Unencrypted MQTT",
            Medium,
            &[1883],
            "MQTT broker accepts plaintext connections.",
            "Use MQTT over TLS on 8883 and require authentication.",
        ),
        rule(
            "NW-007",
            "Database Port Exposed",
            Medium,
            &[3306, 5432],
            "Database server is reachable from the network.",
            "Bind the database to localhost or firewall the port.",
        ),
        rule(
            "NW-008",
            "Docker API Exposed",
            Critical,
            &[2375],
            "Unauthenticated Docker API grants root on the host.",
            "Disable the TCP socket or enable TLS client auth on 2376.",
        ),
        rule(
            "NW-009",
            "Metrics Exposed",
            Low,
            &[9100],
            "Host metrics are readable without authentication.",
            "Restrict the exporter to the monitoring network.",
        ),
        plain_http,
    ]
}
