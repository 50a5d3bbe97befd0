//! Container, port and mount descriptions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Label set; ordered so generated engine arguments are deterministic
pub type Labels = BTreeMap<String, String>;

/// Transport protocol of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "sctp" => Some(Self::Sctp),
            _ => None,
        }
    }
}

/// A port inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortSpec {
    pub number: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(number: u16) -> Self {
        Self { number, protocol: Protocol::Tcp }
    }

    pub fn udp(number: u16) -> Self {
        Self { number, protocol: Protocol::Udp }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol.as_str())
    }
}

/// Where a container port is published on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
}

/// Network a container joins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Join a network, optionally with a fixed address
    Network {
        network_id: String,
        ip_addr: Option<Ipv4Addr>,
    },
    /// Share another container's network namespace
    Container(String),
}

/// Everything needed to create and start one container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: NetworkAttachment,
    pub labels: Labels,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub ports: Vec<PortSpec>,
    /// Publish `ports` on random host ports
    pub publish_ports: bool,
    /// Volume name -> mount path inside the container
    pub volume_mounts: BTreeMap<String, String>,
    pub cap_add: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, network: NetworkAttachment) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network,
            labels: Labels::new(),
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            ports: Vec::new(),
            publish_ports: false,
            volume_mounts: BTreeMap::new(),
            cap_add: Vec::new(),
        }
    }

    /// Address requested on the attached network, if any
    pub fn static_ip(&self) -> Option<Ipv4Addr> {
        match &self.network {
            NetworkAttachment::Network { ip_addr, .. } => *ip_addr,
            NetworkAttachment::Container(_) => None,
        }
    }
}

/// Summary of a container found by label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: Labels,
    pub running: bool,
}

/// Result of an exec inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr
    pub output: String,
}

impl ExecOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self { exit_code: 0, output: output.into() }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
