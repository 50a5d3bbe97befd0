//! Docker CLI backend
//!
//! Shells out to the `docker` binary. Argument building and output parsing are
//! plain functions so they can be checked without a daemon.

use crate::error::{EngineError, EngineResult};
use crate::types::*;
use crate::ContainerEngine;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// [`ContainerEngine`] backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn output(&self, op: &'static str, args: &[String]) -> EngineResult<std::process::Output> {
        debug!(op, args = ?args, "Running {}", self.binary);
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| EngineError::Spawn { op, source })
    }

    /// Run a command that must succeed; returns trimmed stdout
    async fn run(&self, op: &'static str, target: &str, args: &[String]) -> EngineResult<String> {
        let output = self.output(op, args).await?;
        if !output.status.success() {
            return Err(EngineError::failed(
                op,
                target,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create_network(
        &self,
        name: &str,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
        labels: &Labels,
    ) -> EngineResult<String> {
        let mut args = strings(&["network", "create", "--driver", "bridge"]);
        args.push("--subnet".into());
        args.push(subnet.to_string());
        args.push("--gateway".into());
        args.push(gateway.to_string());
        push_labels(&mut args, labels);
        args.push(name.into());

        self.run("create network", name, &args).await
    }

    async fn network_ids_by_name(&self, name: &str) -> EngineResult<Vec<String>> {
        let args = strings(&["network", "ls", "--no-trunc", "--format", "{{.ID}}\t{{.Name}}"]);
        let stdout = self.run("list networks", name, &args).await?;
        Ok(stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter(|(_, n)| *n == name)
            .map(|(id, _)| id.to_string())
            .collect())
    }

    async fn list_network_subnets(&self) -> EngineResult<Vec<Ipv4Network>> {
        let ids = self.run("list networks", "all", &strings(&["network", "ls", "-q"])).await?;
        let ids: Vec<String> = ids.lines().map(str::to_string).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = strings(&[
            "network",
            "inspect",
            "--format",
            "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
        ]);
        args.extend(ids);
        let stdout = self.run("inspect networks", "all", &args).await?;
        Ok(parse_subnets(&stdout))
    }

    async fn remove_network(&self, network_id: &str) -> EngineResult<()> {
        self.run("remove network", network_id, &strings(&["network", "rm", network_id]))
            .await
            .map(|_| ())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> EngineResult<()> {
        let mut args = strings(&["volume", "create"]);
        push_labels(&mut args, labels);
        args.push(name.into());
        self.run("create volume", name, &args).await.map(|_| ())
    }

    async fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
    ) -> EngineResult<(String, HashMap<PortSpec, PortBinding>)> {
        let container_id = self.run("start container", &spec.name, &run_args(spec)).await?;
        if container_id.is_empty() {
            return Err(EngineError::Unexpected {
                op: "start container",
                message: format!("no container ID printed for '{}'", spec.name),
            });
        }

        if !spec.publish_ports || spec.ports.is_empty() {
            return Ok((container_id, HashMap::new()));
        }

        let stdout = self
            .run("inspect ports", &container_id, &strings(&["port", &container_id]))
            .await?;
        let bindings = parse_port_bindings(&stdout);
        for port in &spec.ports {
            if !bindings.contains_key(port) {
                warn!(container = %container_id, port = %port, "Port was not published");
            }
        }
        Ok((container_id, bindings))
    }

    async fn stop_container(&self, container_id: &str, timeout: Duration) -> EngineResult<()> {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        let args = strings(&["stop", "--time", &secs.to_string(), container_id]);
        self.run("stop container", container_id, &args).await.map(|_| ())
    }

    async fn kill_container(&self, container_id: &str) -> EngineResult<()> {
        self.run("kill container", container_id, &strings(&["kill", container_id]))
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, container_id: &str) -> EngineResult<()> {
        self.run("remove container", container_id, &strings(&["rm", "-f", container_id]))
            .await
            .map(|_| ())
    }

    async fn run_exec_command(&self, container_id: &str, argv: &[String]) -> EngineResult<ExecOutput> {
        let mut args = strings(&["exec", container_id]);
        args.extend(argv.iter().cloned());
        let output = self.output("exec", &args).await?;

        let exit_code = output.status.code().ok_or_else(|| {
            EngineError::failed("exec", container_id, "exec terminated by signal")
        })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput { exit_code, output: combined })
    }

    async fn copy_from_container(&self, container_id: &str, src_path: &str) -> EngineResult<Vec<u8>> {
        let source = format!("{}:{}", container_id, src_path);
        let output = self.output("copy from container", &strings(&["cp", &source, "-"])).await?;
        if !output.status.success() {
            return Err(EngineError::failed(
                "copy from container",
                source,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(output.stdout)
    }

    async fn containers_by_labels(
        &self,
        labels: &Labels,
        include_stopped: bool,
    ) -> EngineResult<Vec<ContainerInfo>> {
        let mut args = strings(&["ps", "--no-trunc"]);
        if include_stopped {
            args.push("-a".into());
        }
        for (key, value) in labels {
            args.push("--filter".into());
            args.push(format!("label={}={}", key, value));
        }
        args.push("--format".into());
        args.push("{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Labels}}".into());

        let stdout = self.run("list containers", "labels", &args).await?;
        Ok(stdout.lines().filter_map(parse_container_line).collect())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn push_labels(args: &mut Vec<String>, labels: &Labels) {
    for (key, value) in labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
}

/// `docker run` arguments for a spec
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(&["run", "-d", "--name", &spec.name]);

    match &spec.network {
        NetworkAttachment::Network { network_id, ip_addr } => {
            args.push("--network".into());
            args.push(network_id.clone());
            if let Some(ip) = ip_addr {
                args.push("--ip".into());
                args.push(ip.to_string());
            }
        }
        NetworkAttachment::Container(id) => {
            args.push("--network".into());
            args.push(format!("container:{}", id));
        }
    }

    for cap in &spec.cap_add {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }
    push_labels(&mut args, &spec.labels);
    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{}={}", key, value));
    }
    for (volume, mount) in &spec.volume_mounts {
        args.push("--volume".into());
        args.push(format!("{}:{}", volume, mount));
    }
    for port in &spec.ports {
        if spec.publish_ports {
            args.push("--publish".into());
        } else {
            args.push("--expose".into());
        }
        args.push(port.to_string());
    }

    // --entrypoint takes one executable; its remaining words lead the command
    let mut trailing = Vec::new();
    if let Some((program, rest)) = spec.entrypoint.as_deref().and_then(<[String]>::split_first) {
        args.push("--entrypoint".into());
        args.push(program.clone());
        trailing.extend(rest.iter().cloned());
    }
    if let Some(cmd) = &spec.cmd {
        trailing.extend(cmd.iter().cloned());
    }

    args.push(spec.image.clone());
    args.extend(trailing);
    args
}

/// Parse `docker port` output (`80/tcp -> 0.0.0.0:32768`), keeping IPv4 bindings
pub fn parse_port_bindings(stdout: &str) -> HashMap<PortSpec, PortBinding> {
    let mut bindings = HashMap::new();
    for line in stdout.lines() {
        let Some((port, host)) = line.split_once(" -> ") else {
            continue;
        };
        let Some((number, protocol)) = port.trim().split_once('/') else {
            continue;
        };
        let (Ok(number), Some(protocol)) = (number.parse::<u16>(), Protocol::parse(protocol)) else {
            continue;
        };
        let host = host.trim();
        if host.starts_with('[') {
            continue;
        }
        let Some((host_ip, host_port)) = host.rsplit_once(':') else {
            continue;
        };
        let Ok(host_port) = host_port.parse::<u16>() else {
            continue;
        };
        bindings
            .entry(PortSpec { number, protocol })
            .or_insert(PortBinding { host_ip: host_ip.to_string(), host_port });
    }
    bindings
}

fn parse_subnets(stdout: &str) -> Vec<Ipv4Network> {
    stdout
        .split_whitespace()
        .filter_map(|cidr| cidr.parse::<Ipv4Network>().ok())
        .collect()
}

fn parse_container_line(line: &str) -> Option<ContainerInfo> {
    let mut fields = line.splitn(4, '\t');
    let id = fields.next()?.to_string();
    let name = fields.next()?.to_string();
    let state = fields.next()?;
    let labels = fields
        .next()
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Some(ContainerInfo {
        id,
        name,
        labels,
        running: state == "running",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_for_service() {
        let mut spec = ContainerSpec::new(
            "enclave-1--api",
            "nginx:1.25",
            NetworkAttachment::Network {
                network_id: "net123".into(),
                ip_addr: Some(Ipv4Addr::new(10, 4, 0, 3)),
            },
        );
        spec.env.insert("MODE".into(), "test".into());
        spec.ports.push(PortSpec::tcp(80));
        spec.publish_ports = true;
        spec.entrypoint = Some(vec!["/bin/sh".into(), "-c".into()]);
        spec.cmd = Some(vec!["nginx -g 'daemon off;'".into()]);

        let args = run_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name enclave-1--api --network net123 --ip 10.4.0.3"));
        assert!(joined.contains("--env MODE=test"));
        assert!(joined.contains("--publish 80/tcp"));
        assert!(joined.contains("--entrypoint /bin/sh"));

        let image_pos = args.iter().position(|a| a == "nginx:1.25").unwrap();
        assert_eq!(&args[image_pos + 1..], &["-c".to_string(), "nginx -g 'daemon off;'".to_string()]);
    }

    #[test]
    fn test_run_args_for_sidecar() {
        let mut spec = ContainerSpec::new("sc", "alpine", NetworkAttachment::Container("abc".into()));
        spec.cap_add.push("NET_ADMIN".into());
        spec.ports.push(PortSpec::tcp(22));

        let joined = run_args(&spec).join(" ");
        assert!(joined.contains("--network container:abc"));
        assert!(joined.contains("--cap-add NET_ADMIN"));
        assert!(joined.contains("--expose 22/tcp"));
        assert!(!joined.contains("--ip"));
    }

    #[test]
    fn test_parse_port_bindings() {
        let out = "7443/tcp -> 0.0.0.0:49153\n7443/tcp -> [::]:49153\n53/udp -> 0.0.0.0:49154\n";
        let bindings = parse_port_bindings(out);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[&PortSpec::tcp(7443)].host_port, 49153);
        assert_eq!(bindings[&PortSpec::udp(53)].host_ip, "0.0.0.0");
    }

    #[test]
    fn test_parse_container_line() {
        let info = parse_container_line("abc\tenclave-1--cp\trunning\tapp=enclave,enclave-id=1").unwrap();
        assert!(info.running);
        assert_eq!(info.labels.get("enclave-id").map(String::as_str), Some("1"));
        assert!(parse_container_line("garbage").is_none());
    }

    #[test]
    fn test_parse_subnets_skips_ipv6() {
        let subnets = parse_subnets("172.17.0.0/16 \nfd00::/64 10.4.0.0/20 \n\n");
        assert_eq!(subnets.len(), 2);
    }
}
