//! [`ContainerRuntime`] backed by the `docker` CLI.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ContainerInfo, ContainerRuntime, Mount, ProcessInfo, ResourceStats, RuntimeError};

/// Shells out to the docker CLI for every runtime read.
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, RuntimeError> {
        let command = format!("{} {}", self.bin, args.join(" "));
        debug!(%command, "running container runtime command");

        tokio::process::Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Command {
                command,
                message: e.to_string(),
            })
    }

    async fn run_ok(&self, id: &str, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_missing_container(&stderr) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            return Err(RuntimeError::Command {
                command: format!("{} {}", self.bin, args.join(" ")),
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        let stdout = self.run_ok("", &["ps", "-q", "--no-trunc"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let stdout = self.run_ok(id, &["inspect", "--type", "container", id]).await?;
        parse_inspect(&stdout)
    }

    async fn stats(&self, id: &str) -> Result<ResourceStats, RuntimeError> {
        let stdout = self
            .run_ok(id, &["stats", "--no-stream", "--format", "{{json .}}", id])
            .await?;
        parse_stats(&stdout)
    }

    async fn processes(&self, id: &str) -> Result<Vec<ProcessInfo>, RuntimeError> {
        let stdout = self.run_ok(id, &["top", id, "-eo", "pid,args"]).await?;
        Ok(parse_top(&stdout))
    }

    async fn logs(&self, id: &str, tail: u32) -> Result<String, RuntimeError> {
        let tail = tail.to_string();
        let output = self.run(&["logs", "--tail", &tail, id]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_missing_container(&stderr) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            return Err(RuntimeError::Command {
                command: format!("{} logs --tail {} {}", self.bin, tail, id),
                message: stderr,
            });
        }
        // The runtime replays the container's stderr on ours.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mounts: Vec<InspectMount>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
}

pub(crate) fn parse_inspect(stdout: &str) -> Result<ContainerInfo, RuntimeError> {
    let entries: Vec<InspectEntry> = serde_json::from_str(stdout).map_err(|e| RuntimeError::Parse {
        what: "inspect".to_string(),
        message: e.to_string(),
    })?;
    let entry = entries.into_iter().next().ok_or_else(|| RuntimeError::Parse {
        what: "inspect".to_string(),
        message: "empty inspect result".to_string(),
    })?;

    Ok(ContainerInfo {
        id: entry.id,
        name: entry.name.trim_start_matches('/').to_string(),
        mounts: entry
            .mounts
            .into_iter()
            .map(|m| Mount {
                kind: m.kind,
                source: m.source,
                destination: m.destination,
            })
            .collect(),
    })
}

#[derive(Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
}

pub(crate) fn parse_stats(stdout: &str) -> Result<ResourceStats, RuntimeError> {
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| RuntimeError::Parse {
            what: "stats".to_string(),
            message: "no stats line".to_string(),
        })?;
    let raw: StatsLine = serde_json::from_str(line).map_err(|e| RuntimeError::Parse {
        what: "stats".to_string(),
        message: e.to_string(),
    })?;

    let cpu_percent = raw.cpu_perc.trim().trim_end_matches('%').parse::<f64>().unwrap_or(0.0);
    let memory_bytes = raw
        .mem_usage
        .split('/')
        .next()
        .and_then(parse_size)
        .unwrap_or(0);
    let mut net = raw.net_io.split('/');
    let network_rx_bytes = net.next().and_then(parse_size).unwrap_or(0);
    let network_tx_bytes = net.next().and_then(parse_size).unwrap_or(0);

    Ok(ResourceStats {
        cpu_percent,
        memory_bytes,
        network_rx_bytes,
        network_tx_bytes,
    })
}

/// Parse a runtime size string such as `1.5GiB`, `12.3MB`, or `0B`.
pub(crate) fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

pub(crate) fn parse_top(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessInfo {
                pid: pid.to_string(),
                command: command.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_mounts() {
        let json = r#"[{
            "Id": "4f1c2d3e4f5a6b7c8d9e",
            "Name": "/4f1c2d3e-aaaa-bbbb-cccc-123456789abc",
            "Mounts": [
                {"Type": "bind", "Source": "/var/lib/pterodactyl/volumes/4f1c2d3e-aaaa-bbbb-cccc-123456789abc", "Destination": "/home/container", "RW": true},
                {"Type": "bind", "Source": "/etc/timezone", "Destination": "/etc/timezone"}
            ]
        }]"#;
        let info = parse_inspect(json).unwrap();
        assert_eq!(info.id, "4f1c2d3e4f5a6b7c8d9e");
        assert_eq!(info.name, "4f1c2d3e-aaaa-bbbb-cccc-123456789abc");
        assert_eq!(info.mounts.len(), 2);
        assert_eq!(info.mounts[0].destination, "/home/container");
    }

    #[test]
    fn test_parse_inspect_empty_array() {
        assert!(matches!(parse_inspect("[]"), Err(RuntimeError::Parse { .. })));
    }

    #[test]
    fn test_parse_stats_line() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"97.52%","Container":"abc","ID":"abc","MemPerc":"9.77%","MemUsage":"100MiB / 1GiB","Name":"x","NetIO":"1.5GB / 500MB","PIDs":"12"}"#;
        let stats = parse_stats(line).unwrap();
        assert!((stats.cpu_percent - 97.52).abs() < f64::EPSILON);
        assert_eq!(stats.memory_bytes, 100 * 1024 * 1024);
        assert_eq!(stats.network_rx_bytes, 1_500_000_000);
        assert_eq!(stats.network_tx_bytes, 500_000_000);
        assert_eq!(stats.network_bytes(), 2_000_000_000);
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("3.4kB"), Some(3400));
        assert_eq!(parse_size(" 2GiB "), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("12parsecs"), None);
    }

    #[test]
    fn test_parse_top() {
        let out = "PID                 COMMAND\n1234                java -Xms128M -jar server.jar\n1250                /tmp/xmrig -o pool:3333\n";
        let procs = parse_top(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, "1234");
        assert_eq!(procs[1].command, "/tmp/xmrig -o pool:3333");
    }
}
