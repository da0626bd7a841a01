use crate::domain::model::{Guest, GuestState};
use crate::domain::ports::GuestSource;
use crate::utils::error::{AgentError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// Collects guest inventory by running `virsh` against a hypervisor URI.
#[derive(Debug, Clone)]
pub struct VirshSource {
    binary: String,
    uri: String,
    timeout: Duration,
}

impl VirshSource {
    pub fn new(binary: impl Into<String>, uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            uri: uri.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(target: "virsh", "{} -c {} {}", self.binary, self.uri, args.join(" "));

        let mut command = Command::new(&self.binary);
        // dominfo labels and state names are translated otherwise.
        command
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .env("LC_ALL", "C")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                AgentError::data_source(format!(
                    "virsh {} timed out after {:?}",
                    args.join(" "),
                    self.timeout
                ))
            })?
            .map_err(|e| AgentError::data_source(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(AgentError::data_source(format!(
                "virsh {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses the output of `virsh list --all --uuid`.
pub fn parse_uuid_list(output: &str) -> Result<Vec<Uuid>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<Uuid>()
                .map_err(|e| AgentError::data_source(format!("bad UUID '{}' from virsh: {}", line, e)))
        })
        .collect()
}

fn field_regex() -> &'static Regex {
    static FIELD: OnceLock<Regex> = OnceLock::new();
    FIELD.get_or_init(|| Regex::new(r"^\s*([^:]+?)\s*:\s*(.*?)\s*$").expect("static regex"))
}

fn parse_kib(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn parse_cpu_time_ns(value: &str) -> u64 {
    value
        .trim_end_matches('s')
        .trim()
        .parse::<f64>()
        .map(|secs| (secs * 1e9).round() as u64)
        .unwrap_or(0)
}

/// Parses the output of `virsh dominfo <uuid>`.
pub fn parse_dominfo(output: &str) -> Result<Guest> {
    let fields: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| field_regex().captures(line))
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str();
            let value = caps.get(2)?.as_str();
            Some((key, value))
        })
        .collect();

    let uuid = fields
        .get("UUID")
        .ok_or_else(|| AgentError::data_source("dominfo output has no UUID"))?
        .parse::<Uuid>()
        .map_err(|e| AgentError::data_source(format!("bad UUID in dominfo: {}", e)))?;

    Ok(Guest {
        uuid,
        name: fields.get("Name").map(|s| s.to_string()).unwrap_or_default(),
        state: fields
            .get("State")
            .map(|s| GuestState::from_virsh(s))
            .unwrap_or_default(),
        cpu_count: fields
            .get("CPU(s)")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        memory_current_kib: fields.get("Used memory").map(|s| parse_kib(s)).unwrap_or(0),
        memory_limit_kib: fields.get("Max memory").map(|s| parse_kib(s)).unwrap_or(0),
        cpu_time_ns: fields.get("CPU time").map(|s| parse_cpu_time_ns(s)).unwrap_or(0),
    })
}

#[async_trait]
impl GuestSource for VirshSource {
    fn describe(&self) -> String {
        format!("virsh {}", self.uri)
    }

    async fn probe(&self) -> Result<()> {
        self.run(&["uri"]).await.map(|_| ())
    }

    async fn list_guests(&self) -> Result<Vec<Guest>> {
        let uuids = parse_uuid_list(&self.run(&["list", "--all", "--uuid"]).await?)?;

        let mut guests = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let id = uuid.to_string();
            match self.run(&["dominfo", &id]).await {
                Ok(output) => match parse_dominfo(&output) {
                    Ok(guest) => guests.push(guest),
                    Err(e) => tracing::warn!("skipping guest {}: {}", id, e),
                },
                // Guests can vanish between list and dominfo.
                Err(e) => tracing::debug!(target: "virsh", "skipping guest {}: {}", id, e),
            }
        }
        Ok(guests)
    }
}
