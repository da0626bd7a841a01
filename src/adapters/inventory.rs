use crate::domain::model::Guest;
use crate::domain::ports::GuestSource;
use crate::utils::error::{AgentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default, rename = "guest")]
    guests: Vec<Guest>,
}

#[derive(Debug, Clone)]
enum Backing {
    File(PathBuf),
    Memory(Vec<Guest>),
}

/// Guest list read from a TOML/JSON file (re-read on every refresh) or held in memory.
#[derive(Debug, Clone)]
pub struct InventorySource {
    backing: Backing,
}

impl InventorySource {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::File(path.into()),
        }
    }

    pub fn from_guests(guests: Vec<Guest>) -> Self {
        Self {
            backing: Backing::Memory(guests),
        }
    }

    fn parse(path: &Path, content: &str) -> Result<Vec<Guest>> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let file: InventoryFile = if is_json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };
        Ok(file.guests)
    }
}

#[async_trait]
impl GuestSource for InventorySource {
    fn describe(&self) -> String {
        match &self.backing {
            Backing::File(path) => format!("inventory {}", path.display()),
            Backing::Memory(_) => "in-memory inventory".to_string(),
        }
    }

    async fn probe(&self) -> Result<()> {
        match &self.backing {
            Backing::File(path) if !path.exists() => Err(AgentError::data_source(format!(
                "inventory file {} does not exist",
                path.display()
            ))),
            _ => Ok(()),
        }
    }

    async fn list_guests(&self) -> Result<Vec<Guest>> {
        match &self.backing {
            Backing::File(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                Self::parse(path, &content)
            }
            Backing::Memory(guests) => Ok(guests.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::GuestState;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_reads_toml_inventory() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(
            br#"
[[guest]]
uuid = "4f2c1c2e-9d53-4a8e-8d1e-1b0c8e5a7f10"
name = "web01"
state = "running"
cpu_count = 4
memory_current_kib = 4194304
memory_limit_kib = 8388608
cpu_time_ns = 123456789

[[guest]]
uuid = "0a9d5a64-2f0b-4c37-9a3e-6a1f3c2b4d5e"
name = "db01"
"#,
        )
        .unwrap();

        let source = InventorySource::from_file(file.path());
        source.probe().await.unwrap();
        let guests = source.list_guests().await.unwrap();

        assert_eq!(guests.len(), 2);
        assert_eq!(guests[0].name, "web01");
        assert_eq!(guests[0].state, GuestState::Running);
        assert_eq!(guests[0].cpu_count, 4);
        assert_eq!(guests[1].state, GuestState::NoState);
    }

    #[tokio::test]
    async fn test_reads_json_inventory() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(
            br#"{"guest": [{"uuid": "4f2c1c2e-9d53-4a8e-8d1e-1b0c8e5a7f10", "name": "web01", "state": "paused"}]}"#,
        )
        .unwrap();

        let guests = InventorySource::from_file(file.path())
            .list_guests()
            .await
            .unwrap();
        assert_eq!(guests[0].state, GuestState::Paused);
    }

    #[tokio::test]
    async fn test_missing_file_fails_probe() {
        let source = InventorySource::from_file("/nonexistent/guests.toml");
        assert!(source.probe().await.is_err());
        assert!(source.list_guests().await.is_err());
    }
}
