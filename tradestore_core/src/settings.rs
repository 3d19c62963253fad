// tradestore_core/src/settings.rs

//! Configuration structures for ingestion and serving.
//! Loads settings from an optional JSON file and validates them.

use anyhow::Context;

use crate::layout;
use crate::storage;

/// Locations of the four persisted artifacts.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSettings {
    pub data_dir: String,
    pub record_file: String,
    pub key_index_file: String,
    pub block_index_file: String,
    pub metadata_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            data_dir: ".".to_string(),
            record_file: "data.bin".to_string(),
            key_index_file: "hashtable.bin".to_string(),
            block_index_file: "slot_index.bin".to_string(),
            metadata_file: "metadata.bin".to_string(),
        }
    }
}

/// Index build parameters.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct IngestSettings {
    pub block_size: usize,
    pub has_headers: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            block_size: layout::BLOCK_SIZE,
            has_headers: true,
        }
    }
}

/// Request channel naming and storage access for the server.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ServerSettings {
    pub request_pipe: String,
    pub response_pipe_template: String,
    pub access: storage::AccessMode,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            request_pipe: "/tmp/trade_search_request".to_string(),
            response_pipe_template: "/tmp/trade_search_response_{pid}".to_string(),
            access: storage::AccessMode::Mapped,
        }
    }
}

impl ServerSettings {
    /// Reply channel path for a client process.
    pub fn response_pipe(&self, client_pid: i32) -> std::path::PathBuf {
        self.response_pipe_template
            .replace("{pid}", &client_pid.to_string())
            .into()
    }
}

/// Top-level settings structure.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub ingest: IngestSettings,
    pub server: ServerSettings,
}

impl Settings {
    /// Loads settings from a JSON file, or defaults when no path is given.
    /// # Arguments
    /// * `settings_file_path` - Optional path to the JSON configuration file.
    /// # Returns
    /// * `anyhow::Result<Settings>` containing validated settings.
    pub fn load(settings_file_path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let settings = match settings_file_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file {}", path.display()))?;
                Self::from_json(&contents)?
            }
            None => Settings::default(),
        };

        check_args(&settings)
            .map_err(|e| anyhow::anyhow!("Settings validation failed:\n{}", e))?;

        anyhow::Ok(settings)
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse settings JSON: {}", e))
    }
}

fn check_args(settings: &Settings) -> anyhow::Result<()> {
    // check block size
    {
        if settings.ingest.block_size == 0 {
            anyhow::bail!("'ingest.block_size' must be positive, got 0");
        }
    }

    // check artifact names
    {
        let storage = &settings.storage;
        let names = [
            ("record_file", &storage.record_file),
            ("key_index_file", &storage.key_index_file),
            ("block_index_file", &storage.block_index_file),
            ("metadata_file", &storage.metadata_file),
        ];
        for (field, name) in &names {
            if name.trim().is_empty() {
                anyhow::bail!("'storage.{}' must not be empty", field);
            }
        }
        for (i, (field, name)) in names.iter().enumerate() {
            if let Some((other, _)) = names[i + 1..].iter().find(|(_, n)| n == name) {
                anyhow::bail!(
                    "'storage.{}' and 'storage.{}' both point to '{}'",
                    field,
                    other,
                    name,
                );
            }
        }
    }

    // check pipes
    {
        let server = &settings.server;
        if server.request_pipe.trim().is_empty() {
            anyhow::bail!("'server.request_pipe' must not be empty");
        }
        if !server.response_pipe_template.contains("{pid}") {
            anyhow::bail!(
                "'server.response_pipe_template' must contain '{{pid}}', got '{}'",
                server.response_pipe_template,
            );
        }
    }

    anyhow::Ok(())
}
