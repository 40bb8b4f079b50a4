use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const DEFAULT_PORT: u16 = 3000;
const IN_MEMORY_DB: &str = ":memory:";
const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1";
const DEFAULT_COMPLETION_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub completion_url: String,
    pub completion_model: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PINEAI_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("PINEAI_PORT is not a valid port: {}", raw))?,
            None => DEFAULT_PORT,
        };

        // We use ~/.pineai/pineai.db unless told otherwise
        let db_path = get("PINEAI_DB_PATH").map(PathBuf::from).unwrap_or_else(|| {
            let home = get("HOME").unwrap_or_else(|| ".".into());
            PathBuf::from(home).join(".pineai").join("pineai.db")
        });

        Ok(Self {
            port,
            db_path,
            completion_url: get("PINEAI_COMPLETION_URL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string()),
            completion_model: get("PINEAI_COMPLETION_MODEL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
            api_key: get("PINEAI_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            system_prompt: get("PINEAI_SYSTEM_PROMPT"),
        })
    }

    /// True when history should live only in process memory.
    pub fn in_memory(&self) -> bool {
        self.db_path == Path::new(IN_MEMORY_DB)
    }
}
