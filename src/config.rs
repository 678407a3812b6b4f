use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND: &str = "0.0.0.0:3000";
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Daemon settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub db_path: PathBuf,

    /// Address the HTTP server listens on
    pub bind: SocketAddr,

    /// Buffered events per relay topic before slow subscribers start lagging
    pub channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // We use ~/.agora/agora.db unless told otherwise
        let db_path = match lookup("AGORA_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".agora").join("agora.db")
            }
        };

        let bind = lookup("AGORA_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .context("AGORA_BIND must be a socket address, e.g. 0.0.0.0:3000")?;

        let channel_capacity = match lookup("AGORA_CHANNEL_CAPACITY") {
            Some(raw) => raw
                .parse::<usize>()
                .context("AGORA_CHANNEL_CAPACITY must be a positive integer")?,
            None => DEFAULT_CHANNEL_CAPACITY,
        };
        if channel_capacity == 0 {
            anyhow::bail!("AGORA_CHANNEL_CAPACITY must be a positive integer");
        }

        Ok(Self {
            db_path,
            bind,
            channel_capacity,
        })
    }
}
