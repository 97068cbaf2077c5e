//! Database handle descriptors.
//!
//! The runtime does not open database connections itself. It registers one
//! handle per configured database so persistence collaborators and jobs can
//! look up their connection settings by name.

use crate::config::{AppConfig, DatabaseConfig};
use crate::runtime::PRIMARY_DB;

/// Connection settings for one named database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHandle {
    pub name: String,
    pub driver: String,
    pub source: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
}

impl DatabaseHandle {
    pub fn from_config(name: &str, config: &DatabaseConfig) -> Self {
        Self {
            name: name.to_string(),
            driver: config.driver.clone(),
            source: config.source.clone(),
            max_open_conns: config.max_open_conns,
            max_idle_conns: config.max_idle_conns,
        }
    }

    /// Connection string with any password replaced, for logs.
    pub fn redacted_source(&self) -> String {
        match (self.source.find("://"), self.source.rfind('@')) {
            (Some(scheme), Some(at)) if at > scheme => {
                let creds = &self.source[scheme + 3..at];
                match creds.split_once(':') {
                    Some((user, _)) => format!("{}{}:***{}", &self.source[..scheme + 3], user, &self.source[at..]),
                    None => self.source.clone(),
                }
            }
            _ => self.source.clone(),
        }
    }
}

/// Handles for every database block; the primary block is named `*`.
pub fn database_handles(config: &AppConfig) -> Vec<DatabaseHandle> {
    config
        .database
        .iter()
        .map(|db| DatabaseHandle::from_config(PRIMARY_DB, db))
        .chain(
            config
                .databases
                .iter()
                .map(|(name, db)| DatabaseHandle::from_config(name, db)),
        )
        .collect()
}
