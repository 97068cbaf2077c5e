//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Check that enabled features carry the settings they need
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Adapter `type` values are not checked here; the adapter factory owns
//!   the set of known backends

use thiserror::Error;

use crate::config::schema::AppConfig;
use crate::runtime::PRIMARY_DB;

/// A single semantic problem in a configuration document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("application.port must not be 0")]
    ZeroPort,
    #[error("application.{0} must be greater than 0")]
    ZeroTimeout(&'static str),
    #[error("ssl.{0} is required when ssl.enable = true")]
    MissingTlsFile(&'static str),
    #[error("logger.format must be \"pretty\" or \"json\", got {0:?}")]
    LogFormat(String),
    #[error("database {name:?}: {field} must not be empty")]
    Database { name: String, field: &'static str },
    #[error("databases.{0:?} is reserved for the primary [database] block")]
    ReservedDatabaseName(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.application.port == 0 {
        errors.push(ValidationError::ZeroPort);
    }
    if config.application.request_timeout_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("request_timeout_secs"));
    }
    if config.application.shutdown_timeout_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("shutdown_timeout_secs"));
    }

    if config.ssl.enable {
        if config.ssl.cert_file.is_empty() {
            errors.push(ValidationError::MissingTlsFile("cert_file"));
        }
        if config.ssl.key_file.is_empty() {
            errors.push(ValidationError::MissingTlsFile("key_file"));
        }
    }

    if !matches!(config.logger.format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::LogFormat(config.logger.format.clone()));
    }

    let named = config.databases.iter().map(|(n, c)| (n.as_str(), c));
    for (name, db) in config.database.iter().map(|c| (PRIMARY_DB, c)).chain(named) {
        if db.driver.is_empty() {
            errors.push(ValidationError::Database { name: name.to_string(), field: "driver" });
        }
        if db.source.is_empty() {
            errors.push(ValidationError::Database { name: name.to_string(), field: "source" });
        }
    }
    if config.databases.contains_key(PRIMARY_DB) {
        errors.push(ValidationError::ReservedDatabaseName(PRIMARY_DB.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DatabaseConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&AppConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = AppConfig::default();
        config.application.port = 0;
        config.ssl.enable = true;
        config.logger.format = "xml".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::ZeroPort));
        assert!(errors.contains(&ValidationError::MissingTlsFile("cert_file")));
        assert!(errors.contains(&ValidationError::MissingTlsFile("key_file")));
    }

    #[test]
    fn test_database_blocks() {
        let mut config = AppConfig::default();
        config.database = Some(DatabaseConfig::default());
        config.databases.insert("*".into(), DatabaseConfig {
            driver: "sqlite3".into(),
            source: "x.db".into(),
            ..Default::default()
        });

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::Database { name: "*".into(), field: "driver" }));
        assert!(errors.contains(&ValidationError::ReservedDatabaseName("*".into())));
    }
}
