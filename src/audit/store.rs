//! Audit record stores.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::{LoginLog, OperateLog};
use crate::http::engine::RouteInfo;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence for audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn save_login_log(&self, record: &LoginLog) -> Result<(), AuditError>;

    async fn save_operate_log(&self, record: &OperateLog) -> Result<(), AuditError>;

    /// Persist routes not stored yet; returns how many were added.
    async fn save_sys_api(&self, routes: &[RouteInfo]) -> Result<usize, AuditError>;
}

fn api_key(route: &RouteInfo) -> (String, String) {
    (route.method.clone(), route.path.clone())
}

/// In-memory store, used when no audit directory is configured.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    login: Mutex<Vec<LoginLog>>,
    operate: Mutex<Vec<OperateLog>>,
    apis: Mutex<Vec<RouteInfo>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login_logs(&self) -> Vec<LoginLog> {
        self.login.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn operate_logs(&self) -> Vec<OperateLog> {
        self.operate.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sys_apis(&self) -> Vec<RouteInfo> {
        self.apis.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn save_login_log(&self, record: &LoginLog) -> Result<(), AuditError> {
        self.login
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn save_operate_log(&self, record: &OperateLog) -> Result<(), AuditError> {
        self.operate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn save_sys_api(&self, routes: &[RouteInfo]) -> Result<usize, AuditError> {
        let mut apis = self.apis.lock().unwrap_or_else(PoisonError::into_inner);
        let mut known: HashSet<_> = apis.iter().map(api_key).collect();
        let before = apis.len();
        for route in routes {
            if known.insert(api_key(route)) {
                apis.push(route.clone());
            }
        }
        Ok(apis.len() - before)
    }
}

const LOGIN_FILE: &str = "login_log.jsonl";
const OPERATE_FILE: &str = "operate_log.jsonl";
const SYS_API_FILE: &str = "sys_api.jsonl";

/// Store appending one JSON document per line under a directory.
///
/// Writes are serialized through an async mutex so concurrent consumers do
/// not interleave lines.
#[derive(Debug)]
pub struct FileAuditStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileAuditStore {
    /// Open a store in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| AuditError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append_lines<T: Serialize>(&self, file: &str, records: &[T]) -> Result<(), AuditError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let path = self.dir.join(file);
        let io_err = |source| AuditError::Io {
            path: path.clone(),
            source,
        };
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        out.write_all(&buf).await.map_err(io_err)?;
        out.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn stored_apis(&self) -> Result<HashSet<(String, String)>, AuditError> {
        let path = self.dir.join(SYS_API_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(source) => return Err(AuditError::Io { path, source }),
        };

        let mut known = HashSet::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RouteInfo>(line) {
                Ok(route) => {
                    known.insert(api_key(&route));
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable API record"),
            }
        }
        Ok(known)
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn save_login_log(&self, record: &LoginLog) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().await;
        self.append_lines(LOGIN_FILE, std::slice::from_ref(record)).await
    }

    async fn save_operate_log(&self, record: &OperateLog) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().await;
        self.append_lines(OPERATE_FILE, std::slice::from_ref(record)).await
    }

    async fn save_sys_api(&self, routes: &[RouteInfo]) -> Result<usize, AuditError> {
        let _guard = self.write_lock.lock().await;
        let mut known = self.stored_apis().await?;
        let added: Vec<&RouteInfo> = routes.iter().filter(|r| known.insert(api_key(r))).collect();
        self.append_lines(SYS_API_FILE, &added).await?;
        Ok(added.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn route(method: &str, path: &str) -> RouteInfo {
        RouteInfo {
            method: method.into(),
            path: path.into(),
            handler: "handler".into(),
        }
    }

    #[tokio::test]
    async fn test_memory_api_reconciliation_is_additive() {
        let store = MemoryAuditStore::new();
        let first = [route("GET", "/health"), route("GET", "/api/v1/sys/routes")];
        assert_eq!(store.save_sys_api(&first).await.unwrap(), 2);

        let second = [route("GET", "/health"), route("POST", "/api/v1/user")];
        assert_eq!(store.save_sys_api(&second).await.unwrap(), 1);
        assert_eq!(store.sys_apis().len(), 3);
    }

    #[tokio::test]
    async fn test_file_store_appends_lines() {
        let dir = tempdir().unwrap();
        let store = FileAuditStore::open(dir.path().join("audit")).unwrap();

        let log = LoginLog {
            username: "alice".into(),
            success: true,
            ip: "10.0.0.1".into(),
            user_agent: String::new(),
            message: "ok".into(),
            login_at: Utc::now(),
        };
        store.save_login_log(&log).await.unwrap();
        store.save_login_log(&log).await.unwrap();

        let content = std::fs::read_to_string(store.dir().join(LOGIN_FILE)).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: LoginLog = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(decoded, log);
    }

    #[tokio::test]
    async fn test_file_store_api_reconciliation_survives_reopen() {
        let dir = tempdir().unwrap();
        let routes = [route("GET", "/health"), route("DELETE", "/api/v1/user")];
        {
            let store = FileAuditStore::open(dir.path()).unwrap();
            assert_eq!(store.save_sys_api(&routes).await.unwrap(), 2);
        }

        let store = FileAuditStore::open(dir.path()).unwrap();
        assert_eq!(store.save_sys_api(&routes).await.unwrap(), 0);
        assert_eq!(store.save_sys_api(&[route("PUT", "/api/v1/user")]).await.unwrap(), 1);
    }
}
