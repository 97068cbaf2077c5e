//! Built-in queue consumers persisting audit records.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ApiInventory, AuditStore, LoginLog, OperateLog, API_CHECK, LOGIN_LOG, OPERATE_LOG};
use crate::queue::{Handler, HandlerError, Message, NamedQueue, QueueError};

pub struct SaveLoginLog {
    store: Arc<dyn AuditStore>,
}

impl SaveLoginLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for SaveLoginLog {
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError> {
        let record: LoginLog = message.decode()?;
        self.store.save_login_log(&record).await?;
        tracing::debug!(username = %record.username, success = record.success, "Login log saved");
        Ok(())
    }
}

pub struct SaveOperateLog {
    store: Arc<dyn AuditStore>,
}

impl SaveOperateLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for SaveOperateLog {
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError> {
        let record: OperateLog = message.decode()?;
        self.store.save_operate_log(&record).await?;
        Ok(())
    }
}

/// Reconciles the persisted API inventory with the routes in the message.
pub struct SaveSysApi {
    store: Arc<dyn AuditStore>,
}

impl SaveSysApi {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for SaveSysApi {
    async fn handle(&self, message: Arc<Message>) -> Result<(), HandlerError> {
        let inventory: ApiInventory = message.decode()?;
        let added = self.store.save_sys_api(&inventory.list).await?;
        tracing::info!(
            routes = inventory.list.len(),
            added,
            "API inventory checked"
        );
        Ok(())
    }
}

/// Subscribe the three audit consumers on `queue`.
pub fn register_consumers(queue: &NamedQueue, store: Arc<dyn AuditStore>) -> Result<(), QueueError> {
    queue.register(LOGIN_LOG, SaveLoginLog::new(store.clone()))?;
    queue.register(OPERATE_LOG, SaveOperateLog::new(store.clone()))?;
    queue.register(API_CHECK, SaveSysApi::new(store))?;
    Ok(())
}
