//! Service operations run as authorize -> execute -> audit, with store
//! mutations committed only when the body succeeds.

use connector_core::{ConnectorError, Result};
use connector_store::{AuditLog, SqliteStore, TransactionOps};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::audit;
use crate::auth::{Role, SessionUser};

/// A named service operation and the role it requires
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub name: &'static str,
    pub min_role: Role,
    pub audited: bool,
}

impl Operation {
    pub const fn new(name: &'static str, min_role: Role) -> Self {
        Self {
            name,
            min_role,
            audited: false,
        }
    }

    pub const fn audited(mut self) -> Self {
        self.audited = true;
        self
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Standard => "Standard",
        Role::Admin => "Admin",
        Role::SuperAdmin => "Super admin",
    }
}

/// Reject callers whose role is below the operation's minimum
pub fn authorize(operation: &Operation, user: &SessionUser) -> Result<()> {
    if user.role.satisfies(operation.min_role) {
        return Ok(());
    }
    Err(ConnectorError::Authorization(format!(
        "{} permission check for {} failed",
        role_label(operation.min_role),
        operation.name
    )))
}

/// Caller context every operation runs under
#[derive(Clone, Copy)]
pub struct Pipeline<'a> {
    user: &'a SessionUser,
    audit_log: &'a Arc<Mutex<AuditLog>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(user: &'a SessionUser, audit_log: &'a Arc<Mutex<AuditLog>>) -> Self {
        Self { user, audit_log }
    }

    pub fn user(&self) -> &SessionUser {
        self.user
    }

    /// Authorize, run `body`, then audit the outcome
    pub async fn run<T, F, Fut>(&self, operation: &Operation, input: Value, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = match authorize(operation, self.user) {
            Ok(()) => body().await,
            Err(e) => Err(e),
        };
        self.audit(operation, &input, &result).await;
        result
    }

    /// Like [`Pipeline::run`], with the body inside a store transaction that
    /// rolls back on error
    pub async fn run_in_transaction<T, F>(
        &self,
        operation: &Operation,
        input: Value,
        store: &SqliteStore,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&TransactionOps<'_>) -> connector_store::Result<T>,
    {
        let result = match authorize(operation, self.user) {
            Ok(()) => store.in_transaction(body).map_err(ConnectorError::from),
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            tracing::error!(operation = operation.name, "Database transaction failed: {}", e);
        }
        self.audit(operation, &input, &result).await;
        result
    }

    async fn audit<T>(&self, operation: &Operation, input: &Value, result: &Result<T>) {
        if !operation.audited {
            return;
        }
        match result {
            Ok(_) => {
                audit::log_operation_success(
                    operation.name,
                    &self.user.username,
                    input,
                    self.audit_log,
                )
                .await
            }
            Err(e) => {
                audit::log_operation_error(
                    operation.name,
                    &self.user.username,
                    input,
                    &e.to_string(),
                    self.audit_log,
                )
                .await
            }
        }
    }
}
