use connector_store::{AuditLog, AuditRecord};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keys whose values never reach the audit table
const REDACTED_KEYS: &[&str] = &["clientSecret", "bearerToken", "accessToken", "password"];

const REDACTED: &str = "[REDACTED]";

/// Copy of `input` with credential values masked, at any depth
pub fn redact(input: &Value) -> Value {
    match input {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if REDACTED_KEYS.contains(&k.as_str()) && !v.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Log a successful operation
pub async fn log_operation_success(
    action: &str,
    actor: &str,
    input: &Value,
    audit_log: &Arc<Mutex<AuditLog>>,
) {
    tracing::info!(
        actor = actor,
        action = action,
        status = "success",
        "Audit: {} by {}",
        action,
        actor
    );

    write(audit_log, AuditRecord::success(action, actor, redact(input))).await;
}

/// Log a failed operation
pub async fn log_operation_error(
    action: &str,
    actor: &str,
    input: &Value,
    error: &str,
    audit_log: &Arc<Mutex<AuditLog>>,
) {
    tracing::warn!(
        actor = actor,
        action = action,
        status = "error",
        error = error,
        "Audit: {} by {} failed: {}",
        action,
        actor,
        error
    );

    write(
        audit_log,
        AuditRecord::failure(action, actor, redact(input), error),
    )
    .await;
}

async fn write(audit_log: &Arc<Mutex<AuditLog>>, record: AuditRecord) {
    let audit = audit_log.lock().await;
    if let Err(e) = audit.log(&record) {
        tracing::error!("Failed to write audit log to database: {}", e);
    }
}

/// Log an authentication attempt
pub fn log_auth_attempt(client_ip: &str, user_id: Option<&str>, success: bool) {
    if success {
        tracing::info!(
            user_id = user_id.unwrap_or("unknown"),
            client_ip = %client_ip,
            status = "success",
            "Audit: Authentication successful"
        );
    } else {
        tracing::warn!(
            client_ip = %client_ip,
            status = "failed",
            "Audit: Authentication failed"
        );
    }
}
