//! Tenant routing data for the call bridge.
//!
//! A tenant is a workspace that owns one or more inbound phone numbers. When
//! a call arrives, the dialled number is normalized and looked up here to find
//! the owning tenant and the assistant configuration used for the call.
//!
//! Call handling only ever reads these tables. Provisioning helpers are
//! provided for operators and tests.

use callbridge_types::TenantConfig;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest and longest digit counts accepted for a phone number.
const MIN_NUMBER_DIGITS: usize = 7;
const MAX_NUMBER_DIGITS: usize = 15;

/// Errors that can occur during tenant operations.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("tenant not found: {0}")]
    NotFound(String),
    #[error("invalid phone number: {0}")]
    InvalidNumber(String),
}

/// A provisioned tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub tenant_id: String,
    /// Business name shown in the dashboard.
    pub display_name: String,
    pub assistant_name: String,
    pub voice: String,
    pub greeting: Option<String>,
    pub context_ref: Option<String>,
    /// Disabled tenants keep their numbers but decline every call.
    pub enabled: bool,
    /// Creation timestamp (SQLite `datetime('now')`, UTC).
    pub created_at: String,
}

impl Tenant {
    /// Returns the immutable per-call view of this tenant.
    pub fn config(&self) -> TenantConfig {
        TenantConfig {
            tenant_id: self.tenant_id.clone(),
            assistant_name: self.assistant_name.clone(),
            voice: self.voice.clone(),
            greeting: self.greeting.clone(),
            context_ref: self.context_ref.clone(),
        }
    }
}

/// Parameters for provisioning a new tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTenantParams {
    pub tenant_id: String,
    pub display_name: String,
    pub assistant_name: String,
    pub voice: String,
    pub greeting: Option<String>,
    pub context_ref: Option<String>,
}

/// Normalizes a phone number to `+` followed by digits.
///
/// Spaces, dashes, dots and parentheses are stripped and a leading `00`
/// international prefix is rewritten to `+`. Numbers without a prefix are
/// assumed to already include their country code.
///
/// # Errors
///
/// Returns `TenantError::InvalidNumber` if anything other than digits remains
/// or the digit count is outside the E.164 range.
pub fn normalize_number(raw: &str) -> Result<String, TenantError> {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    let digits = if let Some(rest) = stripped.strip_prefix('+') {
        rest
    } else if let Some(rest) = stripped.strip_prefix("00") {
        rest
    } else {
        stripped.as_str()
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TenantError::InvalidNumber(raw.to_string()));
    }
    if !(MIN_NUMBER_DIGITS..=MAX_NUMBER_DIGITS).contains(&digits.len()) {
        return Err(TenantError::InvalidNumber(raw.to_string()));
    }

    Ok(format!("+{}", digits))
}

const TENANT_COLUMNS: &str = "t.tenant_id, t.display_name, t.assistant_name, t.voice, \
     t.greeting, t.context_ref, t.enabled, t.created_at";

fn row_to_tenant(row: &Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        tenant_id: row.get(0)?,
        display_name: row.get(1)?,
        assistant_name: row.get(2)?,
        voice: row.get(3)?,
        greeting: row.get(4)?,
        context_ref: row.get(5)?,
        enabled: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Provisions a new, enabled tenant.
pub fn create_tenant(conn: &Connection, params: &CreateTenantParams) -> Result<(), TenantError> {
    conn.execute(
        "INSERT INTO tenants (
            tenant_id, display_name, assistant_name, voice, greeting, context_ref
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            params.tenant_id,
            params.display_name,
            params.assistant_name,
            params.voice,
            params.greeting,
            params.context_ref,
        ],
    )?;
    tracing::info!(tenant_id = %params.tenant_id, "provisioned tenant");
    Ok(())
}

/// Retrieves a tenant by id.
pub fn get_tenant(conn: &Connection, tenant_id: &str) -> Result<Tenant, TenantError> {
    conn.query_row(
        &format!("SELECT {TENANT_COLUMNS} FROM tenants t WHERE t.tenant_id = ?1"),
        [tenant_id],
        row_to_tenant,
    )
    .optional()?
    .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))
}

/// Enables or disables a tenant.
pub fn set_tenant_enabled(
    conn: &Connection,
    tenant_id: &str,
    enabled: bool,
) -> Result<(), TenantError> {
    let updated = conn.execute(
        "UPDATE tenants SET enabled = ?1 WHERE tenant_id = ?2",
        params![enabled, tenant_id],
    )?;
    if updated == 0 {
        return Err(TenantError::NotFound(tenant_id.to_string()));
    }
    Ok(())
}

/// Routes a phone number to a tenant, replacing any previous owner.
///
/// Returns the normalized number that was stored.
pub fn assign_number(
    conn: &Connection,
    tenant_id: &str,
    number: &str,
) -> Result<String, TenantError> {
    let normalized = normalize_number(number)?;
    // Surface a missing tenant as NotFound rather than a foreign-key failure.
    get_tenant(conn, tenant_id)?;

    conn.execute(
        "INSERT INTO phone_numbers (number, tenant_id) VALUES (?1, ?2)
         ON CONFLICT(number) DO UPDATE SET tenant_id = excluded.tenant_id",
        params![normalized, tenant_id],
    )?;
    Ok(normalized)
}

/// Removes a number's routing. Returns `true` if a row was removed.
pub fn release_number(conn: &Connection, number: &str) -> Result<bool, TenantError> {
    let normalized = normalize_number(number)?;
    let removed = conn.execute("DELETE FROM phone_numbers WHERE number = ?1", [normalized])?;
    Ok(removed > 0)
}

/// Looks up the tenant that owns `number`, regardless of enabled state.
///
/// Returns `Ok(None)` when the number is well-formed but not provisioned.
pub fn find_by_number(conn: &Connection, number: &str) -> Result<Option<Tenant>, TenantError> {
    let normalized = normalize_number(number)?;
    let tenant = conn
        .query_row(
            &format!(
                "SELECT {TENANT_COLUMNS} FROM phone_numbers n
                 JOIN tenants t ON t.tenant_id = n.tenant_id
                 WHERE n.number = ?1"
            ),
            [normalized],
            row_to_tenant,
        )
        .optional()?;
    Ok(tenant)
}
