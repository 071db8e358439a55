//! Tenant Resolver: maps the dialled number on a `start` envelope to the
//! tenant that owns it.

use callbridge_db::DbPool;
use callbridge_tenants::{find_by_number, TenantError};
use callbridge_types::TenantConfig;
use callbridge_voice::BoxFuture;
use thiserror::Error;

/// Why a call could not be routed. Every variant declines the call.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("number {0} is not provisioned")]
    NotProvisioned(String),
    #[error("tenant {0} is disabled")]
    Disabled(String),
    #[error("invalid destination number: {0}")]
    InvalidNumber(String),
    #[error("tenant store error: {0}")]
    Store(String),
}

impl ResolveError {
    /// Short reason recorded on `SessionDeclined` events.
    pub fn reason(&self) -> &'static str {
        match self {
            ResolveError::NotProvisioned(_) => "not_provisioned",
            ResolveError::Disabled(_) => "tenant_disabled",
            ResolveError::InvalidNumber(_) => "invalid_number",
            ResolveError::Store(_) => "store_error",
        }
    }
}

/// Looks up the tenant for an inbound call.
pub trait TenantResolver: Send + Sync {
    fn resolve<'a>(&'a self, to_number: &'a str)
        -> BoxFuture<'a, Result<TenantConfig, ResolveError>>;
}

/// Resolver backed by the SQLite tenant store.
///
/// Lookups run on the blocking pool so a slow disk never stalls the gateway's
/// read loop. The store is only read here.
#[derive(Clone)]
pub struct SqliteTenantResolver {
    pool: DbPool,
}

impl SqliteTenantResolver {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl TenantResolver for SqliteTenantResolver {
    fn resolve<'a>(
        &'a self,
        to_number: &'a str,
    ) -> BoxFuture<'a, Result<TenantConfig, ResolveError>> {
        Box::pin(async move {
            let pool = self.pool.clone();
            let number = to_number.to_string();
            let result = tokio::task::spawn_blocking(move || {
                let conn = pool
                    .get()
                    .map_err(|e| ResolveError::Store(format!("pool error: {}", e)))?;
                match find_by_number(&conn, &number) {
                    Ok(Some(tenant)) if tenant.enabled => Ok(tenant.config()),
                    Ok(Some(tenant)) => Err(ResolveError::Disabled(tenant.tenant_id)),
                    Ok(None) => Err(ResolveError::NotProvisioned(number)),
                    Err(TenantError::InvalidNumber(raw)) => Err(ResolveError::InvalidNumber(raw)),
                    Err(e) => Err(ResolveError::Store(e.to_string())),
                }
            })
            .await;

            match result {
                Ok(resolved) => resolved,
                Err(e) => Err(ResolveError::Store(format!("task join error: {}", e))),
            }
        })
    }
}
