//! Identity Router (C10): owns `account_id -> (proxy, fingerprint)` and is
//! the single authority every outbound call must clear before a provider is
//! touched. Generalizes the teacher's `IpRotator` (pool claim + telemetry)
//! and `ProfileManager` (scoped-resource allocate/expire) from filesystem
//! and single-process concerns into a persisted, multi-account claim table.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::sqlite::configure_connection;

const SCHEMA: &str = include_str!("../../sql/identity.sql");

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store path not configured")]
    MissingStore,
    #[error("no unused proxy available for class {0}")]
    ProxyPoolExhausted(String),
    #[error("isolation violation: no identity assigned for account {0}")]
    IsolationViolation(String),
    #[error("identity class {0} is exclusive-single-tenant and already claimed by {1}")]
    ExclusiveClaimConflict(String, String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Device class a fingerprint is synthesized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Android,
    Ios,
    GenericPc,
}

impl DeviceClass {
    fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Android => "android",
            DeviceClass::Ios => "ios",
            DeviceClass::GenericPc => "generic_pc",
        }
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = String;
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "android" => Ok(DeviceClass::Android),
            "ios" => Ok(DeviceClass::Ios),
            "generic_pc" => Ok(DeviceClass::GenericPc),
            other => Err(format!("unknown device class: {other}")),
        }
    }
}

/// Which pool a proxy/fingerprint is drawn from. Account-bound identities,
/// the scraper rotating pool, and the single-tenant exclusive VPN are kept
/// disjoint per the spec's I5/I6 invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityClass {
    AccountPool,
    ScraperPool,
    ExclusiveVpn,
}

impl IdentityClass {
    fn as_str(&self) -> &'static str {
        match self {
            IdentityClass::AccountPool => "account_pool",
            IdentityClass::ScraperPool => "scraper_pool",
            IdentityClass::ExclusiveVpn => "exclusive_vpn",
        }
    }

    fn is_exclusive(&self) -> bool {
        matches!(self, IdentityClass::ExclusiveVpn)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub account_id: String,
    pub device_class: String,
    pub identity_class: String,
    pub proxy_descriptor: String,
    pub fingerprint_descriptor: String,
    pub assigned_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct IdentityRouterBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl IdentityRouterBuilder {
    pub fn new() -> Self {
        Self {
            create_if_missing: true,
            ..Self::default()
        }
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> Result<IdentityRouter> {
        let path = self.path.ok_or(IdentityError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if self.create_if_missing && !self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(&path, flags)?;
        configure_connection(&conn)?;
        Ok(IdentityRouter { conn })
    }
}

pub struct IdentityRouter {
    conn: Connection,
}

impl IdentityRouter {
    pub fn builder() -> IdentityRouterBuilder {
        IdentityRouterBuilder::new()
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Claim an unused proxy from `candidate_proxies` and synthesize a
    /// fingerprint, atomically enforcing I5 (global proxy/fingerprint
    /// uniqueness) and I6 (exclusive-VPN single-tenancy).
    pub fn assign(
        &mut self,
        account_id: &str,
        device_class: DeviceClass,
        identity_class: IdentityClass,
        candidate_proxies: &[String],
    ) -> Result<Identity> {
        let tx = self.conn.transaction()?;

        if identity_class.is_exclusive() {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT account_id FROM identity_claims WHERE identity_class = ?1",
                    params![identity_class.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(holder) = existing {
                if holder != account_id {
                    return Err(IdentityError::ExclusiveClaimConflict(
                        identity_class.as_str().to_string(),
                        holder,
                    ));
                }
            }
        }

        let used: Vec<String> = {
            let mut stmt = tx.prepare("SELECT proxy_descriptor FROM identities")?;
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let proxy = candidate_proxies
            .iter()
            .find(|candidate| !used.contains(candidate))
            .cloned()
            .ok_or_else(|| IdentityError::ProxyPoolExhausted(identity_class.as_str().to_string()))?;

        let fingerprint = format!("fp-{}-{}", device_class.as_str(), Uuid::new_v4());
        let now = Utc::now();

        tx.execute(
            "INSERT INTO identities
                (account_id, device_class, identity_class, proxy_descriptor, fingerprint_descriptor, assigned_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(account_id) DO UPDATE SET
                device_class = excluded.device_class,
                identity_class = excluded.identity_class,
                proxy_descriptor = excluded.proxy_descriptor,
                fingerprint_descriptor = excluded.fingerprint_descriptor,
                last_used_at = excluded.last_used_at",
            params![
                account_id,
                device_class.as_str(),
                identity_class.as_str(),
                proxy,
                fingerprint,
                now,
            ],
        )?;

        if identity_class.is_exclusive() {
            tx.execute(
                "INSERT INTO identity_claims (identity_class, account_id) VALUES (?1, ?2)
                 ON CONFLICT(identity_class) DO UPDATE SET account_id = excluded.account_id",
                params![identity_class.as_str(), account_id],
            )?;
        }

        tx.commit()?;

        self.fetch(account_id)?
            .ok_or_else(|| IdentityError::IsolationViolation(account_id.to_string()))
    }

    pub fn fetch(&self, account_id: &str) -> Result<Option<Identity>> {
        self.conn
            .query_row(
                "SELECT account_id, device_class, identity_class, proxy_descriptor,
                        fingerprint_descriptor, assigned_at, last_used_at
                 FROM identities WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(Identity {
                        account_id: row.get(0)?,
                        device_class: row.get(1)?,
                        identity_class: row.get(2)?,
                        proxy_descriptor: row.get(3)?,
                        fingerprint_descriptor: row.get(4)?,
                        assigned_at: row.get(5)?,
                        last_used_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(IdentityError::from)
    }

    /// Validate (I7): every outbound action must present an identity whose
    /// `account_id` matches the record owning the action. Also touches
    /// `last_used_at`.
    pub fn validate(&mut self, account_id: &str) -> Result<Identity> {
        let identity = self
            .fetch(account_id)?
            .ok_or_else(|| IdentityError::IsolationViolation(account_id.to_string()))?;
        self.conn.execute(
            "UPDATE identities SET last_used_at = ?1 WHERE account_id = ?2",
            params![Utc::now(), account_id],
        )?;
        Ok(identity)
    }

    pub fn count_active(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn router() -> (tempfile::TempDir, IdentityRouter) {
        let dir = tempdir().unwrap();
        let mut router = IdentityRouter::builder()
            .path(dir.path().join("identity.sqlite"))
            .build()
            .unwrap();
        router.initialize().unwrap();
        (dir, router)
    }

    #[test]
    fn assigns_disjoint_proxies_per_account() {
        let (_dir, mut router) = router();
        let pool = vec!["proxy-a".to_string(), "proxy-b".to_string()];
        let a = router
            .assign("acct-1", DeviceClass::Android, IdentityClass::AccountPool, &pool)
            .unwrap();
        let b = router
            .assign("acct-2", DeviceClass::Ios, IdentityClass::AccountPool, &pool)
            .unwrap();
        assert_ne!(a.proxy_descriptor, b.proxy_descriptor);
        assert_ne!(a.fingerprint_descriptor, b.fingerprint_descriptor);
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let (_dir, mut router) = router();
        let pool = vec!["only-proxy".to_string()];
        router
            .assign("acct-1", DeviceClass::Android, IdentityClass::AccountPool, &pool)
            .unwrap();
        let result = router.assign("acct-2", DeviceClass::Android, IdentityClass::AccountPool, &pool);
        assert!(matches!(result, Err(IdentityError::ProxyPoolExhausted(_))));
    }

    #[test]
    fn exclusive_vpn_rejects_a_second_tenant() {
        let (_dir, mut router) = router();
        let pool = vec!["vpn-exit".to_string()];
        router
            .assign("bot-1", DeviceClass::GenericPc, IdentityClass::ExclusiveVpn, &pool)
            .unwrap();
        let other_pool = vec!["vpn-exit-2".to_string()];
        let result = router.assign(
            "bot-2",
            DeviceClass::GenericPc,
            IdentityClass::ExclusiveVpn,
            &other_pool,
        );
        assert!(matches!(result, Err(IdentityError::ExclusiveClaimConflict(_, _))));
    }

    #[test]
    fn validate_without_assignment_is_isolation_violation() {
        let (_dir, mut router) = router();
        let result = router.validate("ghost");
        assert!(matches!(result, Err(IdentityError::IsolationViolation(_))));
    }
}
