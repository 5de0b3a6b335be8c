#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

mod steps;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use daybook_migrate_core::{
    AssociationRule, DefaultRowRule, MigrationError, MigrationRegistry, PathBackfill, RebuildSpec,
    SchemaVersion, StepMeta,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{error, info};
use ulid::Ulid;

pub use steps::schema_registry;

/// Wrapper over the embedded store that owns the schema version of record.
///
/// The version is persisted in the store itself as an append-only
/// `schema_migrations` ledger; the current version is the highest applied
/// row, 0 for a fresh store. Version rows are written only by
/// [`MigrationRunner`] as the last statement before a step commits.
pub struct VersionedStore {
    conn: Connection,
}

impl VersionedStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )
        .context("failed to ensure schema_migrations exists")?;

        Ok(Self { conn })
    }

    pub fn current_version(&self) -> Result<SchemaVersion> {
        let version: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .context("failed to read current schema version")?;

        SchemaVersion::try_from(version)
            .with_context(|| format!("invalid stored schema version: {version}"))
    }

    /// Applied version history, ascending.
    pub fn applied_versions(&self) -> Result<Vec<SchemaVersion>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut versions = Vec::new();
        for row in rows {
            let version = row?;
            versions.push(
                SchemaVersion::try_from(version)
                    .with_context(|| format!("invalid stored schema version: {version}"))?,
            );
        }
        Ok(versions)
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn record_version(tx: &Transaction<'_>, version: SchemaVersion) -> Result<()> {
    let applied_at = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format applied_at timestamp")?;

    tx.execute(
        "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![i64::from(version), applied_at],
    )
    .context("failed to record schema version")?;

    Ok(())
}

/// One versioned schema transformation, applied inside its own transaction.
pub trait MigrationStep: StepMeta {
    /// Issues the step's DDL/DML against the open transaction.
    ///
    /// Statements must not perform network I/O or depend on the wall clock
    /// for correctness; generating identifiers for freshly inserted rows is
    /// the only permitted non-determinism.
    fn apply(&self, tx: &Transaction<'_>) -> Result<()>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct AppliedStep {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub summary: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct UpgradeReport {
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    pub applied: Vec<AppliedStep>,
}

/// Orchestrates applying a contiguous chain of steps, one per transaction.
pub struct MigrationRunner {
    registry: MigrationRegistry<Box<dyn MigrationStep>>,
}

impl MigrationRunner {
    #[must_use]
    pub fn new(registry: MigrationRegistry<Box<dyn MigrationStep>>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &MigrationRegistry<Box<dyn MigrationStep>> {
        &self.registry
    }

    /// Upgrades the store to the highest registered version.
    ///
    /// # Errors
    /// See [`MigrationRunner::upgrade`].
    pub fn upgrade_to_latest(
        &self,
        store: &mut VersionedStore,
    ) -> Result<UpgradeReport, MigrationError> {
        self.upgrade(store, self.registry.latest_version())
    }

    /// Applies the chain from the store's current version to `target`.
    ///
    /// Each step runs inside its own transaction; the new version number is
    /// recorded as the last statement before commit. Any failure rolls the
    /// current step back, aborts the whole upgrade, and leaves the stored
    /// version at the last committed step's `to_version`. Committed version
    /// boundaries are therefore always fully self-consistent states, and a
    /// multi-step upgrade passes through every intermediate version as a
    /// committed checkpoint.
    ///
    /// # Errors
    /// Returns the planning errors of
    /// [`MigrationRegistry::chain_from`](daybook_migrate_core::MigrationRegistry::chain_from),
    /// [`MigrationError::StepExecution`] when a step's statements fail,
    /// [`MigrationError::VersionWrite`] when the version record or commit
    /// fails, and [`MigrationError::Store`] for infrastructure failures
    /// outside a step body.
    pub fn upgrade(
        &self,
        store: &mut VersionedStore,
        target: SchemaVersion,
    ) -> Result<UpgradeReport, MigrationError> {
        let from_version = store
            .current_version()
            .map_err(|err| MigrationError::Store(format!("{err:#}")))?;
        let chain = self.registry.chain_from(from_version, target)?;

        let mut applied = Vec::new();
        for step in chain {
            let from = step.from_version();
            let to = step.to_version();

            let tx = store.conn.transaction().map_err(|err| {
                MigrationError::Store(format!(
                    "failed to begin transaction for step {from}->{to}: {err}"
                ))
            })?;

            info!(from, to, "applying migration step: {}", step.summary());

            if let Err(err) = step.apply(&tx) {
                drop(tx);
                error!(from, to, "migration step rolled back: {:#}", err);
                return Err(MigrationError::StepExecution {
                    from,
                    to,
                    detail: format!("{err:#}"),
                });
            }

            if let Err(err) = record_version(&tx, to) {
                drop(tx);
                error!(from, to, "migration step rolled back: {:#}", err);
                return Err(MigrationError::VersionWrite {
                    from,
                    to,
                    detail: format!("{err:#}"),
                });
            }

            if let Err(err) = tx.commit() {
                error!(from, to, "migration step rolled back: commit failed: {}", err);
                return Err(MigrationError::VersionWrite {
                    from,
                    to,
                    detail: format!("commit failed: {err}"),
                });
            }

            info!(from, to, "migration step committed");
            applied.push(AppliedStep {
                from_version: from,
                to_version: to,
                summary: step.summary().to_string(),
            });
        }

        Ok(UpgradeReport {
            from_version,
            to_version: target,
            applied,
        })
    }
}

/// Executes a [`RebuildSpec`]'s shadow-table script inside the enclosing
/// step's transaction: create shadow, copy rows, drop original, rename,
/// recreate indexes.
///
/// Primary keys are preserved exactly because the rebuilt table copies them
/// column for column; constraint violations surface here and roll the step
/// back.
pub fn rebuild_table(tx: &Transaction<'_>, spec: &RebuildSpec) -> Result<()> {
    let statements = spec
        .statements()
        .map_err(|err| anyhow!("invalid rebuild spec for {}: {err}", spec.table))?;

    for sql in statements {
        tx.execute_batch(&sql)
            .with_context(|| format!("rebuild of {} failed executing: {sql}", spec.table))?;
    }

    Ok(())
}

/// Runs the two-pass tree-path derivation; returns the number of rows
/// updated across both passes.
pub fn backfill_tree_paths(tx: &Transaction<'_>, rule: &PathBackfill) -> Result<usize> {
    let statements = rule
        .statements()
        .map_err(|err| anyhow!("invalid path backfill for {}: {err}", rule.table))?;

    let mut updated = 0;
    for sql in statements {
        updated += tx
            .execute(&sql, [])
            .with_context(|| format!("path backfill failed executing: {sql}"))?;
    }

    Ok(updated)
}

/// Inserts one freshly generated default row per owner the rule's anti-join
/// reports as lacking one; returns the number of rows inserted.
///
/// Stray default flags for those owners are demoted first, so a prior
/// partial run can never leave two defaults behind. Re-running when every
/// owner already has a default inserts nothing.
pub fn backfill_default_rows(tx: &Transaction<'_>, rule: &DefaultRowRule) -> Result<usize> {
    rule.validate()
        .map_err(|err| anyhow!("invalid default-row backfill: {err}"))?;

    let owners: Vec<String> = {
        let mut stmt = tx
            .prepare(&rule.missing_owners_sql)
            .context("failed to prepare missing-owners query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to run missing-owners query")?;

        let mut owners = Vec::new();
        for row in rows {
            owners.push(row.context("failed to read owner id")?);
        }
        owners
    };

    let mut inserted = 0;
    for owner in owners {
        if let Some(demote_sql) = &rule.demote_sql {
            tx.execute(demote_sql, params![owner])
                .with_context(|| format!("failed to demote stray defaults for owner {owner}"))?;
        }

        let row_id = Ulid::new().to_string();
        inserted += tx
            .execute(&rule.insert_sql, params![row_id, owner])
            .with_context(|| format!("failed to insert default row for owner {owner}"))?;
    }

    Ok(inserted)
}

/// Executes an [`AssociationRule`]'s idempotent link synthesis; returns the
/// number of link rows inserted.
pub fn backfill_associations(tx: &Transaction<'_>, rule: &AssociationRule) -> Result<usize> {
    let sql = rule
        .insert_sql()
        .map_err(|err| anyhow!("invalid association backfill for {}: {err}", rule.link_table))?;

    tx.execute(&sql, [])
        .with_context(|| format!("association backfill failed executing: {sql}"))
}

pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

pub fn table_has_column(conn: &Connection, table_name: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}
