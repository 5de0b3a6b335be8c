//! The daybook schema's version history, one step per version pair.
//!
//! Steps are constructed once at process start and never mutated. Each body
//! assumes the exact schema left by its predecessor and is written so that
//! re-executing it after a crash-and-retry at a committed version boundary
//! cannot error: DDL carries `IF [NOT] EXISTS` guards, in-place column adds
//! probe `PRAGMA table_info` first, and backfills are anti-join or
//! upsert-or-ignore shaped.

use anyhow::Result;
use daybook_migrate_core::{
    AssociationRule, ColumnSpec, DefaultRowRule, ForeignKeySpec, IndexSpec, MigrationError,
    MigrationRegistry, PathBackfill, RebuildSpec, SchemaVersion, StepMeta,
};
use rusqlite::Transaction;

use crate::{
    backfill_associations, backfill_default_rows, backfill_tree_paths, rebuild_table,
    table_has_column, MigrationStep,
};

/// Registry holding every daybook schema step, versions 0 through 6.
///
/// # Errors
/// Returns [`MigrationError`] only if the step set itself is malformed,
/// which would be a programming error caught by the registry's validation.
pub fn schema_registry() -> Result<MigrationRegistry<Box<dyn MigrationStep>>, MigrationError> {
    let steps: Vec<Box<dyn MigrationStep>> = vec![
        Box::new(CreateBaseSchema),
        Box::new(AddTransactionNotes),
        Box::new(EnforceTransactionOwnership),
        Box::new(CategoryTreePaths),
        Box::new(IntroduceLedgers),
        Box::new(LinkTransactionsToLedgers),
    ];

    let mut registry = MigrationRegistry::new();
    for step in steps {
        registry.register(step)?;
    }
    Ok(registry)
}

/// 0 -> 1: the base schema. `transactions` starts in its legacy shape with
/// plain TEXT reference columns and no foreign keys.
struct CreateBaseSchema;

impl StepMeta for CreateBaseSchema {
    fn from_version(&self) -> SchemaVersion {
        0
    }

    fn summary(&self) -> &str {
        "create base users/accounts/categories/transactions schema"
    }
}

impl MigrationStep for CreateBaseSchema {
    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'CASH',
                balance_cents INTEGER NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'CNY',
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_accounts_user ON accounts(user_id);

             CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                icon TEXT,
                color TEXT,
                parent_id TEXT,
                display_order INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_categories_user ON categories(user_id);
             CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_id);

             CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                category_id TEXT,
                amount_cents INTEGER NOT NULL,
                happened_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);",
        )?;
        Ok(())
    }
}

/// 1 -> 2: nullable annotation columns added in place.
struct AddTransactionNotes;

impl StepMeta for AddTransactionNotes {
    fn from_version(&self) -> SchemaVersion {
        1
    }

    fn summary(&self) -> &str {
        "add transactions.note and accounts.icon"
    }
}

impl MigrationStep for AddTransactionNotes {
    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        if !table_has_column(tx, "transactions", "note")? {
            tx.execute_batch("ALTER TABLE transactions ADD COLUMN note TEXT;")?;
        }
        if !table_has_column(tx, "accounts", "icon")? {
            tx.execute_batch("ALTER TABLE accounts ADD COLUMN icon TEXT;")?;
        }
        Ok(())
    }
}

/// 2 -> 3: rebuild `transactions` to carry the constraints SQLite cannot add
/// in place: NOT NULL foreign keys to `users`/`accounts`, a foreign key to
/// `categories`, the derived `kind` column, and the account/time composite
/// index. Rows whose `account_id` references no account fail the copy and
/// roll the step back.
struct EnforceTransactionOwnership;

impl StepMeta for EnforceTransactionOwnership {
    fn from_version(&self) -> SchemaVersion {
        2
    }

    fn summary(&self) -> &str {
        "rebuild transactions with ownership foreign keys"
    }
}

fn transactions_rebuild_spec() -> RebuildSpec {
    RebuildSpec {
        table: "transactions".to_string(),
        columns: vec![
            ColumnSpec::copied("id", "TEXT PRIMARY KEY"),
            ColumnSpec::copied("user_id", "TEXT NOT NULL"),
            ColumnSpec::copied("account_id", "TEXT NOT NULL"),
            ColumnSpec::copied("category_id", "TEXT"),
            ColumnSpec::derived("kind", "TEXT NOT NULL DEFAULT 'EXPENSE'", "'EXPENSE'"),
            ColumnSpec::copied("amount_cents", "INTEGER NOT NULL"),
            ColumnSpec::copied("note", "TEXT"),
            ColumnSpec::copied("happened_at", "INTEGER NOT NULL"),
            ColumnSpec::copied("created_at", "INTEGER NOT NULL"),
            ColumnSpec::copied("updated_at", "INTEGER NOT NULL"),
        ],
        foreign_keys: vec![
            ForeignKeySpec::new("user_id", "users", "id"),
            ForeignKeySpec::new("account_id", "accounts", "id"),
            ForeignKeySpec::new("category_id", "categories", "id"),
        ],
        indexes: vec![
            IndexSpec::new("idx_transactions_user", &["user_id"]),
            IndexSpec::new(
                "idx_transactions_account_happened",
                &["account_id", "happened_at"],
            ),
        ],
    }
}

impl MigrationStep for EnforceTransactionOwnership {
    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        rebuild_table(tx, &transactions_rebuild_spec())
    }
}

/// 3 -> 4: materialized category paths plus a `General` default child under
/// every root category.
struct CategoryTreePaths;

impl StepMeta for CategoryTreePaths {
    fn from_version(&self) -> SchemaVersion {
        3
    }

    fn summary(&self) -> &str {
        "backfill category paths and default children"
    }
}

fn category_path_rule() -> PathBackfill {
    PathBackfill {
        table: "categories".to_string(),
        id_column: "id".to_string(),
        parent_column: "parent_id".to_string(),
        name_column: "name".to_string(),
        path_column: "path".to_string(),
        separator: "/".to_string(),
    }
}

fn default_child_rule() -> DefaultRowRule {
    DefaultRowRule {
        missing_owners_sql: "SELECT root.id FROM categories AS root
             WHERE root.parent_id IS NULL
               AND NOT EXISTS (
                 SELECT 1 FROM categories AS child
                 WHERE child.parent_id = root.id AND child.name = 'General'
               )"
            .to_string(),
        demote_sql: None,
        insert_sql: "INSERT INTO categories(id, user_id, name, kind, icon, color, parent_id, display_order, path, created_at, updated_at)
             SELECT ?1, root.user_id, 'General', root.kind, root.icon, root.color, root.id, 0, root.path || '/General', root.created_at, root.updated_at
             FROM categories AS root WHERE root.id = ?2"
            .to_string(),
    }
}

impl MigrationStep for CategoryTreePaths {
    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        if !table_has_column(tx, "categories", "path")? {
            tx.execute_batch("ALTER TABLE categories ADD COLUMN path TEXT;")?;
        }
        let _ = backfill_tree_paths(tx, &category_path_rule())?;
        let _ = backfill_default_rows(tx, &default_child_rule())?;
        Ok(())
    }
}

/// 4 -> 5: the ledgers table, with exactly one active default ledger
/// guaranteed per user.
struct IntroduceLedgers;

impl StepMeta for IntroduceLedgers {
    fn from_version(&self) -> SchemaVersion {
        4
    }

    fn summary(&self) -> &str {
        "create ledgers and backfill one default per user"
    }
}

fn default_ledger_rule() -> DefaultRowRule {
    DefaultRowRule {
        missing_owners_sql: "SELECT users.id FROM users
             WHERE NOT EXISTS (
                 SELECT 1 FROM ledgers
                 WHERE ledgers.user_id = users.id
                   AND ledgers.is_default = 1
                   AND ledgers.is_active = 1
             )"
        .to_string(),
        demote_sql: Some(
            "UPDATE ledgers SET is_default = 0 WHERE user_id = ?1 AND is_default = 1".to_string(),
        ),
        insert_sql: "INSERT INTO ledgers(id, user_id, name, description, is_default, is_active, display_order, created_at, updated_at)
             SELECT ?1, users.id, 'Default Ledger', 'Created for existing records', 1, 1, 0, users.created_at, users.updated_at
             FROM users WHERE users.id = ?2"
            .to_string(),
    }
}

impl MigrationStep for IntroduceLedgers {
    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledgers (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                description TEXT,
                color TEXT,
                icon TEXT,
                is_default INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                display_order INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_ledgers_user ON ledgers(user_id);",
        )?;
        let _ = backfill_default_rows(tx, &default_ledger_rule())?;
        Ok(())
    }
}

/// 5 -> 6: point every transaction at a ledger, then model the relation as
/// link rows with identifiers derived from both sides so re-running the
/// backfill never duplicates them.
struct LinkTransactionsToLedgers;

impl StepMeta for LinkTransactionsToLedgers {
    fn from_version(&self) -> SchemaVersion {
        5
    }

    fn summary(&self) -> &str {
        "backfill transaction ledger ids and association links"
    }
}

fn transaction_ledger_rule() -> AssociationRule {
    AssociationRule {
        link_table: "transaction_ledger_links".to_string(),
        id_column: "id".to_string(),
        left_column: "transaction_id".to_string(),
        right_column: "ledger_id".to_string(),
        source_table: "transactions".to_string(),
        source_id_column: "id".to_string(),
        source_ref_column: "ledger_id".to_string(),
        extra_columns: vec![(
            "created_at".to_string(),
            "transactions.created_at".to_string(),
        )],
    }
}

impl MigrationStep for LinkTransactionsToLedgers {
    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        if !table_has_column(tx, "transactions", "ledger_id")? {
            tx.execute_batch("ALTER TABLE transactions ADD COLUMN ledger_id TEXT;")?;
        }

        tx.execute(
            "UPDATE transactions SET ledger_id = (
                SELECT ledgers.id FROM ledgers
                WHERE ledgers.user_id = transactions.user_id
                  AND ledgers.is_default = 1
                  AND ledgers.is_active = 1
             )
             WHERE ledger_id IS NULL",
            [],
        )?;

        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS transaction_ledger_links (
                id TEXT PRIMARY KEY,
                transaction_id TEXT NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                ledger_id TEXT NOT NULL REFERENCES ledgers(id),
                created_at INTEGER NOT NULL,
                UNIQUE(transaction_id, ledger_id)
             );
             CREATE INDEX IF NOT EXISTS idx_links_ledger ON transaction_ledger_links(ledger_id);",
        )?;

        let _ = backfill_associations(tx, &transaction_ledger_rule())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rusqlite::params;

    use super::*;
    use crate::{table_exists, MigrationRunner, VersionedStore};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn store_at(version: SchemaVersion) -> (VersionedStore, MigrationRunner) {
        let mut store = must(VersionedStore::open(Path::new(":memory:")));
        let runner = MigrationRunner::new(must(schema_registry()));
        let _ = must(runner.upgrade(&mut store, version));
        (store, runner)
    }

    fn seed_user(store: &VersionedStore, user_id: &str) {
        must(store.connection().execute(
            "INSERT INTO users(id, email, created_at, updated_at) VALUES (?1, ?1 || '@example.com', 100, 100)",
            params![user_id],
        ));
    }

    fn seed_root_category(store: &VersionedStore, id: &str, user_id: &str, name: &str) {
        must(store.connection().execute(
            "INSERT INTO categories(id, user_id, name, kind, parent_id, display_order, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'EXPENSE', NULL, 0, 100, 100)",
            params![id, user_id, name],
        ));
    }

    fn count(store: &VersionedStore, sql: &str) -> i64 {
        must(store.connection().query_row(sql, [], |row| row.get(0)))
    }

    #[test]
    fn guarded_column_adds_survive_re_execution() {
        let (mut store, _runner) = store_at(2);

        // Re-running the committed 1->2 body must be a no-op, not an error.
        let tx = must(store.conn.transaction());
        must(AddTransactionNotes.apply(&tx));
        must(tx.commit());

        assert!(must(table_has_column(
            store.connection(),
            "transactions",
            "note"
        )));
    }

    #[test]
    fn category_paths_join_parent_and_child_names() {
        let (mut store, runner) = store_at(3);
        seed_user(&store, "u1");
        seed_root_category(&store, "c1", "u1", "Food");
        seed_root_category(&store, "c2", "u1", "Transport");
        must(store.connection().execute(
            "INSERT INTO categories(id, user_id, name, kind, parent_id, display_order, created_at, updated_at)
             VALUES ('c3', 'u1', 'Groceries', 'EXPENSE', 'c1', 0, 100, 100)",
            params![],
        ));

        let _ = must(runner.upgrade(&mut store, 4));

        let groceries_path: String = must(store.connection().query_row(
            "SELECT path FROM categories WHERE id = 'c3'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(groceries_path, "Food/Groceries");

        assert_eq!(
            count(
                &store,
                "SELECT COUNT(*) FROM categories
                 WHERE parent_id IS NULL AND path != name"
            ),
            0
        );
        assert_eq!(
            count(
                &store,
                "SELECT COUNT(*) FROM categories AS child
                 JOIN categories AS parent ON parent.id = child.parent_id
                 WHERE child.path != parent.path || '/' || child.name"
            ),
            0
        );
    }

    #[test]
    fn default_children_appear_once_per_root() {
        let (mut store, runner) = store_at(3);
        seed_user(&store, "u1");
        seed_root_category(&store, "c1", "u1", "Food");
        seed_root_category(&store, "c2", "u1", "Transport");

        let _ = must(runner.upgrade(&mut store, 4));

        let mut stmt = must(store
            .connection()
            .prepare("SELECT path FROM categories WHERE name = 'General' ORDER BY path ASC"));
        let rows = must(stmt.query_map([], |row| row.get::<_, String>(0)));
        let mut paths = Vec::new();
        for row in rows {
            paths.push(must(row));
        }
        assert_eq!(paths, vec!["Food/General", "Transport/General"]);
        drop(stmt);

        // Re-running the backfill inserts nothing further.
        let tx = must(store.conn.transaction());
        let inserted = must(backfill_default_rows(&tx, &default_child_rule()));
        must(tx.commit());
        assert_eq!(inserted, 0);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM categories WHERE name = 'General'"),
            2
        );
    }

    #[test]
    fn every_user_ends_with_exactly_one_active_default_ledger() {
        let (mut store, runner) = store_at(4);
        seed_user(&store, "u1");
        seed_user(&store, "u2");

        let _ = must(runner.upgrade(&mut store, 5));

        assert_eq!(
            count(
                &store,
                "SELECT COUNT(*) FROM users
                 WHERE (SELECT COUNT(*) FROM ledgers
                        WHERE ledgers.user_id = users.id
                          AND ledgers.is_default = 1
                          AND ledgers.is_active = 1) != 1"
            ),
            0
        );

        let tx = must(store.conn.transaction());
        let inserted = must(backfill_default_rows(&tx, &default_ledger_rule()));
        must(tx.commit());
        assert_eq!(inserted, 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM ledgers"), 2);
    }

    #[test]
    fn stale_inactive_default_flags_are_demoted_before_insert() {
        let (mut store, _runner) = store_at(5);
        seed_user(&store, "u9");
        must(store.connection().execute(
            "INSERT INTO ledgers(id, user_id, name, is_default, is_active, display_order, created_at, updated_at)
             VALUES ('stale', 'u9', 'Abandoned', 1, 0, 0, 100, 100)",
            params![],
        ));

        let tx = must(store.conn.transaction());
        let inserted = must(backfill_default_rows(&tx, &default_ledger_rule()));
        must(tx.commit());

        assert_eq!(inserted, 1);
        let stale_flag: i64 = must(store.connection().query_row(
            "SELECT is_default FROM ledgers WHERE id = 'stale'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(stale_flag, 0);
        assert_eq!(
            count(
                &store,
                "SELECT COUNT(*) FROM ledgers
                 WHERE user_id = 'u9' AND is_default = 1 AND is_active = 1"
            ),
            1
        );
    }

    #[test]
    fn association_backfill_links_each_transaction_once() {
        let (mut store, runner) = store_at(4);
        seed_user(&store, "u1");
        must(store.connection().execute(
            "INSERT INTO accounts(id, user_id, name, created_at, updated_at)
             VALUES ('a1', 'u1', 'Cash', 100, 100)",
            params![],
        ));
        must(store.connection().execute(
            "INSERT INTO transactions(id, user_id, account_id, kind, amount_cents, happened_at, created_at, updated_at)
             VALUES ('t1', 'u1', 'a1', 'EXPENSE', -500, 100, 100, 100),
                    ('t2', 'u1', 'a1', 'EXPENSE', -900, 110, 110, 110)",
            params![],
        ));

        let _ = must(runner.upgrade(&mut store, 6));

        let ledger_id: String = must(store.connection().query_row(
            "SELECT id FROM ledgers WHERE user_id = 'u1' AND is_default = 1",
            [],
            |row| row.get(0),
        ));
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM transaction_ledger_links"),
            2
        );
        let link_id: String = must(store.connection().query_row(
            "SELECT id FROM transaction_ledger_links WHERE transaction_id = 't1'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(link_id, format!("t1:{ledger_id}"));

        let tx = must(store.conn.transaction());
        let inserted = must(backfill_associations(&tx, &transaction_ledger_rule()));
        must(tx.commit());
        assert_eq!(inserted, 0);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM transaction_ledger_links"),
            2
        );
    }

    #[test]
    fn links_are_dropped_with_their_transaction() {
        let (mut store, runner) = store_at(4);
        seed_user(&store, "u1");
        must(store.connection().execute(
            "INSERT INTO accounts(id, user_id, name, created_at, updated_at)
             VALUES ('a1', 'u1', 'Cash', 100, 100)",
            params![],
        ));
        must(store.connection().execute(
            "INSERT INTO transactions(id, user_id, account_id, kind, amount_cents, happened_at, created_at, updated_at)
             VALUES ('t1', 'u1', 'a1', 'EXPENSE', -500, 100, 100, 100)",
            params![],
        ));
        let _ = must(runner.upgrade(&mut store, 6));

        must(store
            .connection()
            .execute("DELETE FROM transactions WHERE id = 't1'", []));
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM transaction_ledger_links"),
            0
        );
        assert!(must(table_exists(
            store.connection(),
            "transaction_ledger_links"
        )));
    }
}
