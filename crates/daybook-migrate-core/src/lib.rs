use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version of record for the on-disk schema. A fresh store is version 0.
pub type SchemaVersion = u32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("a migration step is already registered for version {0}")]
    DuplicateVersion(SchemaVersion),
    #[error("invalid migration step: {0}")]
    InvalidStep(String),
    #[error("no migration step registered from version {0}")]
    Gap(SchemaVersion),
    #[error("store is at version {current}; refusing to downgrade to {target}")]
    Downgrade {
        current: SchemaVersion,
        target: SchemaVersion,
    },
    #[error("step {from}->{to} failed: {detail}")]
    StepExecution {
        from: SchemaVersion,
        to: SchemaVersion,
        detail: String,
    },
    #[error("step {from}->{to} applied but recording version {to} failed: {detail}")]
    VersionWrite {
        from: SchemaVersion,
        to: SchemaVersion,
        detail: String,
    },
    #[error("store error: {0}")]
    Store(String),
}

/// Version metadata every migration step exposes.
///
/// Steps always advance the schema by exactly one version; the registry
/// rejects anything else.
pub trait StepMeta {
    fn from_version(&self) -> SchemaVersion;

    fn to_version(&self) -> SchemaVersion {
        self.from_version() + 1
    }

    fn summary(&self) -> &str;
}

impl<S: StepMeta + ?Sized> StepMeta for Box<S> {
    fn from_version(&self) -> SchemaVersion {
        self.as_ref().from_version()
    }

    fn to_version(&self) -> SchemaVersion {
        self.as_ref().to_version()
    }

    fn summary(&self) -> &str {
        self.as_ref().summary()
    }
}

/// Ordered collection of migration steps keyed by `from_version`.
#[derive(Debug)]
pub struct MigrationRegistry<S> {
    steps: BTreeMap<SchemaVersion, S>,
}

impl<S> Default for MigrationRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MigrationRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Registered steps in ascending `from_version` order.
    pub fn steps(&self) -> impl Iterator<Item = &S> {
        self.steps.values()
    }
}

impl<S: StepMeta> MigrationRegistry<S> {
    /// Adds a step to the registry.
    ///
    /// # Errors
    /// Returns [`MigrationError::DuplicateVersion`] when a step for the same
    /// `from_version` exists, and [`MigrationError::InvalidStep`] when the
    /// step does not advance the version by exactly one.
    pub fn register(&mut self, step: S) -> Result<(), MigrationError> {
        let from = step.from_version();
        if step.to_version() != from + 1 {
            return Err(MigrationError::InvalidStep(format!(
                "step from version {from} MUST target version {}, got {}",
                from + 1,
                step.to_version()
            )));
        }

        if self.steps.contains_key(&from) {
            return Err(MigrationError::DuplicateVersion(from));
        }

        self.steps.insert(from, step);
        Ok(())
    }

    /// Highest `to_version` reachable through the registry; 0 when empty.
    #[must_use]
    pub fn latest_version(&self) -> SchemaVersion {
        self.steps
            .keys()
            .next_back()
            .map_or(0, |from_version| from_version + 1)
    }

    /// Plans the ordered chain of steps taking `current` to `target`.
    ///
    /// # Errors
    /// Returns [`MigrationError::Downgrade`] when `current > target` and
    /// [`MigrationError::Gap`] naming the first version in
    /// `[current, target)` with no registered step.
    pub fn chain_from(
        &self,
        current: SchemaVersion,
        target: SchemaVersion,
    ) -> Result<Vec<&S>, MigrationError> {
        if current > target {
            return Err(MigrationError::Downgrade { current, target });
        }

        let mut chain = Vec::new();
        for version in current..target {
            let step = self.steps.get(&version).ok_or(MigrationError::Gap(version))?;
            chain.push(step);
        }

        Ok(chain)
    }
}

/// How one column of a rebuilt table is populated at copy time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSource {
    /// Copy the value from this column of the original table.
    Copy(String),
    /// Evaluate this SQL expression against each original row.
    Derived(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    /// Column type and constraints, e.g. `TEXT NOT NULL DEFAULT 'EXPENSE'`.
    pub definition: String,
    pub source: ColumnSource,
}

impl ColumnSpec {
    #[must_use]
    pub fn copied(name: &str, definition: &str) -> Self {
        Self {
            name: name.to_string(),
            definition: definition.to_string(),
            source: ColumnSource::Copy(name.to_string()),
        }
    }

    #[must_use]
    pub fn derived(name: &str, definition: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            definition: definition.to_string(),
            source: ColumnSource::Derived(expression.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ForeignKeySpec {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: Option<String>,
}

impl ForeignKeySpec {
    #[must_use]
    pub fn new(column: &str, references_table: &str, references_column: &str) -> Self {
        Self {
            column: column.to_string(),
            references_table: references_table.to_string(),
            references_column: references_column.to_string(),
            on_delete: None,
        }
    }

    #[must_use]
    pub fn on_delete(mut self, action: &str) -> Self {
        self.on_delete = Some(action.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    #[must_use]
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(ToString::to_string).collect(),
            unique: false,
        }
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

const FOREIGN_KEY_ACTIONS: [&str; 5] =
    ["CASCADE", "SET NULL", "SET DEFAULT", "RESTRICT", "NO ACTION"];

/// Desired end state of a table whose schema change SQLite cannot apply in
/// place (new foreign key, new NOT NULL, changed layout).
///
/// Renders the full shadow-table script: create the shadow, copy every row
/// with an explicit column list, drop the original, rename the shadow, and
/// recreate the complete index set. The script is meant to run inside the
/// enclosing step's transaction; every DDL statement carries an
/// `IF [NOT] EXISTS` guard so re-executing a crashed-and-retried boundary
/// step does not itself error.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RebuildSpec {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub foreign_keys: Vec<ForeignKeySpec>,
    pub indexes: Vec<IndexSpec>,
}

impl RebuildSpec {
    /// Validates every identifier and cross-reference in the rebuild description.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] for bad identifiers, duplicate
    /// or missing columns, unknown foreign-key actions, or empty derivations.
    pub fn validate(&self) -> Result<(), MigrationError> {
        validate_identifier("table", &self.table)?;

        if self.columns.is_empty() {
            return Err(MigrationError::InvalidStep(format!(
                "rebuild of {} MUST declare at least one column",
                self.table
            )));
        }

        let mut seen = Vec::new();
        for column in &self.columns {
            validate_identifier("column", &column.name)?;
            if column.definition.trim().is_empty() {
                return Err(MigrationError::InvalidStep(format!(
                    "column {} has an empty definition",
                    column.name
                )));
            }
            if seen.contains(&column.name.as_str()) {
                return Err(MigrationError::InvalidStep(format!(
                    "column {} declared twice",
                    column.name
                )));
            }
            seen.push(column.name.as_str());

            match &column.source {
                ColumnSource::Copy(source) => validate_identifier("source column", source)?,
                ColumnSource::Derived(expression) => {
                    if expression.trim().is_empty() {
                        return Err(MigrationError::InvalidStep(format!(
                            "column {} has an empty derivation expression",
                            column.name
                        )));
                    }
                }
            }
        }

        for foreign_key in &self.foreign_keys {
            validate_identifier("foreign key column", &foreign_key.column)?;
            validate_identifier("referenced table", &foreign_key.references_table)?;
            validate_identifier("referenced column", &foreign_key.references_column)?;
            if !seen.contains(&foreign_key.column.as_str()) {
                return Err(MigrationError::InvalidStep(format!(
                    "foreign key column {} is not declared in the rebuilt table",
                    foreign_key.column
                )));
            }
            if let Some(action) = &foreign_key.on_delete {
                if !FOREIGN_KEY_ACTIONS.contains(&action.as_str()) {
                    return Err(MigrationError::InvalidStep(format!(
                        "unknown ON DELETE action: {action}"
                    )));
                }
            }
        }

        for index in &self.indexes {
            validate_identifier("index", &index.name)?;
            if index.columns.is_empty() {
                return Err(MigrationError::InvalidStep(format!(
                    "index {} MUST cover at least one column",
                    index.name
                )));
            }
            for column in &index.columns {
                validate_identifier("index column", column)?;
                if !seen.contains(&column.as_str()) {
                    return Err(MigrationError::InvalidStep(format!(
                        "index {} covers unknown column {column}",
                        index.name
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn shadow_table(&self) -> String {
        format!("{}_new", self.table)
    }

    fn create_shadow_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|column| format!("{} {}", column.name, column.definition))
            .collect();

        for foreign_key in &self.foreign_keys {
            let mut clause = format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                foreign_key.column, foreign_key.references_table, foreign_key.references_column
            );
            if let Some(action) = &foreign_key.on_delete {
                clause.push_str(" ON DELETE ");
                clause.push_str(action);
            }
            parts.push(clause);
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            self.shadow_table(),
            parts.join(",\n  ")
        )
    }

    fn copy_sql(&self) -> String {
        let names: Vec<&str> = self
            .columns
            .iter()
            .map(|column| column.name.as_str())
            .collect();
        let sources: Vec<&str> = self
            .columns
            .iter()
            .map(|column| match &column.source {
                ColumnSource::Copy(source) => source.as_str(),
                ColumnSource::Derived(expression) => expression.as_str(),
            })
            .collect();

        format!(
            "INSERT INTO {} ({})\nSELECT {}\nFROM {}",
            self.shadow_table(),
            names.join(", "),
            sources.join(", "),
            self.table
        )
    }

    fn index_sql(&self, index: &IndexSpec) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            index.name,
            self.table,
            index.columns.join(", ")
        )
    }

    /// The ordered rebuild script.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] when the description fails
    /// [`RebuildSpec::validate`].
    pub fn statements(&self) -> Result<Vec<String>, MigrationError> {
        self.validate()?;

        let mut statements = vec![
            self.create_shadow_sql(),
            self.copy_sql(),
            format!("DROP TABLE IF EXISTS {}", self.table),
            format!("ALTER TABLE {} RENAME TO {}", self.shadow_table(), self.table),
        ];
        for index in &self.indexes {
            statements.push(self.index_sql(index));
        }

        Ok(statements)
    }
}

/// Derives materialized tree paths for a two-level hierarchy: roots get
/// `path = name`, children get `path = parent.path || separator || name`.
///
/// The single child pass is only correct because tree depth is bounded at
/// two levels; deeper trees would need level-by-level propagation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PathBackfill {
    pub table: String,
    pub id_column: String,
    pub parent_column: String,
    pub name_column: String,
    pub path_column: String,
    pub separator: String,
}

impl PathBackfill {
    /// Validates the rule's identifiers.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] for bad identifiers or an
    /// empty separator.
    pub fn validate(&self) -> Result<(), MigrationError> {
        validate_identifier("table", &self.table)?;
        validate_identifier("id column", &self.id_column)?;
        validate_identifier("parent column", &self.parent_column)?;
        validate_identifier("name column", &self.name_column)?;
        validate_identifier("path column", &self.path_column)?;
        if self.separator.is_empty() {
            return Err(MigrationError::InvalidStep(
                "path separator MUST NOT be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn root_sql(&self) -> String {
        format!(
            "UPDATE {table} SET {path} = {name} WHERE {parent} IS NULL",
            table = self.table,
            path = self.path_column,
            name = self.name_column,
            parent = self.parent_column
        )
    }

    fn child_sql(&self) -> String {
        format!(
            "UPDATE {table} SET {path} = (SELECT parent.{path} || {separator} || {table}.{name} \
             FROM {table} AS parent WHERE parent.{id} = {table}.{parent}) \
             WHERE {parent} IS NOT NULL",
            table = self.table,
            path = self.path_column,
            name = self.name_column,
            id = self.id_column,
            parent = self.parent_column,
            separator = sql_string_literal(&self.separator)
        )
    }

    /// The root pass followed by the child pass; order is load-bearing.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] when the rule fails
    /// [`PathBackfill::validate`].
    pub fn statements(&self) -> Result<Vec<String>, MigrationError> {
        self.validate()?;
        Ok(vec![self.root_sql(), self.child_sql()])
    }
}

/// Guarantees every owner exactly one default row.
///
/// `missing_owners_sql` is the anti-join yielding one owner id per row for
/// every owner lacking a default. Per owner, the executor first runs
/// `demote_sql` (binding `?1` to the owner id) to clear stray default flags
/// left by a partial run, then `insert_sql` (binding `?1` to a freshly
/// generated row id and `?2` to the owner id). Re-running the whole rule
/// when every owner already has a default is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DefaultRowRule {
    pub missing_owners_sql: String,
    pub demote_sql: Option<String>,
    pub insert_sql: String,
}

impl DefaultRowRule {
    /// Validates the statement triplet and its placeholder contract.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] for blank statements or
    /// missing `?1`/`?2` placeholders.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.missing_owners_sql.trim().is_empty() {
            return Err(MigrationError::InvalidStep(
                "missing_owners_sql MUST NOT be blank".to_string(),
            ));
        }
        if !self.insert_sql.contains("?1") || !self.insert_sql.contains("?2") {
            return Err(MigrationError::InvalidStep(
                "insert_sql MUST bind ?1 (new row id) and ?2 (owner id)".to_string(),
            ));
        }
        if let Some(demote) = &self.demote_sql {
            if !demote.contains("?1") {
                return Err(MigrationError::InvalidStep(
                    "demote_sql MUST bind ?1 (owner id)".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Synthesizes link rows for a relation that existing rows already imply
/// through a foreign-key column.
///
/// The link id is derived as `source_id || ':' || source_ref`, so the
/// rendered `INSERT OR IGNORE` is idempotent under re-execution.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssociationRule {
    pub link_table: String,
    pub id_column: String,
    pub left_column: String,
    pub right_column: String,
    pub source_table: String,
    pub source_id_column: String,
    pub source_ref_column: String,
    /// Extra `(link column, SQL expression)` pairs evaluated per source row.
    pub extra_columns: Vec<(String, String)>,
}

impl AssociationRule {
    /// Validates the rule's identifiers and extra-column expressions.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] for bad identifiers or empty
    /// expressions.
    pub fn validate(&self) -> Result<(), MigrationError> {
        validate_identifier("link table", &self.link_table)?;
        validate_identifier("link id column", &self.id_column)?;
        validate_identifier("left column", &self.left_column)?;
        validate_identifier("right column", &self.right_column)?;
        validate_identifier("source table", &self.source_table)?;
        validate_identifier("source id column", &self.source_id_column)?;
        validate_identifier("source ref column", &self.source_ref_column)?;
        for (column, expression) in &self.extra_columns {
            validate_identifier("extra column", column)?;
            if expression.trim().is_empty() {
                return Err(MigrationError::InvalidStep(format!(
                    "extra column {column} has an empty expression"
                )));
            }
        }
        Ok(())
    }

    /// The idempotent link-synthesis statement.
    ///
    /// # Errors
    /// Returns [`MigrationError::InvalidStep`] when the rule fails
    /// [`AssociationRule::validate`].
    pub fn insert_sql(&self) -> Result<String, MigrationError> {
        self.validate()?;

        let mut columns = vec![
            self.id_column.clone(),
            self.left_column.clone(),
            self.right_column.clone(),
        ];
        let mut selects = vec![
            format!(
                "{src}.{id} || ':' || {src}.{reference}",
                src = self.source_table,
                id = self.source_id_column,
                reference = self.source_ref_column
            ),
            format!("{}.{}", self.source_table, self.source_id_column),
            format!("{}.{}", self.source_table, self.source_ref_column),
        ];
        for (column, expression) in &self.extra_columns {
            columns.push(column.clone());
            selects.push(expression.clone());
        }

        Ok(format!(
            "INSERT OR IGNORE INTO {link} ({columns})\nSELECT {selects}\nFROM {src}\nWHERE {src}.{reference} IS NOT NULL",
            link = self.link_table,
            columns = columns.join(", "),
            selects = selects.join(", "),
            src = self.source_table,
            reference = self.source_ref_column
        ))
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_identifier(kind: &str, name: &str) -> Result<(), MigrationError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(MigrationError::InvalidStep(format!(
            "{kind} name {name:?} is not a valid SQL identifier"
        )))
    }
}

fn sql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
