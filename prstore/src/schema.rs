//! Table layouts for the four record kinds. Every production table has a
//! staging twin with the same columns plus `staging_seq`, `load_id` and
//! `loaded_at`; the natural key is only enforced on the production side.

use crate::models::RecordKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Boolean,
    /// RFC 3339 UTC with microseconds, so text order is time order.
    Timestamp,
    /// JSON array of floats; `[]` when there is no embedding.
    Vector,
}

impl ColumnType {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Vector => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub key: bool,
}

const fn key(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty, key: true }
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty, key: false }
}

/// Version column driving reconciliation.
pub const OBSERVED_AT: &str = "observed_at";

#[derive(Debug)]
pub struct TableSchema {
    pub kind: RecordKind,
    pub table: &'static str,
    pub staging_table: &'static str,
    pub columns: &'static [Column],
}

use ColumnType::*;

pub static PULL_REQUESTS: TableSchema = TableSchema {
    kind: RecordKind::PullRequest,
    table: "pull_requests",
    staging_table: "staging_pull_requests",
    columns: &[
        key("repository", Text),
        key("number", Integer),
        col("title", Text),
        col("title_embedding", Vector),
        col("body", Text),
        col("body_embedding", Vector),
        col("state", Text),
        col("author", Text),
        col("html_url", Text),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("merged_at", Timestamp),
        col("closed_at", Timestamp),
        col("base_branch", Text),
        col("head_branch", Text),
        col("additions", Integer),
        col("deletions", Integer),
        col("changed_files", Integer),
        col("draft", Boolean),
        col(OBSERVED_AT, Timestamp),
    ],
};

pub static REVIEWS: TableSchema = TableSchema {
    kind: RecordKind::Review,
    table: "pr_reviews",
    staging_table: "staging_pr_reviews",
    columns: &[
        key("repository", Text),
        key("review_id", Integer),
        col("pr_number", Integer),
        col("reviewer", Text),
        col("state", Text),
        col("body", Text),
        col("body_embedding", Vector),
        col("submitted_at", Timestamp),
        col("html_url", Text),
        col(OBSERVED_AT, Timestamp),
    ],
};

pub static FILES: TableSchema = TableSchema {
    kind: RecordKind::File,
    table: "pr_files",
    staging_table: "staging_pr_files",
    columns: &[
        key("repository", Text),
        key("pr_number", Integer),
        key("filename", Text),
        col("status", Text),
        col("additions", Integer),
        col("deletions", Integer),
        col("changes", Integer),
        col("patch", Text),
        col("patch_embedding", Vector),
        col("patch_truncated", Boolean),
        col(OBSERVED_AT, Timestamp),
    ],
};

pub static LABELS: TableSchema = TableSchema {
    kind: RecordKind::Label,
    table: "pr_labels",
    staging_table: "staging_pr_labels",
    columns: &[
        key("repository", Text),
        key("pr_number", Integer),
        key("label_name", Text),
        col("label_color", Text),
        col("label_description", Text),
        col(OBSERVED_AT, Timestamp),
    ],
};

impl TableSchema {
    pub fn for_kind(kind: RecordKind) -> &'static TableSchema {
        match kind {
            RecordKind::PullRequest => &PULL_REQUESTS,
            RecordKind::Review => &REVIEWS,
            RecordKind::File => &FILES,
            RecordKind::Label => &LABELS,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.key)
    }

    pub fn mutable_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.key)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn key_names(&self) -> Vec<&'static str> {
        self.key_columns().map(|c| c.name).collect()
    }

    fn column_defs(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| match (c.ty, c.key) {
                (Vector, _) => format!("{} TEXT NOT NULL DEFAULT '[]'", c.name),
                (_, true) => format!("{} {} NOT NULL", c.name, c.ty.sql_type()),
                (_, false) if c.name == OBSERVED_AT => format!("{} TEXT NOT NULL", c.name),
                (ty, false) => format!("{} {}", c.name, ty.sql_type()),
            })
            .collect()
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {},\n    PRIMARY KEY ({})\n);",
            self.table,
            self.column_defs().join(",\n    "),
            self.key_names().join(", ")
        )
    }

    pub fn create_staging_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {staging} (\n    staging_seq INTEGER PRIMARY KEY AUTOINCREMENT,\n    load_id TEXT NOT NULL,\n    loaded_at TEXT NOT NULL,\n    {cols}\n);\nCREATE INDEX IF NOT EXISTS idx_{staging}_repository ON {staging} (repository);\nCREATE INDEX IF NOT EXISTS idx_{staging}_loaded_at ON {staging} (loaded_at);",
            staging = self.staging_table,
            cols = self.column_defs().join(",\n    "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_keys_and_a_version_column() {
        for kind in RecordKind::ALL {
            let schema = TableSchema::for_kind(kind);
            assert_eq!(schema.kind, kind);
            assert_eq!(schema.key_names()[0], "repository");
            assert!(schema.column(OBSERVED_AT).is_some());
            assert!(schema.mutable_columns().any(|c| c.name == OBSERVED_AT));
        }
    }

    #[test]
    fn ddl_declares_natural_key() {
        let sql = FILES.create_table_sql();
        assert!(sql.contains("PRIMARY KEY (repository, pr_number, filename)"));
        assert!(sql.contains("patch_embedding TEXT NOT NULL DEFAULT '[]'"));
        let staging = FILES.create_staging_sql();
        assert!(staging.contains("staging_seq INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!staging.contains("PRIMARY KEY (repository"));
    }
}
