use crate::errors::Result;
use crate::models::{PullRequest, RecordKind};
use crate::schema::{ColumnType, TableSchema};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, Value};
use std::collections::HashMap;

/// A single cell bound into a staging insert.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Vector(Vec<f64>),
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl FieldValue {
    fn text(value: Option<&str>) -> Self {
        value.map_or(FieldValue::Null, |v| FieldValue::Text(v.to_string()))
    }

    fn timestamp(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Timestamp)
    }

    pub fn to_sql_value(&self) -> Result<Value> {
        Ok(match self {
            FieldValue::Null => Value::Null,
            FieldValue::Text(v) => Value::Text(v.clone()),
            FieldValue::Integer(v) => Value::Integer(*v),
            FieldValue::Boolean(v) => Value::Integer(i64::from(*v)),
            FieldValue::Timestamp(v) => Value::Text(format_timestamp(v)),
            FieldValue::Vector(v) => Value::Text(serde_json::to_string(v)?),
        })
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.to_sql_value()
            .map(ToSqlOutput::Owned)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

/// A flat staging row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: HashMap<&'static str, FieldValue>,
}

impl Row {
    fn with(mut self, column: &'static str, value: FieldValue) -> Self {
        self.values.insert(column, value);
        self
    }

    /// Value for `column`, `Null` when unset. Unset vector columns read as `[]`.
    pub fn value(&self, schema: &TableSchema, column: &str) -> FieldValue {
        match self.values.get(column) {
            Some(value) => value.clone(),
            None => match schema.column(column).map(|c| c.ty) {
                Some(ColumnType::Vector) => FieldValue::Vector(Vec::new()),
                _ => FieldValue::Null,
            },
        }
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }
}

/// Embeddings keyed by the record they belong to. Missing entries mean
/// "no embedding" and are stored as an empty vector.
#[derive(Debug, Clone, Default)]
pub struct RecordVectors {
    pub titles: HashMap<u64, Vec<f64>>,
    pub bodies: HashMap<u64, Vec<f64>>,
    pub review_bodies: HashMap<i64, Vec<f64>>,
    pub patches: HashMap<(u64, String), Vec<f64>>,
}

fn vector_for(text: Option<&str>, vector: Option<&Vec<f64>>) -> FieldValue {
    match (text, vector) {
        (Some(text), Some(vector)) if !text.trim().is_empty() => FieldValue::Vector(vector.clone()),
        _ => FieldValue::Vector(Vec::new()),
    }
}

/// Flattens the records into rows of `kind`, children inheriting the
/// parent's `observed_at`.
pub fn rows_for_kind(kind: RecordKind, records: &[PullRequest], vectors: &RecordVectors) -> Vec<Row> {
    match kind {
        RecordKind::PullRequest => records.iter().map(|pr| pull_request_row(pr, vectors)).collect(),
        RecordKind::Review => records
            .iter()
            .flat_map(|pr| {
                pr.reviews.iter().map(move |review| {
                    Row::default()
                        .with("repository", FieldValue::Text(pr.repository.clone()))
                        .with("review_id", FieldValue::Integer(review.id))
                        .with("pr_number", FieldValue::Integer(pr.number as i64))
                        .with(
                            "reviewer",
                            FieldValue::text(review.user.as_ref().map(|u| u.login.as_str())),
                        )
                        .with("state", FieldValue::Text(review.state.as_str().to_string()))
                        .with("body", FieldValue::text(review.body.as_deref()))
                        .with(
                            "body_embedding",
                            vector_for(review.body.as_deref(), vectors.review_bodies.get(&review.id)),
                        )
                        .with("submitted_at", FieldValue::timestamp(review.submitted_at))
                        .with("html_url", FieldValue::Text(review.html_url.clone()))
                        .with("observed_at", FieldValue::Timestamp(pr.observed_at))
                })
            })
            .collect(),
        RecordKind::File => records
            .iter()
            .flat_map(|pr| {
                pr.files.iter().map(move |file| {
                    let patch_vector = vectors.patches.get(&(pr.number, file.filename.clone()));
                    Row::default()
                        .with("repository", FieldValue::Text(pr.repository.clone()))
                        .with("pr_number", FieldValue::Integer(pr.number as i64))
                        .with("filename", FieldValue::Text(file.filename.clone()))
                        .with("status", FieldValue::Text(file.status.clone()))
                        .with("additions", FieldValue::Integer(file.additions))
                        .with("deletions", FieldValue::Integer(file.deletions))
                        .with("changes", FieldValue::Integer(file.changes))
                        .with("patch", FieldValue::text(file.patch.as_deref()))
                        .with("patch_embedding", vector_for(file.patch.as_deref(), patch_vector))
                        .with("patch_truncated", FieldValue::Boolean(file.patch_truncated()))
                        .with("observed_at", FieldValue::Timestamp(pr.observed_at))
                })
            })
            .collect(),
        RecordKind::Label => records
            .iter()
            .flat_map(|pr| {
                pr.labels.iter().map(move |label| {
                    Row::default()
                        .with("repository", FieldValue::Text(pr.repository.clone()))
                        .with("pr_number", FieldValue::Integer(pr.number as i64))
                        .with("label_name", FieldValue::Text(label.name.clone()))
                        .with("label_color", FieldValue::Text(label.color.clone()))
                        .with("label_description", FieldValue::text(label.description.as_deref()))
                        .with("observed_at", FieldValue::Timestamp(pr.observed_at))
                })
            })
            .collect(),
    }
}

fn pull_request_row(pr: &PullRequest, vectors: &RecordVectors) -> Row {
    Row::default()
        .with("repository", FieldValue::Text(pr.repository.clone()))
        .with("number", FieldValue::Integer(pr.number as i64))
        .with("title", FieldValue::Text(pr.title.clone()))
        .with("title_embedding", vector_for(Some(&pr.title), vectors.titles.get(&pr.number)))
        .with("body", FieldValue::text(pr.body.as_deref()))
        .with("body_embedding", vector_for(pr.body.as_deref(), vectors.bodies.get(&pr.number)))
        .with("state", FieldValue::Text(pr.state.as_str().to_string()))
        .with("author", FieldValue::text(pr.author_login()))
        .with("html_url", FieldValue::Text(pr.html_url.clone()))
        .with("created_at", FieldValue::Timestamp(pr.created_at))
        .with("updated_at", FieldValue::Timestamp(pr.updated_at))
        .with("merged_at", FieldValue::timestamp(pr.merged_at))
        .with("closed_at", FieldValue::timestamp(pr.closed_at))
        .with("base_branch", FieldValue::Text(pr.base_branch.clone()))
        .with("head_branch", FieldValue::Text(pr.head_branch.clone()))
        .with("additions", FieldValue::Integer(pr.additions))
        .with("deletions", FieldValue::Integer(pr.deletions))
        .with("changed_files", FieldValue::Integer(pr.changed_files))
        .with("draft", FieldValue::Boolean(pr.draft))
        .with("observed_at", FieldValue::Timestamp(pr.observed_at))
}
