//! Destination registry: the fixed table of destination name to column
//! schema and insert template, built once at startup and shared by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ConfigError;
use crate::value::DataType;

/// Free-text columns are cut to this many bytes before they reach the store.
pub const MAX_STRING_BYTES: usize = 8000;

pub mod destination {
    pub const SESSIONS: &str = "sessions";
    pub const RESOURCES: &str = "resources";
    pub const AUTOCOMPLETES: &str = "autocompletes";
    pub const PAGES: &str = "pages";
    pub const CLICKS: &str = "clicks";
    pub const INPUTS: &str = "inputs";
    pub const ERRORS: &str = "errors";
    pub const PERFORMANCE: &str = "performance";
    pub const REQUESTS: &str = "requests";
    pub const CUSTOM: &str = "custom";
    pub const GRAPHQL: &str = "graphql";
    pub const ISSUE_EVENTS: &str = "issuesEvents";
    pub const ISSUES: &str = "issues";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Byte budget for string columns; longer values are truncated.
    pub max_bytes: Option<usize>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            max_bytes: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn max_bytes(mut self, budget: usize) -> Self {
        self.max_bytes = Some(budget);
        self
    }
}

/// Column layout and target table of one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub destination: String,
    /// Fully qualified target table, e.g. `experimental.events`.
    pub table: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(destination: impl Into<String>, table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            destination: destination.into(),
            table: table.into(),
            columns,
        }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Parameterised bulk insert statement for SQL-speaking stores.
    pub fn insert_template(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let params: Vec<String> = self
            .columns
            .iter()
            .map(|c| match c.max_bytes {
                Some(budget) => format!("SUBSTR(?, 1, {budget})"),
                None => "?".to_string(),
            })
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            names.join(", "),
            params.join(", ")
        )
    }
}

/// Immutable destination table. Order is preserved for log attribution.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: Vec<Arc<TableSchema>>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new(tables: Vec<TableSchema>) -> Result<Self, ConfigError> {
        if tables.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "at least one destination must be registered".to_string(),
            });
        }
        let mut index = HashMap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            if table.columns.is_empty() {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("destination {} has no columns", table.destination),
                });
            }
            if index.insert(table.destination.clone(), i).is_some() {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate destination {}", table.destination),
                });
            }
        }
        Ok(Self {
            tables: tables.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    pub fn get(&self, destination: &str) -> Option<&Arc<TableSchema>> {
        self.index.get(destination).map(|&i| &self.tables[i])
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.iter()
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.destination.as_str())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Replaces the byte budget of every budgeted column.
    pub fn with_string_budget(self, budget: usize) -> Self {
        let tables = self
            .tables
            .into_iter()
            .map(|table| {
                let mut table = Arc::unwrap_or_clone(table);
                for column in &mut table.columns {
                    if column.max_bytes.is_some() {
                        column.max_bytes = Some(budget);
                    }
                }
                Arc::new(table)
            })
            .collect();
        Self {
            tables,
            index: self.index,
        }
    }

    /// The thirteen session-replay destinations under `namespace`.
    pub fn standard(namespace: &str) -> Self {
        let tables = standard_tables(namespace);
        let index = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.destination.clone(), i))
            .collect();
        Self {
            tables: tables.into_iter().map(Arc::new).collect(),
            index,
        }
    }
}

fn event_head() -> Vec<Column> {
    vec![
        Column::new("session_id", DataType::UInt64),
        Column::new("project_id", DataType::UInt16),
        Column::new("message_id", DataType::UInt64),
        Column::new("datetime", DataType::DateTime),
    ]
}

fn with_head(tail: Vec<Column>) -> Vec<Column> {
    let mut columns = event_head();
    columns.extend(tail);
    columns
}

fn text(name: &str) -> Column {
    Column::new(name, DataType::Utf8)
}

fn budget_text(name: &str) -> Column {
    text(name).max_bytes(MAX_STRING_BYTES)
}

fn timing(name: &str) -> Column {
    Column::new(name, DataType::UInt16).nullable()
}

fn standard_tables(ns: &str) -> Vec<TableSchema> {
    use destination::*;

    let sessions = {
        let mut columns = vec![
            Column::new("session_id", DataType::UInt64),
            Column::new("project_id", DataType::UInt16),
            budget_text("user_id").nullable(),
            text("user_uuid"),
            text("user_os"),
            text("user_os_version").nullable(),
            text("user_device").nullable(),
            text("user_device_type"),
            text("user_country"),
            Column::new("datetime", DataType::DateTime),
            Column::new("duration", DataType::UInt32),
            Column::new("pages_count", DataType::UInt16),
            Column::new("events_count", DataType::UInt16),
            Column::new("errors_count", DataType::UInt16),
            Column::new("issue_score", DataType::UInt32),
            budget_text("referrer").nullable(),
            Column::new("issue_types", DataType::Utf8List),
            text("tracker_version"),
            text("user_browser"),
            text("user_browser_version").nullable(),
        ];
        columns.extend((1..=10).map(|i| budget_text(&format!("metadata_{i}")).nullable()));
        columns
    };

    let pages = {
        let mut columns = event_head();
        columns.push(text("url"));
        columns.extend(
            [
                "request_start",
                "response_start",
                "response_end",
                "dom_content_loaded_event_start",
                "dom_content_loaded_event_end",
                "load_event_start",
                "load_event_end",
                "first_paint",
                "first_contentful_paint_time",
                "speed_index",
                "visually_complete",
                "time_to_interactive",
            ]
            .into_iter()
            .map(timing),
        );
        columns.push(text("event_type"));
        columns
    };

    let performance = {
        let mut columns = event_head();
        columns.push(budget_text("url").nullable());
        columns.extend(
            ["min_fps", "avg_fps", "max_fps", "min_cpu", "avg_cpu", "max_cpu"]
                .into_iter()
                .map(|n| Column::new(n, DataType::UInt8)),
        );
        columns.extend(
            [
                "min_total_js_heap_size",
                "avg_total_js_heap_size",
                "max_total_js_heap_size",
                "min_used_js_heap_size",
                "avg_used_js_heap_size",
                "max_used_js_heap_size",
            ]
            .into_iter()
            .map(|n| Column::new(n, DataType::UInt64)),
        );
        columns.push(text("event_type"));
        columns
    };

    let events = format!("{ns}.events");
    vec![
        TableSchema::new(SESSIONS, format!("{ns}.sessions"), sessions),
        TableSchema::new(
            RESOURCES,
            format!("{ns}.resources"),
            with_head(vec![
                budget_text("url"),
                text("type"),
                timing("duration"),
                timing("ttfb"),
                timing("header_size"),
                Column::new("encoded_body_size", DataType::UInt32).nullable(),
                Column::new("decoded_body_size", DataType::UInt32).nullable(),
                Column::new("success", DataType::Boolean),
            ]),
        ),
        TableSchema::new(
            AUTOCOMPLETES,
            format!("{ns}.autocomplete"),
            vec![
                Column::new("project_id", DataType::UInt16),
                text("type"),
                text("value"),
            ],
        ),
        TableSchema::new(PAGES, events.clone(), pages),
        TableSchema::new(
            CLICKS,
            events.clone(),
            with_head(vec![
                text("label"),
                Column::new("hesitation_time", DataType::UInt32).nullable(),
                text("event_type"),
            ]),
        ),
        TableSchema::new(
            INPUTS,
            events.clone(),
            with_head(vec![text("label"), text("event_type")]),
        ),
        TableSchema::new(
            ERRORS,
            events.clone(),
            with_head(vec![
                text("source"),
                text("name").nullable(),
                text("message"),
                text("error_id"),
                text("event_type"),
                Column::new("error_tags_keys", DataType::Utf8List),
                Column::new("error_tags_values", DataType::NullableUtf8List),
            ]),
        ),
        TableSchema::new(PERFORMANCE, events.clone(), performance),
        TableSchema::new(
            REQUESTS,
            events.clone(),
            with_head(vec![
                budget_text("url"),
                text("request_body").nullable(),
                text("response_body").nullable(),
                Column::new("status", DataType::UInt16),
                text("method"),
                Column::new("duration", DataType::UInt16),
                Column::new("success", DataType::Boolean),
                text("event_type"),
            ]),
        ),
        TableSchema::new(
            CUSTOM,
            events.clone(),
            with_head(vec![text("name"), text("payload"), text("event_type")]),
        ),
        TableSchema::new(
            GRAPHQL,
            events.clone(),
            with_head(vec![
                text("name"),
                text("request_body").nullable(),
                text("response_body").nullable(),
                text("event_type"),
            ]),
        ),
        TableSchema::new(
            ISSUE_EVENTS,
            events,
            with_head(vec![
                text("issue_id"),
                text("issue_type"),
                text("event_type"),
                text("url"),
            ]),
        ),
        TableSchema::new(
            ISSUES,
            format!("{ns}.issues"),
            vec![
                Column::new("project_id", DataType::UInt16),
                text("issue_id"),
                text("type"),
                text("context_string"),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_all_destinations() {
        let registry = SchemaRegistry::standard("experimental");
        assert_eq!(registry.len(), 13);
        assert_eq!(registry.get(destination::SESSIONS).unwrap().arity(), 30);
        assert_eq!(registry.get(destination::PAGES).unwrap().arity(), 18);
        assert_eq!(registry.get(destination::PERFORMANCE).unwrap().arity(), 18);
        assert_eq!(registry.get(destination::REQUESTS).unwrap().arity(), 12);
        assert_eq!(registry.get(destination::ISSUES).unwrap().arity(), 4);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_insert_template_wraps_budgeted_columns() {
        let registry = SchemaRegistry::standard("experimental");
        let template = registry.get(destination::RESOURCES).unwrap().insert_template();
        assert!(template.starts_with("INSERT INTO experimental.resources (session_id, project_id"));
        assert!(template.contains("?, ?, ?, ?, SUBSTR(?, 1, 8000), ?"));

        let template = registry.get(destination::CLICKS).unwrap().insert_template();
        assert_eq!(
            template,
            "INSERT INTO experimental.events (session_id, project_id, message_id, datetime, label, hesitation_time, event_type) VALUES (?, ?, ?, ?, ?, ?, ?)"
        );
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let table = TableSchema::new("a", "db.a", vec![Column::new("x", DataType::UInt8)]);
        let err = SchemaRegistry::new(vec![table.clone(), table]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(SchemaRegistry::new(vec![]).is_err());
    }
}
