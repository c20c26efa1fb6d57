use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Int16Array, Int32Array, Int64Array, ListBuilder, StringArray,
    StringBuilder, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use deltalake::DeltaOps;
use deltalake::protocol::SaveMode;
use tracing::{debug, info};

use crate::config::DeltaOptions;
use crate::errors::SinkError;
use crate::schema::{Column, TableSchema};
use crate::sink::Sink;
use crate::value::{DataType, Row, Value};

/// Writes each destination to its own Delta table under `table_root`.
///
/// Delta has no unsigned integers, so unsigned columns are widened to the
/// next signed type (`u64` is reinterpreted as `i64`).
pub struct DeltaSink {
    table_root: String,
    storage_options: HashMap<String, String>,
}

impl DeltaSink {
    pub fn new(options: &DeltaOptions) -> Self {
        if options.table_root.starts_with("s3://") || options.table_root.starts_with("s3a://") {
            deltalake::aws::register_handlers(None);
        }
        Self {
            table_root: options.table_root.trim_end_matches('/').to_string(),
            storage_options: options.storage_options.clone().unwrap_or_default(),
        }
    }

    pub fn table_uri(&self, table: &TableSchema) -> String {
        format!("{}/{}", self.table_root, table.destination)
    }

    fn is_local(&self) -> bool {
        !self.table_root.contains("://") || self.table_root.starts_with("file://")
    }
}

#[async_trait]
impl Sink for DeltaSink {
    async fn prepare(&self, table: &TableSchema) -> Result<(), SinkError> {
        // Tables are created on first write; only the root needs to be usable.
        if self.table_root.is_empty() {
            return Err(SinkError::Prepare {
                table: table.table.clone(),
                reason: "empty delta table root".to_string(),
            });
        }
        Ok(())
    }

    async fn write_bulk(&self, table: &TableSchema, rows: &[Row]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = to_record_batch(table, rows)?;
        let uri = self.table_uri(table);

        if self.is_local() {
            let path = uri.trim_start_matches("file://");
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| SinkError::Prepare {
                    table: table.table.clone(),
                    reason: e.to_string(),
                })?;
        }

        let ops = DeltaOps::try_from_uri_with_storage_options(&uri, self.storage_options.clone())
            .await
            .map_err(|e| SinkError::Write {
                table: table.table.clone(),
                reason: format!("failed to open {uri}: {e}"),
            })?;

        ops.write(vec![batch])
            .with_save_mode(SaveMode::Append)
            .await
            .map_err(|e| SinkError::Write {
                table: table.table.clone(),
                reason: e.to_string(),
            })?;

        debug!(destination = %table.destination, rows = rows.len(), uri = %uri, "delta bulk written");
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        info!(table_root = %self.table_root, "delta sink closed");
        Ok(())
    }
}

fn arrow_type(data_type: DataType) -> ArrowDataType {
    match data_type {
        DataType::Boolean => ArrowDataType::Boolean,
        DataType::UInt8 => ArrowDataType::Int16,
        DataType::UInt16 => ArrowDataType::Int32,
        DataType::UInt32 | DataType::UInt64 => ArrowDataType::Int64,
        DataType::Utf8 => ArrowDataType::Utf8,
        DataType::DateTime => ArrowDataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        DataType::Utf8List | DataType::NullableUtf8List => {
            ArrowDataType::List(Arc::new(Field::new("item", ArrowDataType::Utf8, true)))
        }
    }
}

pub fn build_arrow_schema(table: &TableSchema) -> Arc<ArrowSchema> {
    let fields: Vec<Field> = table
        .columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.data_type), c.nullable))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn column_array(column: &Column, index: usize, rows: &[Row]) -> ArrayRef {
    let cells = rows.iter().map(|row| row.get(index).unwrap_or(&Value::Null));
    match column.data_type {
        DataType::Boolean => Arc::new(
            cells
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        DataType::UInt8 => Arc::new(
            cells
                .map(|v| match v {
                    Value::UInt8(n) => Some(i16::from(*n)),
                    _ => None,
                })
                .collect::<Int16Array>(),
        ),
        DataType::UInt16 => Arc::new(
            cells
                .map(|v| match v {
                    Value::UInt16(n) => Some(i32::from(*n)),
                    _ => None,
                })
                .collect::<Int32Array>(),
        ),
        DataType::UInt32 | DataType::UInt64 => Arc::new(
            cells
                .map(|v| match v {
                    Value::UInt32(n) => Some(i64::from(*n)),
                    Value::UInt64(n) => Some(*n as i64),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        DataType::Utf8 => Arc::new(
            cells
                .map(|v| match v {
                    Value::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        DataType::DateTime => Arc::new(
            cells
                .map(|v| match v {
                    Value::DateTime(ts) => Some(ts.timestamp_micros()),
                    _ => None,
                })
                .collect::<TimestampMicrosecondArray>()
                .with_timezone("UTC"),
        ),
        DataType::Utf8List | DataType::NullableUtf8List => {
            let mut builder = ListBuilder::new(StringBuilder::new());
            for cell in cells {
                match cell {
                    Value::StringArray(items) => {
                        for item in items {
                            builder.values().append_value(item);
                        }
                        builder.append(true);
                    }
                    Value::NullableStringArray(items) => {
                        for item in items {
                            builder.values().append_option(item.as_deref());
                        }
                        builder.append(true);
                    }
                    _ => builder.append(false),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

/// Converts buffered rows of one destination into an Arrow `RecordBatch`.
pub fn to_record_batch(table: &TableSchema, rows: &[Row]) -> Result<RecordBatch, SinkError> {
    let schema = build_arrow_schema(table);
    let arrays: Vec<ArrayRef> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| column_array(column, i, rows))
        .collect();
    RecordBatch::try_new(schema, arrays).map_err(|e| SinkError::Conversion {
        table: table.table.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaRegistry, destination};
    use crate::value::datetime;

    fn click(label: &str) -> Row {
        vec![
            Value::UInt64(9),
            Value::UInt16(3),
            Value::UInt64(1),
            datetime(1_700_000_000_000),
            Value::from(label),
            Value::Null,
            Value::from("CLICK"),
        ]
    }

    #[test]
    fn test_record_batch_widens_unsigned_columns() {
        let registry = SchemaRegistry::standard("test");
        let table = registry.get(destination::CLICKS).unwrap();
        let batch = to_record_batch(table, &[click("Buy"), click("Sell")]).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 7);
        assert_eq!(batch.schema().field(1).data_type(), &ArrowDataType::Int32);
        assert_eq!(batch.schema().field(5).data_type(), &ArrowDataType::Int64);
        assert_eq!(batch.column(5).null_count(), 2);
    }

    #[test]
    fn test_record_batch_encodes_tag_lists() {
        let registry = SchemaRegistry::standard("test");
        let table = registry.get(destination::ERRORS).unwrap();
        let row = vec![
            Value::UInt64(9),
            Value::UInt16(3),
            Value::UInt64(1),
            datetime(1_700_000_000_000),
            Value::from("sentry"),
            Value::Null,
            Value::from("boom"),
            Value::from("abc"),
            Value::from("ERROR"),
            Value::StringArray(vec!["env".to_string()]),
            Value::NullableStringArray(vec![None]),
        ];
        let batch = to_record_batch(table, &[row]).unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert!(matches!(
            batch.schema().field(10).data_type(),
            ArrowDataType::List(_)
        ));
    }

    #[tokio::test]
    async fn test_write_to_local_table() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DeltaSink::new(&DeltaOptions {
            table_root: dir.path().to_string_lossy().to_string(),
            storage_options: None,
        });
        let registry = SchemaRegistry::standard("test");
        let table = registry.get(destination::CLICKS).unwrap();

        sink.prepare(table).await.unwrap();
        sink.write_bulk(table, &[click("Buy")]).await.unwrap();
        sink.write_bulk(table, &[click("Sell")]).await.unwrap();

        assert!(dir.path().join("clicks").join("_delta_log").exists());
    }
}
