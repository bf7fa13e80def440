//! Parquet encoding for staged tables.

use crate::staging::StagingError;
use crate::table::Table;
use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;

const CREATED_BY: &str = "strata-pipeline";

/// Column type chosen from the non-missing cells. Mixed or nested cells fall
/// back to text, with nested values written as JSON.
fn infer_type<'a>(values: impl Iterator<Item = &'a Value>) -> DataType {
    let mut inferred: Option<DataType> = None;
    for value in values {
        let candidate = match value {
            Value::Null => continue,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(number) if number.is_i64() => DataType::Int64,
            Value::Number(_) => DataType::Float64,
            _ => return DataType::Utf8,
        };
        inferred = Some(match (inferred, candidate) {
            (None, candidate) => candidate,
            (Some(current), candidate) if current == candidate => current,
            (Some(DataType::Int64), DataType::Float64) | (Some(DataType::Float64), DataType::Int64) => {
                DataType::Float64
            }
            _ => return DataType::Utf8,
        });
    }
    inferred.unwrap_or(DataType::Utf8)
}

fn text_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn build_column(table: &Table, column: &str, data_type: &DataType) -> ArrayRef {
    let values = table.column_values(column);
    match data_type {
        DataType::Boolean => Arc::new(BooleanArray::from(
            values.map(Value::as_bool).collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values.map(Value::as_i64).collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values.map(Value::as_f64).collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(
            values.map(text_cell).collect::<Vec<_>>(),
        )),
    }
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(CREATED_BY.to_string()),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Encodes `table` as a single-row-group Parquet file, columns in table order.
pub fn encode_parquet(table: &Table) -> Result<Bytes, StagingError> {
    let mut fields = Vec::with_capacity(table.columns.len());
    let mut arrays = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        let data_type = infer_type(table.column_values(column));
        arrays.push(build_column(table, column, &data_type));
        fields.push(Field::new(column, data_type, true));
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(Arc::clone(&schema), arrays)
        .map_err(|e| StagingError::Parquet(format!("record batch build failed: {e}")))?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties()))
        .map_err(|e| StagingError::Parquet(format!("parquet writer init failed: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| StagingError::Parquet(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| StagingError::Parquet(format!("parquet close failed: {e}")))?;
    Ok(Bytes::from(cursor.into_inner()))
}
