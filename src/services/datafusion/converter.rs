// DataFusion ResultConverter
//
// Converts between Arrow record batches and the JSON objects rows travel as.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;

macro_rules! primitive_value {
    ($array:expr, $row_idx:expr, $ty:ty) => {{
        let array = $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| anyhow!("Failed to downcast to {}", stringify!($ty)))?;
        json!(array.value($row_idx))
    }};
}

pub struct DataFusionResultConverter;

impl DataFusionResultConverter {
    /// Convert a RecordBatch into one JSON object per row, keyed by column name
    pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Map<String, JsonValue>>> {
        let schema = batch.schema();
        let mut rows = Vec::with_capacity(batch.num_rows());

        for row_idx in 0..batch.num_rows() {
            let mut row = Map::with_capacity(batch.num_columns());
            for (col_idx, field) in schema.fields().iter().enumerate() {
                let value = Self::array_value_to_json(batch.column(col_idx), row_idx, field.data_type())?;
                row.insert(field.name().clone(), value);
            }
            rows.push(row);
        }

        Ok(rows)
    }

    /// Build a RecordBatch from JSON objects.
    ///
    /// Column types are inferred over every row: integers stay Int64 unless some row
    /// holds a fraction, mixed or nested values fall back to strings.
    pub fn rows_to_batch(rows: &[JsonValue]) -> Result<RecordBatch> {
        let mut columns: Vec<(String, DataType)> = Vec::new();
        for row in rows {
            let obj = row
                .as_object()
                .ok_or_else(|| anyhow!("Expected JSON object, found {}", row))?;
            for (key, value) in obj {
                let observed = match value {
                    JsonValue::Null => continue,
                    JsonValue::Bool(_) => DataType::Boolean,
                    JsonValue::Number(n) if n.is_i64() => DataType::Int64,
                    JsonValue::Number(_) => DataType::Float64,
                    _ => DataType::Utf8,
                };
                match columns.iter_mut().find(|(name, _)| name == key) {
                    Some((_, current)) => *current = Self::widen(current, &observed),
                    None => columns.push((key.clone(), observed)),
                }
            }
        }

        let schema = Arc::new(Schema::new(
            columns
                .iter()
                .map(|(name, data_type)| Field::new(name, data_type.clone(), true))
                .collect::<Vec<_>>(),
        ));

        let arrays: Vec<ArrayRef> = columns
            .iter()
            .map(|(name, data_type)| -> ArrayRef {
                let cells = rows.iter().map(|row| row.get(name).filter(|v| !v.is_null()));
                match data_type {
                    DataType::Boolean => {
                        Arc::new(cells.map(|v| v.and_then(|v| v.as_bool())).collect::<BooleanArray>())
                    }
                    DataType::Int64 => {
                        Arc::new(cells.map(|v| v.and_then(|v| v.as_i64())).collect::<Int64Array>())
                    }
                    DataType::Float64 => {
                        Arc::new(cells.map(|v| v.and_then(|v| v.as_f64())).collect::<Float64Array>())
                    }
                    _ => Arc::new(
                        cells
                            .map(|v| {
                                v.map(|v| match v {
                                    JsonValue::String(s) => s.clone(),
                                    other => other.to_string(),
                                })
                            })
                            .collect::<StringArray>(),
                    ),
                }
            })
            .collect();

        if arrays.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }
        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn widen(current: &DataType, observed: &DataType) -> DataType {
        match (current, observed) {
            (a, b) if a == b => a.clone(),
            (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
                DataType::Float64
            }
            _ => DataType::Utf8,
        }
    }

    /// Convert a single array value to JSON
    fn array_value_to_json(array: &ArrayRef, row_idx: usize, data_type: &DataType) -> Result<JsonValue> {
        if array.is_null(row_idx) {
            return Ok(JsonValue::Null);
        }

        let value = match data_type {
            DataType::Boolean => primitive_value!(array, row_idx, BooleanArray),
            DataType::Int8 => primitive_value!(array, row_idx, Int8Array),
            DataType::Int16 => primitive_value!(array, row_idx, Int16Array),
            DataType::Int32 => primitive_value!(array, row_idx, Int32Array),
            DataType::Int64 => primitive_value!(array, row_idx, Int64Array),
            DataType::UInt8 => primitive_value!(array, row_idx, UInt8Array),
            DataType::UInt16 => primitive_value!(array, row_idx, UInt16Array),
            DataType::UInt32 => primitive_value!(array, row_idx, UInt32Array),
            DataType::UInt64 => primitive_value!(array, row_idx, UInt64Array),
            DataType::Float32 => primitive_value!(array, row_idx, Float32Array),
            DataType::Float64 => primitive_value!(array, row_idx, Float64Array),
            DataType::Utf8 => primitive_value!(array, row_idx, StringArray),
            DataType::LargeUtf8 => primitive_value!(array, row_idx, LargeStringArray),
            DataType::Utf8View => primitive_value!(array, row_idx, StringViewArray),

            // Decimals travel as JSON numbers
            DataType::Decimal128(_, _) => {
                let text = array_value_to_string(array, row_idx)?;
                text.parse::<f64>().map(|v| json!(v)).unwrap_or_else(|_| json!(text))
            }

            DataType::Date32 => {
                let array = array
                    .as_any()
                    .downcast_ref::<Date32Array>()
                    .ok_or_else(|| anyhow!("Failed to downcast to Date32Array"))?;
                // Date32 counts days since the Unix epoch
                let date = NaiveDate::from_num_days_from_ce_opt(array.value(row_idx) + 719_163)
                    .ok_or_else(|| anyhow!("Invalid date value"))?;
                json!(date.format("%Y-%m-%d").to_string())
            }
            DataType::Date64 => {
                let array = array
                    .as_any()
                    .downcast_ref::<Date64Array>()
                    .ok_or_else(|| anyhow!("Failed to downcast to Date64Array"))?;
                let datetime = DateTime::from_timestamp_millis(array.value(row_idx))
                    .ok_or_else(|| anyhow!("Invalid timestamp value"))?;
                json!(datetime.format("%Y-%m-%d").to_string())
            }
            DataType::Timestamp(unit, _) => {
                let timestamp = match unit {
                    TimeUnit::Second => array
                        .as_any()
                        .downcast_ref::<TimestampSecondArray>()
                        .and_then(|a| DateTime::from_timestamp(a.value(row_idx), 0)),
                    TimeUnit::Millisecond => array
                        .as_any()
                        .downcast_ref::<TimestampMillisecondArray>()
                        .and_then(|a| DateTime::from_timestamp_millis(a.value(row_idx))),
                    TimeUnit::Microsecond => array
                        .as_any()
                        .downcast_ref::<TimestampMicrosecondArray>()
                        .and_then(|a| DateTime::from_timestamp_micros(a.value(row_idx))),
                    TimeUnit::Nanosecond => array
                        .as_any()
                        .downcast_ref::<TimestampNanosecondArray>()
                        .map(|a| DateTime::from_timestamp_nanos(a.value(row_idx))),
                };
                let dt = timestamp.ok_or_else(|| anyhow!("Invalid timestamp value"))?;
                json!(dt.to_rfc3339())
            }

            // Everything else uses Arrow's own display formatting
            _ => json!(array_value_to_string(array, row_idx)?),
        };

        Ok(value)
    }
}
