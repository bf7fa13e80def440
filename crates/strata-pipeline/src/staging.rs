//! Column cleaning applied between the bronze and silver layers.
//!
//! Rules never drop rows. A cell a rule cannot interpret becomes missing
//! (`Null`); only a required column that is absent altogether is an error.

use crate::table::Table;
use serde_json::{Map, Number, Value};

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("required column '{column}' is missing")]
    MissingColumn { column: String },

    #[error("csv decode failed: {0}")]
    Csv(String),

    #[error("json decode failed: {0}")]
    Json(String),

    #[error("parquet encode failed: {0}")]
    Parquet(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanRule {
    /// Trim surrounding whitespace.
    Strip,
    /// Trim, then upper-case.
    UpperCode,
    /// Drop `,` and `$`, then parse as a number.
    Currency,
    /// Parse as a number.
    Count,
}

impl CleanRule {
    pub fn apply(self, value: &Value) -> Value {
        match self {
            Self::Strip => strip_text(value),
            Self::UpperCode => upper_code(value),
            Self::Currency => parse_currency(value),
            Self::Count => parse_count(value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnRule {
    pub column: &'static str,
    pub rule: CleanRule,
}

const fn rule(column: &'static str, rule: CleanRule) -> ColumnRule {
    ColumnRule { column, rule }
}

pub const SITES_DATA_RULES: &[ColumnRule] = &[
    rule("id", CleanRule::Strip),
    rule("name", CleanRule::Strip),
    rule("address", CleanRule::Strip),
    rule("country_code", CleanRule::UpperCode),
];

pub const SITES_METADATA_RULES: &[ColumnRule] = &[
    rule("siteKey", CleanRule::Strip),
    rule("siteName", CleanRule::Strip),
    rule("siteAddress", CleanRule::Strip),
    rule("countryCode", CleanRule::UpperCode),
    rule("revenue", CleanRule::Currency),
    rule("employees_count", CleanRule::Count),
];

pub fn strip_text(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.trim().to_string()),
        other => other.clone(),
    }
}

pub fn upper_code(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.trim().to_uppercase()),
        other => other.clone(),
    }
}

pub fn parse_currency(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(text) => {
            let cleaned: String = text.chars().filter(|c| *c != ',' && *c != '$').collect();
            cleaned
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

pub fn parse_count(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(integer) = text.parse::<i64>() {
                return Value::from(integer);
            }
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

/// Applies `rules` column by column. Columns without a rule pass through.
pub fn clean_table(table: &Table, rules: &[ColumnRule]) -> Result<Table, StagingError> {
    if let Some(missing) = rules.iter().find(|rule| !table.has_column(rule.column)) {
        return Err(StagingError::MissingColumn {
            column: missing.column.to_string(),
        });
    }

    let mut cleaned = table.clone();
    for row in &mut cleaned.rows {
        for rule in rules {
            let current = row.get(rule.column).cloned().unwrap_or(Value::Null);
            row.insert(rule.column.to_string(), rule.rule.apply(&current));
        }
    }
    Ok(cleaned)
}

pub fn clean_sites_data(table: &Table) -> Result<Table, StagingError> {
    clean_table(table, SITES_DATA_RULES)
}

pub fn clean_sites_metadata(table: &Table) -> Result<Table, StagingError> {
    clean_table(table, SITES_METADATA_RULES)
}

/// Flattens one raw metadata document into a record: the envelope's
/// `extractedAt` and `originUri`, every payload field, and `revenue` and
/// `employees_count` lifted out of `payload.metadata`.
pub fn flatten_metadata_document(raw: &[u8]) -> Result<Map<String, Value>, StagingError> {
    let document: Value =
        serde_json::from_slice(raw).map_err(|err| StagingError::Json(err.to_string()))?;
    let Value::Object(mut envelope) = document else {
        return Err(StagingError::Json(
            "metadata document must be a json object".to_string(),
        ));
    };

    let payload = match envelope.remove("payload") {
        Some(Value::Object(payload)) => payload,
        _ => Map::new(),
    };
    let nested = |field: &str| {
        payload
            .get("metadata")
            .and_then(|metadata| metadata.get(field))
            .cloned()
            .unwrap_or(Value::Null)
    };
    let revenue = nested("revenue");
    let employees_count = nested("employees_count");

    let mut record = Map::new();
    record.insert(
        "extractedAt".to_string(),
        envelope.remove("extractedAt").unwrap_or(Value::Null),
    );
    record.insert(
        "originUri".to_string(),
        envelope.remove("originUri").unwrap_or(Value::Null),
    );
    record.extend(payload);
    record.insert("revenue".to_string(), revenue);
    record.insert("employees_count".to_string(), employees_count);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata_table(records: Vec<Value>) -> Table {
        Table::from_records(
            records
                .into_iter()
                .filter_map(|value| value.as_object().cloned())
                .collect(),
        )
    }

    #[test]
    fn clean_sites_data_expected_trimmed_text_and_upper_country() {
        let table = Table::from_csv(b"id,name,address,country_code\n 7 ,  Plant A ,Main St 1 , de \n")
            .expect("csv should decode");

        let cleaned = clean_sites_data(&table).expect("cleaning should succeed");
        let row = &cleaned.rows[0];
        assert_eq!(row["id"], json!("7"));
        assert_eq!(row["name"], json!("Plant A"));
        assert_eq!(row["address"], json!("Main St 1"));
        assert_eq!(row["country_code"], json!("DE"));
    }

    #[test]
    fn clean_sites_metadata_currency_and_counts_expected_numeric_or_missing() {
        let table = metadata_table(vec![
            json!({
                "siteKey": " k1 ", "siteName": "A", "siteAddress": "x", "countryCode": "fr",
                "revenue": "$1,234.50", "employees_count": "12"
            }),
            json!({
                "siteKey": "k2", "siteName": "B", "siteAddress": "y", "countryCode": "es",
                "revenue": "N/A", "employees_count": "unknown"
            }),
        ]);

        let cleaned = clean_sites_metadata(&table).expect("cleaning should succeed");

        assert_eq!(cleaned.row_count(), 2);
        assert_eq!(cleaned.rows[0]["revenue"], json!(1234.5));
        assert_eq!(cleaned.rows[0]["employees_count"], json!(12));
        assert_eq!(cleaned.rows[0]["siteKey"], json!("k1"));
        assert_eq!(cleaned.rows[0]["countryCode"], json!("FR"));
        assert_eq!(cleaned.rows[1]["revenue"], Value::Null);
        assert_eq!(cleaned.rows[1]["employees_count"], Value::Null);
    }

    #[test]
    fn clean_table_missing_required_column_expected_error() {
        let table = Table::from_csv(b"id,name,address\n1,a,b\n").expect("csv should decode");
        let error = clean_sites_data(&table).expect_err("missing column should fail");
        assert!(matches!(
            error,
            StagingError::MissingColumn { ref column } if column == "country_code"
        ));
    }

    #[test]
    fn rules_on_numbers_and_nulls_expected_pass_through() {
        assert_eq!(parse_currency(&json!(99.5)), json!(99.5));
        assert_eq!(parse_count(&json!(3)), json!(3));
        assert_eq!(strip_text(&Value::Null), Value::Null);
        assert_eq!(upper_code(&Value::Null), Value::Null);
        assert_eq!(parse_currency(&Value::Null), Value::Null);
        assert_eq!(parse_count(&json!("2.5")), json!(2.5));
        assert_eq!(parse_currency(&json!("NaN")), Value::Null);
    }

    #[test]
    fn clean_table_unruled_columns_expected_untouched() {
        let table = Table::from_csv(b"id,name,address,country_code,notes\n1,a,b,c,  keep  \n")
            .expect("csv should decode");
        let cleaned = clean_sites_data(&table).expect("cleaning should succeed");
        assert_eq!(cleaned.rows[0]["notes"], json!("  keep  "));
        assert_eq!(cleaned.columns, table.columns);
    }

    #[test]
    fn flatten_metadata_document_expected_envelope_payload_and_lifted_fields() {
        let raw = serde_json::to_vec(&json!({
            "extractedAt": "2024-05-01T10:00:00Z",
            "originUri": "https://registry.example/sites/k1",
            "payload": {
                "siteKey": "k1",
                "siteName": "Plant A",
                "metadata": {"revenue": "$10", "employees_count": "5"}
            }
        }))
        .expect("document should encode");

        let record = flatten_metadata_document(&raw).expect("document should flatten");
        assert_eq!(record["extractedAt"], json!("2024-05-01T10:00:00Z"));
        assert_eq!(record["siteKey"], json!("k1"));
        assert_eq!(record["revenue"], json!("$10"));
        assert_eq!(record["employees_count"], json!("5"));
        assert!(record["metadata"].is_object());
    }

    #[test]
    fn flatten_metadata_document_without_payload_expected_missing_fields() {
        let record = flatten_metadata_document(br#"{"originUri": "s3://x"}"#)
            .expect("document should flatten");
        assert_eq!(record["extractedAt"], Value::Null);
        assert_eq!(record["revenue"], Value::Null);
        assert!(flatten_metadata_document(b"[1, 2]").is_err());
    }
}
