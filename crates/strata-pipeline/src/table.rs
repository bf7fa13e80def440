use crate::staging::StagingError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Row = BTreeMap<String, Value>;

/// A small in-memory table. `Value::Null` marks a missing cell.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Decodes a headed CSV document. Every cell is text; empty cells are
    /// missing.
    pub fn from_csv(raw: &[u8]) -> Result<Self, StagingError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(raw);
        let columns: Vec<String> = reader
            .headers()
            .map_err(|err| StagingError::Csv(err.to_string()))?
            .iter()
            .map(|header| header.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut table = Self::new(columns);
        for record in reader.records() {
            let record = record.map_err(|err| StagingError::Csv(err.to_string()))?;
            let row = table
                .columns
                .iter()
                .zip(record.iter())
                .map(|(column, cell)| {
                    let value = if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    };
                    (column.clone(), value)
                })
                .collect();
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Builds a table from JSON objects. Columns keep first-seen order and
    /// rows missing a column get `Null` for it.
    pub fn from_records(records: Vec<Map<String, Value>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.iter().any(|column| column == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|column| (column.clone(), record.remove(column).unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|candidate| candidate == column)
    }

    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(column).unwrap_or(&Value::Null))
    }

    /// Markdown table of the first `limit` rows.
    pub fn to_markdown(&self, limit: usize) -> String {
        if self.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!(
            "|{}\n",
            self.columns.iter().map(|_| " --- |").collect::<String>()
        ));
        for row in self.rows.iter().take(limit) {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|column| markdown_cell(row.get(column).unwrap_or(&Value::Null)))
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out
    }
}

fn markdown_cell(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_csv_empty_cells_expected_null_and_text_preserved() {
        let table = Table::from_csv(b"id,name,country_code\n 1 ,Berlin Hub,\n2,,de\n")
            .expect("csv should decode");

        assert_eq!(table.columns, vec!["id", "name", "country_code"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[0]["id"], json!(" 1 "));
        assert_eq!(table.rows[0]["country_code"], Value::Null);
        assert_eq!(table.rows[1]["name"], Value::Null);
    }

    #[test]
    fn from_csv_ragged_row_expected_csv_error() {
        let error = Table::from_csv(b"id,name\n1,a,extra\n").expect_err("ragged csv should fail");
        assert!(matches!(error, StagingError::Csv(_)));
    }

    #[test]
    fn from_records_expected_union_of_columns_in_first_seen_order() {
        let records = vec![
            json!({"siteKey": "a", "revenue": "1"}),
            json!({"siteKey": "b", "employees_count": 4}),
        ]
        .into_iter()
        .filter_map(|value| value.as_object().cloned())
        .collect();
        let table = Table::from_records(records);

        assert_eq!(table.columns.len(), 3);
        assert!(table.has_column("employees_count"));
        assert_eq!(table.rows[0]["employees_count"], Value::Null);
        assert_eq!(table.rows[1]["revenue"], Value::Null);
    }

    #[test]
    fn to_markdown_expected_header_separator_and_limited_rows() {
        let table = Table::from_csv(b"a,b\n1,x|y\n2,z\n3,w\n").expect("csv should decode");
        let markdown = table.to_markdown(2);
        let lines: Vec<&str> = markdown.lines().collect();
        assert_eq!(lines[0], "| a | b |");
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[2], "| 1 | x\\|y |");
        assert_eq!(lines.len(), 4);
    }
}
