//! Turns exported spreadsheet bytes into column names and JSON rows.
//!
//! Workbooks (xlsx, xls, ods) go through `calamine`, comma separated text
//! through `csv`. In both cases the first row is the header and every other
//! row is data.

use calamine::{Data, Reader};
use serde_json::{Map, Number, Value};
use std::{collections::HashMap, io::Cursor};
use thiserror::Error;

/// Rows returned by [`Table::sample`] when previewing.
pub const SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// Any workbook calamine can auto-detect.
    Workbook,
    Csv,
}

impl TableFormat {
    /// Guess the format from a file name extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(TableFormat::Workbook),
            "csv" => Some(TableFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to open workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("worksheet `{0}` not found")]
    SheetNotFound(String),
    #[error("spreadsheet contains no header row")]
    Empty,
    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("column `{0}` not found")]
    UnknownColumn(String),
    #[error("failed to write CSV: {0}")]
    Export(String),
}

pub type TableResult<T> = Result<T, TableError>;

/// Parsed sheet: header names and the data rows below them.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First `n` rows as column-name -> value records.
    pub fn sample(&self, n: usize) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .take(n)
            .map(|row| {
                self.columns
                    .iter()
                    .enumerate()
                    .map(|(i, col)| (col.clone(), row.get(i).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect()
    }

    /// Rows whose `column` contains `needle`, ignoring case. Empty cells
    /// never match.
    pub fn filter_contains(&self, column: &str, needle: &str) -> TableResult<Table> {
        let index = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| TableError::UnknownColumn(column.to_string()))?;
        let needle = needle.to_lowercase();
        let rows = self
            .rows
            .iter()
            .filter(|row| {
                row.get(index)
                    .and_then(cell_text)
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();

        Ok(Table {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Whole table as UTF-8 CSV, header first. Empty cells are written as
    /// empty fields.
    pub fn to_csv(&self) -> TableResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let fields = (0..self.columns.len())
                .map(|i| row.get(i).and_then(cell_text).unwrap_or_default());
            writer.write_record(fields)?;
        }
        writer
            .into_inner()
            .map_err(|err| TableError::Export(err.to_string()))
    }
}

/// Text form of a parsed cell, `None` for empty cells.
fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Parse `data` as `format`. `sheet` selects a worksheet by name; the first
/// one is used otherwise. CSV input ignores `sheet`.
pub fn parse_table(data: &[u8], format: TableFormat, sheet: Option<&str>) -> TableResult<Table> {
    match format {
        TableFormat::Workbook => parse_workbook(data, sheet),
        TableFormat::Csv => parse_csv(data),
    }
}

fn parse_workbook(data: &[u8], sheet: Option<&str>) -> TableResult<Table> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(data))?;
    let names = workbook.sheet_names();
    let name = match sheet {
        Some(wanted) => names
            .iter()
            .find(|n| n.as_str() == wanted)
            .cloned()
            .ok_or_else(|| TableError::SheetNotFound(wanted.to_string()))?,
        None => names.first().cloned().ok_or(TableError::Empty)?,
    };
    let range = workbook.worksheet_range(&name)?;

    let mut rows = range.rows();
    let header = rows.next().ok_or(TableError::Empty)?;
    let columns = header_names(header.iter().map(cell_label));
    let data_rows = rows
        .map(|row| row.iter().map(cell_value).collect())
        .collect();

    Ok(Table {
        columns,
        rows: data_rows,
    })
}

fn parse_csv(data: &[u8]) -> TableResult<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);

    let header = reader.headers()?.clone();
    if header.is_empty() {
        return Err(TableError::Empty);
    }
    let columns = header_names(header.iter().map(|h| {
        let h = h.trim();
        (!h.is_empty()).then(|| h.to_string())
    }));

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(text_value).collect());
    }

    Ok(Table { columns, rows })
}

/// Fill blank headers with `Unnamed: <i>` and suffix duplicates with `.<n>`
/// so every column name is a distinct record key. A generated name that
/// collides with a later or earlier header is suffixed again (`a.1.1`).
fn header_names(labels: impl Iterator<Item = Option<String>>) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    labels
        .enumerate()
        .map(|(i, label)| {
            let mut name = label.unwrap_or_else(|| format!("Unnamed: {}", i));
            let mut count = counts.get(&name).copied().unwrap_or(0);
            while count > 0 {
                counts.insert(name.clone(), count + 1);
                name = format!("{}.{}", name, count);
                count = counts.get(&name).copied().unwrap_or(0);
            }
            counts.insert(name.clone(), count + 1);
            name
        })
        .collect()
}

fn cell_label(cell: &Data) -> Option<String> {
    match cell_value(cell) {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => float_value(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => Value::String(naive.format("%Y-%m-%dT%H:%M:%S").to_string()),
            None => float_value(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(err) => Value::String(err.to_string()),
    }
}

/// Whole floats inside the exactly representable range become integers,
/// matching how spreadsheets display them.
fn float_value(f: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if f.fract() == 0.0 && f.abs() < MAX_EXACT {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn text_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return float_value(f);
        }
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Two sheets: `People` (strings, numbers, booleans, dates, one blank
    /// cell) and `Totals`.
    pub(crate) const PEOPLE_XLSX: &[u8] = include_bytes!("../../testdata/people.xlsx");

    const PEOPLE: &[u8] = b"name,age,active\nAda,36,true\nGrace,85,False\nLinus,,true\n";

    #[test]
    fn parses_csv_header_and_rows() {
        let table = parse_table(PEOPLE, TableFormat::Csv, None).unwrap();
        assert_eq!(table.columns, vec!["name", "age", "active"]);
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.rows[1], vec![json!("Grace"), json!(85), json!(false)]);
        assert_eq!(table.rows[2][1], Value::Null);
    }

    #[test]
    fn sample_is_capped_and_keyed_by_column() {
        let mut csv = String::from("id,score\n");
        for i in 0..12 {
            csv.push_str(&format!("{},{}.5\n", i, i));
        }
        let table = parse_table(csv.as_bytes(), TableFormat::Csv, None).unwrap();
        let sample = table.sample(SAMPLE_ROWS);

        assert_eq!(table.row_count(), 12);
        assert_eq!(sample.len(), SAMPLE_ROWS);
        assert_eq!(sample[0].get("id"), Some(&json!(0)));
        assert_eq!(sample[4].get("score"), Some(&json!(4.5)));
    }

    #[test]
    fn blank_and_duplicate_headers_get_distinct_names() {
        let table = parse_table(b"a,,a,a\n1,2,3,4\n", TableFormat::Csv, None).unwrap();
        assert_eq!(table.columns, vec!["a", "Unnamed: 1", "a.1", "a.2"]);
        assert_eq!(table.sample(1)[0].len(), 4);

        let table = parse_table(b"a,a,a.1\n1,2,3\n", TableFormat::Csv, None).unwrap();
        assert_eq!(table.columns, vec!["a", "a.1", "a.1.1"]);
        let record = &table.sample(1)[0];
        assert_eq!(record.len(), 3);
        assert_eq!(record.get("a.1"), Some(&json!(2)));
        assert_eq!(record.get("a.1.1"), Some(&json!(3)));

        let table = parse_table(b"a.1,a,a\n1,2,3\n", TableFormat::Csv, None).unwrap();
        assert_eq!(table.columns, vec!["a.1", "a", "a.1.1"]);
    }

    #[test]
    fn short_rows_fill_with_null() {
        let table = parse_table(b"a,b,c\n1\n", TableFormat::Csv, None).unwrap();
        let sample = table.sample(1);
        assert_eq!(sample[0].get("c"), Some(&Value::Null));
    }

    #[test]
    fn empty_csv_is_an_error() {
        assert!(matches!(
            parse_table(b"", TableFormat::Csv, None),
            Err(TableError::Empty)
        ));
    }

    #[test]
    fn workbook_defaults_to_first_sheet() {
        let table = parse_table(PEOPLE_XLSX, TableFormat::Workbook, None).unwrap();
        assert_eq!(table.columns, vec!["name", "age", "score", "active", "joined"]);
        assert_eq!(table.row_count(), 3);

        let ada = &table.rows[0];
        assert_eq!(ada[0], json!("Ada"));
        assert_eq!(ada[1], json!(36));
        assert_eq!(ada[2], json!(91.5));
        assert_eq!(ada[3], json!(true));
        assert_eq!(ada[4], json!("2024-01-15T00:00:00"));

        assert_eq!(table.rows[1][2], json!(77));
        assert_eq!(table.rows[1][3], json!(false));
        assert_eq!(table.rows[2][2], Value::Null);
    }

    #[test]
    fn workbook_sheet_can_be_chosen_by_name() {
        let table = parse_table(PEOPLE_XLSX, TableFormat::Workbook, Some("Totals")).unwrap();
        assert_eq!(table.columns, vec!["region", "total"]);
        assert_eq!(
            table.sample(SAMPLE_ROWS),
            vec![
                Map::from_iter([("region".to_string(), json!("North")), ("total".to_string(), json!(1200))]),
                Map::from_iter([("region".to_string(), json!("South")), ("total".to_string(), json!(800.5))]),
            ]
        );
    }

    #[test]
    fn unknown_worksheet_is_reported() {
        let err = parse_table(PEOPLE_XLSX, TableFormat::Workbook, Some("Missing")).unwrap_err();
        assert!(matches!(err, TableError::SheetNotFound(name) if name == "Missing"));
    }

    #[test]
    fn garbage_workbook_is_an_error() {
        let err = parse_table(b"definitely not a zip archive", TableFormat::Workbook, None);
        assert!(err.is_err());
    }

    #[test]
    fn filter_matches_substrings_ignoring_case() {
        let table = parse_table(PEOPLE, TableFormat::Csv, None).unwrap();

        let matched = table.filter_contains("name", "A").unwrap();
        assert_eq!(matched.columns, table.columns);
        assert_eq!(matched.row_count(), 2);
        assert_eq!(matched.rows[0][0], json!("Ada"));
        assert_eq!(matched.rows[1][0], json!("Grace"));

        // numbers match on their text, blank cells never match
        assert_eq!(table.filter_contains("age", "8").unwrap().row_count(), 1);
        assert_eq!(table.filter_contains("age", "").unwrap().row_count(), 2);

        assert!(matches!(
            table.filter_contains("email", "x"),
            Err(TableError::UnknownColumn(col)) if col == "email"
        ));
    }

    #[test]
    fn csv_export_writes_header_and_every_row() {
        let table = parse_table(PEOPLE_XLSX, TableFormat::Workbook, None).unwrap();
        let csv = String::from_utf8(table.to_csv().unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "name,age,score,active,joined");
        assert_eq!(lines[1], "Ada,36,91.5,true,2024-01-15T00:00:00");
        assert_eq!(lines[3], "Linus,54,,true,2024-01-01T00:00:00");

        let reparsed = parse_table(csv.as_bytes(), TableFormat::Csv, None).unwrap();
        assert_eq!(reparsed.columns, table.columns);
        assert_eq!(reparsed.rows[1][1], json!(85));
    }

    #[test]
    fn detects_format_from_extension() {
        assert_eq!(TableFormat::from_file_name("Budget.XLSX"), Some(TableFormat::Workbook));
        assert_eq!(TableFormat::from_file_name("data.csv"), Some(TableFormat::Csv));
        assert_eq!(TableFormat::from_file_name("notes.txt"), None);
        assert_eq!(TableFormat::from_file_name("no_extension"), None);
    }

    #[test]
    fn whole_floats_collapse_to_integers() {
        assert_eq!(float_value(42.0), json!(42));
        assert_eq!(float_value(0.25), json!(0.25));
        assert_eq!(float_value(f64::NAN), Value::Null);
    }
}
