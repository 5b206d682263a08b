//! CSV codec for the inventory table: byte decoding, import parsing with
//! flexible headers, export, and the downloadable template.

use std::collections::HashMap;

use encoding_rs::{Encoding, WINDOWS_1252};
use labstock_core::{InventoryRecord, RecordDraft, Status};
use thiserror::Error;

pub const CRATE_NAME: &str = "labstock-csv";

/// Columns that must be present (after header normalization) for an import
/// to proceed at all.
pub const REQUIRED_COLUMNS: [&str; 3] = ["catalog_number", "vendor", "name"];

/// Export headers, in table order. The surrogate id is never exported.
pub const DISPLAY_HEADERS: [&str; 12] = [
    "Requested By",
    "Catalog Number",
    "Vendor",
    "Name",
    "URL",
    "Quantity",
    "Unit",
    "Notes",
    "Cost",
    "Status",
    "Order Date",
    "Received Date",
];

const TEMPLATE_HEADERS: [&str; 12] = [
    "requested_by",
    "catalog_number",
    "vendor",
    "name",
    "url",
    "quantity",
    "unit",
    "notes",
    "cost",
    "status",
    "order_date",
    "received_date",
];

#[derive(Debug, Error)]
pub enum ImportError {
    /// The validation failure: required columns absent, nothing imported.
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    /// A row-level conversion failure; aborts the whole import.
    #[error("row {line}: {message}")]
    Row { line: u64, message: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Decodes uploaded bytes: BOM-tagged encodings win, then valid UTF-8, then
/// a Windows-1252 fallback for legacy spreadsheet exports.
pub fn decode_bytes(bytes: &[u8]) -> String {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding.decode(bytes).0.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => WINDOWS_1252.decode(bytes).0.into_owned(),
    }
}

/// Case-insensitive header matching with spaces normalized to underscores.
pub fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

/// Parses import bytes into drafts. All rows are converted up front; the
/// first failure aborts the parse so the caller never partially commits.
pub fn parse_import(bytes: &[u8]) -> Result<Vec<RecordDraft>, ImportError> {
    let text = decode_bytes(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingColumns(missing));
    }

    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, header)| (header.as_str(), i))
        .collect();

    let mut drafts = Vec::new();
    for result in reader.records() {
        let record = result?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        drafts.push(draft_from_record(&record, &index, line)?);
    }
    Ok(drafts)
}

fn field<'a>(
    record: &'a csv::StringRecord,
    index: &HashMap<&str, usize>,
    name: &str,
) -> Option<&'a str> {
    index
        .get(name)
        .and_then(|&i| record.get(i))
        .filter(|value| !value.trim().is_empty())
}

fn draft_from_record(
    record: &csv::StringRecord,
    index: &HashMap<&str, usize>,
    line: u64,
) -> Result<RecordDraft, ImportError> {
    let defaults = RecordDraft::default();

    let quantity = match field(record, index, "quantity") {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|err| row_error(line, "quantity", raw, &err))?,
        None => defaults.quantity,
    };
    let cost = match field(record, index, "cost") {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|err| row_error(line, "cost", raw, &err))?,
        None => defaults.cost,
    };
    let status = match field(record, index, "status") {
        Some(raw) => raw
            .parse::<Status>()
            .map_err(|err| row_error(line, "status", raw, &err))?,
        None => defaults.status,
    };

    Ok(RecordDraft {
        requested_by: field(record, index, "requested_by")
            .map(str::to_string)
            .unwrap_or(defaults.requested_by),
        catalog_number: field(record, index, "catalog_number")
            .unwrap_or_default()
            .to_string(),
        vendor: field(record, index, "vendor").unwrap_or_default().to_string(),
        name: field(record, index, "name")
            .map(str::to_string)
            .unwrap_or(defaults.name),
        url: field(record, index, "url").map(str::to_string),
        quantity,
        unit: field(record, index, "unit").map(str::to_string),
        notes: field(record, index, "notes").map(str::to_string),
        cost,
        status,
        order_date: field(record, index, "order_date").map(str::to_string),
        received_date: field(record, index, "received_date").map(str::to_string),
    })
}

fn row_error(line: u64, column: &str, raw: &str, err: &dyn std::fmt::Display) -> ImportError {
    ImportError::Row {
        line,
        message: format!("invalid {column} value {raw:?}: {err}"),
    }
}

/// Renders the full record set; `id` omitted, display-name headers.
pub fn export_csv(records: &[InventoryRecord]) -> Result<String, csv::Error> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record(DISPLAY_HEADERS)?;
        for record in records {
            writer.write_record(&export_row(record))?;
        }
        writer.flush()?;
    }
    Ok(String::from_utf8(buffer).expect("csv output is utf-8"))
}

fn export_row(record: &InventoryRecord) -> [String; 12] {
    [
        record.requested_by.clone(),
        record.catalog_number.clone(),
        record.vendor.clone(),
        record.name.clone(),
        record.url.clone().unwrap_or_default(),
        record.quantity.to_string(),
        record.unit.clone().unwrap_or_default(),
        record.notes.clone().unwrap_or_default(),
        record.cost.to_string(),
        record.status.to_string(),
        record.order_date.clone().unwrap_or_default(),
        record.received_date.clone().unwrap_or_default(),
    ]
}

/// Single populated example row for user reference.
pub fn template_csv() -> Result<String, csv::Error> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record(TEMPLATE_HEADERS)?;
        writer.write_record([
            "Jamie Park",
            "12345",
            "Sigma",
            "Chemical A",
            "http://example.com",
            "1",
            "200/Case",
            "For research use",
            "0.0",
            "Requested",
            "",
            "",
        ])?;
        writer.flush()?;
    }
    Ok(String::from_utf8(buffer).expect("csv output is utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_normalization_is_case_and_space_insensitive() {
        assert_eq!(normalize_header("Catalog Number"), "catalog_number");
        assert_eq!(normalize_header("  VENDOR "), "vendor");
        assert_eq!(normalize_header("order date"), "order_date");
    }

    #[test]
    fn missing_columns_name_the_missing_set() {
        let err = parse_import(b"catalog_number,name\nab-1,Buffer\n").expect_err("no vendor");
        match err {
            ImportError::MissingColumns(columns) => assert_eq!(columns, vec!["vendor"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rows_fill_documented_defaults() {
        let drafts =
            parse_import(b"Catalog Number,Vendor,Name\nAB-1,Sigma,Buffer\n").expect("parse");
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.catalog_number, "AB-1");
        assert_eq!(draft.requested_by, "Unknown");
        assert_eq!(draft.quantity, 1);
        assert_eq!(draft.cost, 0.0);
        assert_eq!(draft.status, Status::Requested);
        assert!(draft.url.is_none());
        assert!(draft.notes.is_none());
    }

    #[test]
    fn full_rows_parse_every_column() {
        let csv = b"requested_by,catalog_number,vendor,name,url,quantity,unit,notes,cost,status,order_date,received_date\n\
pat,ab-1,sigma,Buffer,http://example.com,3,500 mL,keep cold,12.5,ordered,2024-02-01,\n";
        let drafts = parse_import(csv).expect("parse");
        let draft = &drafts[0];
        assert_eq!(draft.quantity, 3);
        assert_eq!(draft.cost, 12.5);
        assert_eq!(draft.status, Status::Ordered);
        assert_eq!(draft.order_date.as_deref(), Some("2024-02-01"));
        assert!(draft.received_date.is_none());
    }

    #[test]
    fn bad_quantity_aborts_with_line_number() {
        let csv = b"catalog_number,vendor,name,quantity\nab-1,sigma,Buffer,1\nab-2,sigma,Buffer,lots\n";
        let err = parse_import(csv).expect_err("bad quantity");
        match err {
            ImportError::Row { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("quantity"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn decoding_falls_back_to_windows_1252() {
        // "Mat\xe9riel" is latin-1, invalid as UTF-8.
        let bytes = b"catalog_number,vendor,name\nab-1,sigma,Mat\xe9riel\n";
        let drafts = parse_import(bytes).expect("parse");
        assert_eq!(drafts[0].name, "Mat\u{e9}riel");
    }

    #[test]
    fn decoding_honors_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"catalog_number,vendor,name\nab-1,sigma,Buffer\n");
        let drafts = parse_import(&bytes).expect("parse");
        assert_eq!(drafts[0].catalog_number, "ab-1");
    }

    #[test]
    fn export_omits_id_and_uses_display_headers() {
        let record = InventoryRecord {
            id: 7,
            requested_by: "pat".to_string(),
            catalog_number: "ab-1".to_string(),
            vendor: "sigma".to_string(),
            name: "Buffer".to_string(),
            url: None,
            quantity: 2,
            unit: None,
            notes: Some("rush".to_string()),
            cost: 9.99,
            status: Status::Ordered,
            order_date: Some("2024-02-01".to_string()),
            received_date: None,
        };
        let text = export_csv(&[record]).expect("export");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Requested By,Catalog Number,Vendor,Name,URL,Quantity,Unit,Notes,Cost,Status,Order Date,Received Date")
        );
        let row = lines.next().expect("data row");
        assert!(row.starts_with("pat,ab-1,sigma,Buffer,"));
        assert!(!row.contains('7'));
        assert!(row.contains("Ordered"));
    }

    #[test]
    fn export_round_trips_through_import_parsing() {
        let record = InventoryRecord {
            id: 1,
            requested_by: "pat".to_string(),
            catalog_number: "ab-1".to_string(),
            vendor: "sigma".to_string(),
            name: "Buffer".to_string(),
            url: Some("http://example.com".to_string()),
            quantity: 4,
            unit: Some("500 mL".to_string()),
            notes: Some("keep cold".to_string()),
            cost: 12.5,
            status: Status::Received,
            order_date: Some("2024-02-01".to_string()),
            received_date: Some("2024-02-09".to_string()),
        };
        let text = export_csv(&[record.clone()]).expect("export");
        let drafts = parse_import(text.as_bytes()).expect("reimport");
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.catalog_number, record.catalog_number);
        assert_eq!(draft.vendor, record.vendor);
        assert_eq!(draft.quantity, record.quantity);
        assert_eq!(draft.cost, record.cost);
        assert_eq!(draft.status, record.status);
        assert_eq!(draft.order_date, record.order_date);
        assert_eq!(draft.received_date, record.received_date);
    }

    #[test]
    fn template_has_headers_and_one_populated_row() {
        let text = template_csv().expect("template");
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(TEMPLATE_HEADERS.join(",").as_str()));
        let row = lines.next().expect("example row");
        assert!(row.contains("12345"));
        assert!(row.contains("Requested"));
        assert_eq!(lines.next(), None);
    }
}
