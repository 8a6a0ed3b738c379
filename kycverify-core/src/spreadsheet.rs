//! Upload handling: turns `.xlsx`, `.xls` and `.csv` files into string rows.

use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use tracing::debug;

use crate::error::{KycError, KycResult};

/// Default upload size cap (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Accepted upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    /// Office Open XML workbook.
    Xlsx,
    /// Legacy binary workbook.
    Xls,
    /// Comma separated values.
    Csv,
}

impl UploadFormat {
    /// Detects the format from a file name extension.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::InvalidInput`] for unsupported extensions.
    pub fn from_file_name(file_name: &str) -> KycResult<Self> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("xlsx") => Ok(Self::Xlsx),
            Some("xls") => Ok(Self::Xls),
            Some("csv") => Ok(Self::Csv),
            _ => Err(KycError::invalid_input(
                "file_name",
                format!("unsupported file type: {file_name} (expected .xlsx, .xls or .csv)"),
            )),
        }
    }
}

/// One data row of a sheet. Cells are aligned with [`RawSheet::headers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based row number as shown in the spreadsheet.
    pub row_number: usize,
    /// Cell text, trimmed. Missing trailing cells are empty strings.
    pub cells: Vec<String>,
}

impl RawRow {
    /// Whether every cell is blank.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|cell| cell.trim().is_empty())
    }
}

/// A parsed sheet: the header row and the data rows below it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSheet {
    /// Header cell text, trimmed.
    pub headers: Vec<String>,
    /// Data rows.
    pub rows: Vec<RawRow>,
}

impl RawSheet {
    /// Builds a sheet from in-memory rows; the first row is the header.
    ///
    /// Row numbers follow spreadsheet convention: the header is row 1.
    #[must_use]
    pub fn from_rows<R, C>(rows: R) -> Self
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let mut sheet = Self::default();
        let mut header_seen = false;
        for (index, row) in rows.into_iter().enumerate() {
            let cells: Vec<String> = row
                .into_iter()
                .map(|cell| cell.into().trim().to_string())
                .collect();
            if !header_seen {
                if cells.iter().all(String::is_empty) {
                    continue;
                }
                sheet.headers = cells;
                header_seen = true;
                continue;
            }
            sheet.rows.push(RawRow {
                row_number: index + 1,
                cells,
            });
        }
        sheet
    }

    /// Header text as string slices, for column mapping.
    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(String::as_str)
    }

    /// Index of the column with the exact header text `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// Value of `column` in `row`, or `None` when the cell is blank.
    #[must_use]
    pub fn cell<'a>(&self, row: &'a RawRow, column: &str) -> Option<&'a str> {
        let index = self.column_index(column)?;
        row.cells
            .get(index)
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    }
}

/// Parses an uploaded file.
///
/// # Errors
///
/// Returns [`KycError::InvalidInput`] when the file is too large or has an
/// unsupported extension, and [`KycError::Spreadsheet`] when it cannot be parsed.
pub fn load_upload(file_name: &str, bytes: Vec<u8>, max_bytes: usize) -> KycResult<RawSheet> {
    if bytes.len() > max_bytes {
        return Err(KycError::invalid_input(
            "file",
            format!("upload of {} bytes exceeds the {max_bytes} byte limit", bytes.len()),
        ));
    }
    let format = UploadFormat::from_file_name(file_name)?;
    let sheet = match format {
        UploadFormat::Xlsx | UploadFormat::Xls => parse_workbook(bytes)?,
        UploadFormat::Csv => parse_csv(&bytes)?,
    };
    debug!(
        file_name,
        columns = sheet.headers.len(),
        rows = sheet.rows.len(),
        "parsed upload"
    );
    Ok(sheet)
}

/// Reads and parses a file from disk.
///
/// # Errors
///
/// See [`load_upload`]; also fails if the file cannot be read.
pub fn load_path(path: &Path, max_bytes: usize) -> KycResult<RawSheet> {
    let metadata = std::fs::metadata(path)?;
    if usize::try_from(metadata.len()).map_or(true, |len| len > max_bytes) {
        return Err(KycError::invalid_input(
            "file",
            format!("{} exceeds the {max_bytes} byte limit", path.display()),
        ));
    }
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    load_upload(file_name, bytes, max_bytes)
}

fn parse_workbook(bytes: Vec<u8>) -> KycResult<RawSheet> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| KycError::Spreadsheet(format!("cannot open workbook: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| KycError::Spreadsheet("workbook has no worksheets".to_string()))?
        .map_err(|e| KycError::Spreadsheet(format!("cannot read first worksheet: {e}")))?;

    // `rows()` starts at the first used cell, which may not be A1.
    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    let mut sheet = RawSheet::from_rows(range.rows().map(|row| row.iter().map(cell_text)));
    for row in &mut sheet.rows {
        row.row_number += first_row;
    }
    Ok(sheet)
}

fn parse_csv(bytes: &[u8]) -> KycResult<RawSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| KycError::Spreadsheet(format!("invalid csv: {e}")))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    Ok(RawSheet::from_rows(rows))
}

#[allow(clippy::cast_possible_truncation)]
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        // Numeric identifiers (Aadhaar) arrive as floats.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("records.xlsx", UploadFormat::Xlsx)]
    #[test_case("OLD.XLS", UploadFormat::Xls)]
    #[test_case("batch.csv", UploadFormat::Csv)]
    fn test_format_from_file_name(name: &str, expected: UploadFormat) {
        assert_eq!(UploadFormat::from_file_name(name).unwrap(), expected);
    }

    #[test]
    fn test_rejects_unknown_extension() {
        assert!(matches!(
            UploadFormat::from_file_name("records.pdf"),
            Err(KycError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_upload() {
        let bytes = vec![b'a'; 64];
        assert!(matches!(
            load_upload("batch.csv", bytes, 32),
            Err(KycError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_parses_csv_with_row_numbers() {
        let csv = "PAN No,Name,DOB\nABCDE1234F, Asha Rao ,1990-03-01\n,,\nPQRSX6789K,Vikram Singh,\n";
        let sheet = load_upload("batch.csv", csv.as_bytes().to_vec(), 1024).unwrap();
        assert_eq!(sheet.headers, vec!["PAN No", "Name", "DOB"]);
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(sheet.rows[0].row_number, 2);
        assert_eq!(sheet.cell(&sheet.rows[0], "Name"), Some("Asha Rao"));
        assert!(sheet.rows[1].is_blank());
        assert_eq!(sheet.rows[2].row_number, 4);
        assert_eq!(sheet.cell(&sheet.rows[2], "DOB"), None);
    }

    #[test]
    fn test_leading_blank_rows_are_skipped_before_header() {
        let sheet = RawSheet::from_rows(vec![vec!["", ""], vec!["PAN", "Name"], vec!["ABCDE1234F", "Asha"]]);
        assert_eq!(sheet.headers, vec!["PAN", "Name"]);
        assert_eq!(sheet.rows[0].row_number, 3);
    }

    #[test]
    fn test_float_cells_keep_integral_digits() {
        assert_eq!(cell_text(&Data::Float(123_412_341_234.0)), "123412341234");
        assert_eq!(cell_text(&Data::Float(1.5)), "1.5");
        assert_eq!(cell_text(&Data::Empty), "");
    }

    #[test]
    fn test_garbage_workbook_is_spreadsheet_error() {
        assert!(matches!(
            load_upload("records.xlsx", b"not a zip".to_vec(), 1024),
            Err(KycError::Spreadsheet(_))
        ));
    }

    #[test]
    fn test_load_path_reads_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.csv");
        std::fs::write(&path, "pan,name\nABCDE1234F,Asha Rao\n").unwrap();
        let sheet = load_path(&path, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(sheet.rows.len(), 1);
    }
}
