//! Payroll extract reading + normalization into the loader handoff table.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use payroll_core::{
    Month, NormalizedRow, NormalizedTable, PayrollMeasures, RejectReason, RejectedRow,
    DEFAULT_CURRENCY,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "payroll-extract";

/// Measure columns in canonical order; any of them may be missing from an extract.
pub const MEASURE_COLUMNS: [&str; 8] = [
    "gross",
    "bonus",
    "overtime",
    "taxes",
    "deductions",
    "net",
    "fte",
    "hours_worked",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading extract {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed extract: {0}")]
    Csv(#[from] csv::Error),
    #[error("required column `{0}` is missing from the extract header")]
    MissingColumn(&'static str),
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub default_currency: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            default_currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

/// A normalized extract together with the identity of its source bytes.
#[derive(Debug, Clone)]
pub struct Extract {
    pub source: PathBuf,
    pub sha256: String,
    pub table: NormalizedTable,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads and normalizes the extract at `path`. Never touches the warehouse.
pub fn load_extract(path: impl AsRef<Path>, options: &ExtractOptions) -> Result<Extract, ExtractError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = normalize_reader(bytes.as_slice(), options)?;
    Ok(Extract {
        source: path.to_path_buf(),
        sha256: sha256_hex(&bytes),
        table,
    })
}

#[derive(Debug)]
struct ColumnMap {
    emp_id: usize,
    dept: usize,
    month: usize,
    job_grade: Option<usize>,
    location: Option<usize>,
    currency: Option<usize>,
    measures: [Option<usize>; MEASURE_COLUMNS.len()],
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, ExtractError> {
        let names: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
            .collect();
        let find = |name: &str| names.iter().position(|n| n == name);
        let require = |name: &'static str| find(name).ok_or(ExtractError::MissingColumn(name));

        Ok(Self {
            emp_id: require("emp_id")?,
            dept: require("dept")?,
            month: require("month")?,
            job_grade: find("job_grade"),
            location: find("location"),
            currency: find("currency"),
            measures: MEASURE_COLUMNS.map(find),
        })
    }
}

/// Normalizes a CSV extract with a header row.
pub fn normalize_reader<R: Read>(reader: R, options: &ExtractOptions) -> Result<NormalizedTable, ExtractError> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = ColumnMap::from_headers(csv.headers()?)?;

    let mut table = NormalizedTable::default();
    for (idx, record) in csv.records().enumerate() {
        let record = record?;
        let line = idx + 1;
        table.rows_read += 1;

        let emp_id = cell(&record, Some(columns.emp_id));
        let dept = cell(&record, Some(columns.dept));
        let reject = match (emp_id, dept) {
            (None, _) => Some(RejectReason::MissingEmployeeId),
            (_, None) => Some(RejectReason::MissingDepartment),
            _ => None,
        };
        if let Some(reason) = reject {
            warn!(line, %reason, "rejecting extract row");
            table.rejected.push(RejectedRow { line, reason });
            continue;
        }

        let month = cell(&record, Some(columns.month)).and_then(|raw| Month::parse(raw).ok());
        let [gross, bonus, overtime, taxes, deductions, net, fte, hours_worked] =
            columns.measures.map(|col| coerce_number(cell(&record, col)));

        table.rows.push(NormalizedRow {
            line,
            emp_id: emp_id.unwrap_or_default().to_string(),
            dept: dept.unwrap_or_default().to_string(),
            month,
            job_grade: cell(&record, columns.job_grade).map(ToString::to_string),
            location: cell(&record, columns.location).map(ToString::to_string),
            measures: PayrollMeasures {
                gross,
                bonus,
                overtime,
                taxes,
                deductions,
                net,
                fte,
                hours_worked,
            },
            currency: cell(&record, columns.currency)
                .unwrap_or(&options.default_currency)
                .to_string(),
        });
    }

    Ok(table)
}

/// Trimmed, non-empty cell text.
fn cell(record: &csv::StringRecord, column: Option<usize>) -> Option<&str> {
    let value = record.get(column?)?.trim();
    (!value.is_empty()).then_some(value)
}

/// Numeric coercion: blanks, unparseable text and non-finite values become zero.
fn coerce_number(raw: Option<&str>) -> f64 {
    raw.and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn normalize(csv: &str) -> Result<NormalizedTable, ExtractError> {
        normalize_reader(csv.as_bytes(), &ExtractOptions::default())
    }

    #[test]
    fn coerces_measures_and_defaults_missing_columns() {
        let table = normalize(
            "emp_id,dept,month,gross,net,bonus\n\
             E1,  Sales ,2024-01,1000.50,800,oops\n\
             E2,Ops,2024-01-15,,700.25,\n",
        )
        .unwrap();

        assert_eq!(table.rows_read, 2);
        assert!(table.rejected.is_empty());
        let first = &table.rows[0];
        assert_eq!(first.dept, "Sales");
        assert_eq!(first.month, Month::new(2024, 1));
        assert_eq!(first.measures.gross, 1000.5);
        assert_eq!(first.measures.bonus, 0.0);
        assert_eq!(first.measures.overtime, 0.0);
        assert_eq!(first.measures.hours_worked, 0.0);
        assert_eq!(first.currency, DEFAULT_CURRENCY);

        let second = &table.rows[1];
        assert_eq!(second.month, Month::new(2024, 1));
        assert_eq!(second.measures.gross, 0.0);
        assert_eq!(second.measures.net, 700.25);
    }

    #[test]
    fn missing_employee_column_is_fatal() {
        let err = normalize("id,dept,month\nE1,Sales,2024-01\n").unwrap_err();
        assert!(matches!(err, ExtractError::MissingColumn("emp_id")));
    }

    #[test]
    fn headers_are_matched_case_insensitively() {
        let table = normalize("\u{feff}EMP_ID , Dept,Month,NET\nE1,Sales,2024-02,10\n").unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].measures.net, 10.0);
    }

    #[test]
    fn unparseable_month_keeps_row_without_a_month() {
        let table = normalize("emp_id,dept,month,net\nE1,Sales,Jan 2024,10\nE1,Sales,2024-01,20\n").unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].month, None);
        assert_eq!(table.skipped_fact_rows(), 1);
        assert_eq!(table.employees().len(), 1);
        assert_eq!(table.facts().len(), 1);
    }

    #[test]
    fn blank_keys_are_rejected_not_dropped() {
        let table = normalize("emp_id,dept,month\n,Sales,2024-01\nE2,  ,2024-01\nE3,Ops,2024-01\n").unwrap();
        assert_eq!(table.rows_read, 3);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(
            table.rejected,
            vec![
                RejectedRow { line: 1, reason: RejectReason::MissingEmployeeId },
                RejectedRow { line: 2, reason: RejectReason::MissingDepartment },
            ]
        );
    }

    #[test]
    fn non_finite_numbers_become_zero() {
        let table = normalize("emp_id,dept,month,net,fte\nE1,Sales,2024-01,NaN,inf\n").unwrap();
        assert_eq!(table.rows[0].measures.net, 0.0);
        assert_eq!(table.rows[0].measures.fte, 0.0);
    }

    #[test]
    fn currency_and_optional_attributes() {
        let options = ExtractOptions {
            default_currency: "EUR".into(),
        };
        let csv = "emp_id,dept,month,currency,job_grade,location\nE1,Sales,2024-01,USD,G3,\nE2,Sales,2024-01,,,Minsk\n";
        let table = normalize_reader(csv.as_bytes(), &options).unwrap();
        assert_eq!(table.rows[0].currency, "USD");
        assert_eq!(table.rows[0].job_grade.as_deref(), Some("G3"));
        assert_eq!(table.rows[0].location, None);
        assert_eq!(table.rows[1].currency, "EUR");
        assert_eq!(table.rows[1].location.as_deref(), Some("Minsk"));
    }

    #[test]
    fn ragged_rows_fail_the_extract() {
        let err = normalize("emp_id,dept,month\nE1,Sales\n").unwrap_err();
        assert!(matches!(err, ExtractError::Csv(_)));
    }

    #[test]
    fn load_extract_hashes_source_bytes() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        let body = "emp_id,dept,month,net\nE1,Sales,2024-01,10\n";
        file.write_all(body.as_bytes()).expect("write");

        let extract = load_extract(file.path(), &ExtractOptions::default()).expect("load");
        assert_eq!(extract.sha256, sha256_hex(body.as_bytes()));
        assert_eq!(extract.table.rows.len(), 1);
        assert_eq!(extract.source, file.path());
    }

    #[test]
    fn missing_file_reports_its_path() {
        let err = load_extract("/definitely/not/here.csv", &ExtractOptions::default()).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.csv"));
    }

    #[test]
    fn sha256_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
