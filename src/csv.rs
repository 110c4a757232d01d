//! CSV side-table store and integer-keyed column indexes.
//!
//! Equality tests may draw their value set from a CSV file
//! (`addr = "sites"[0]`).  Each file is parsed once, keyed by basename, and
//! its rows are shared into value indexes so a successful match can bind the
//! originating record.

use std::collections::HashMap;
use std::rc::Rc;

use crate::lang::{MatchValue, ValueIndex};
use crate::{Error, Result};

/// One row of a CSV file.
pub type CsvRecord = Vec<String>;

/// A parsed CSV file.
#[derive(Debug)]
pub struct CsvTable {
    pub basename: String,
    pub records: Vec<Rc<CsvRecord>>,
}

/// All CSV files loaded by the rule set, keyed by basename.
#[derive(Debug, Default)]
pub struct CsvStore {
    tables: HashMap<String, CsvTable>,
}

impl CsvStore {
    pub fn new() -> Self {
        CsvStore::default()
    }

    /// Load `basename.csv` (once; later calls return the cached table).
    pub fn load(&mut self, basename: &str) -> Result<&CsvTable> {
        if !self.tables.contains_key(basename) {
            let filename = format!("{basename}.csv");
            let mut reader = ::csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(&filename)?;
            let mut records = Vec::new();
            for row in reader.records() {
                let row = row?;
                records.push(Rc::new(row.iter().map(str::to_string).collect::<Vec<_>>()));
            }
            self.tables.insert(
                basename.to_string(),
                CsvTable {
                    basename: basename.to_string(),
                    records,
                },
            );
        }
        Ok(&self.tables[basename])
    }

    pub fn get(&self, basename: &str) -> Option<&CsvTable> {
        self.tables.get(basename)
    }
}

/// Parse a CSV field as an integer (decimal, hex, or octal).
pub fn parse_int(field: &str) -> Option<i64> {
    let field = field.trim();
    let (negative, digits) = match field.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, field),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok().map(|v| v as i64)
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(digits, 8).ok()
    } else {
        digits.parse::<i64>().ok()
    }?;
    Some(if negative { -value } else { value })
}

/// Build an integer index over `column`, mapping each value to its source
/// record.  On duplicate keys the first record wins.
pub fn build_int_index(table: &CsvTable, column: i64, index: &mut ValueIndex) -> Result<()> {
    for (row, record) in table.records.iter().enumerate() {
        let column = usize::try_from(column).ok().ok_or_else(|| {
            Error::Usage(format!(
                "failed to lookup column {column} from file \"{}.csv\"; index out of range",
                table.basename
            ))
        })?;
        let field = record.get(column).ok_or_else(|| {
            Error::Usage(format!(
                "failed to lookup column {column} from file \"{}.csv\"; row {row} has only {} \
                 column(s)",
                table.basename,
                record.len()
            ))
        })?;
        let value = parse_int(field).ok_or_else(|| {
            Error::Usage(format!(
                "failed to build index for file \"{}.csv\"; value \"{field}\" (row {row}, column \
                 {column}) is not an integer",
                table.basename
            ))
        })?;
        index
            .entry(MatchValue::Integer(value))
            .or_insert_with(|| Some(Rc::clone(record)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_csv(name: &str, contents: &str) -> (PathBuf, String) {
        let dir = std::env::temp_dir();
        let base = dir.join(format!("graft_csv_test_{name}_{}", std::process::id()));
        let path = base.with_extension("csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (path, base.to_string_lossy().to_string())
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0x2a"), Some(42));
        assert_eq!(parse_int("052"), Some(42));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int(" 7 "), Some(7));
        assert_eq!(parse_int("seven"), None);
    }

    #[test]
    fn test_load_and_index() {
        let (path, base) = write_csv("basic", "0x1000,first\n0x2000,second\n");
        let mut store = CsvStore::new();
        let table = store.load(&base).unwrap();
        assert_eq!(table.records.len(), 2);

        let mut index = ValueIndex::new();
        build_int_index(table, 0, &mut index).unwrap();
        let record = index
            .get(&MatchValue::Integer(0x2000))
            .unwrap()
            .as_ref()
            .unwrap();
        assert_eq!(record[1], "second");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_quoted_fields() {
        let (path, base) = write_csv("quoted", "1,\"a, quoted\"\n");
        let mut store = CsvStore::new();
        let table = store.load(&base).unwrap();
        assert_eq!(table.records[0][1], "a, quoted");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_duplicate_key_keeps_first() {
        let (path, base) = write_csv("dup", "5,first\n5,second\n");
        let mut store = CsvStore::new();
        let table = store.load(&base).unwrap();
        let mut index = ValueIndex::new();
        build_int_index(table, 0, &mut index).unwrap();
        let record = index
            .get(&MatchValue::Integer(5))
            .unwrap()
            .as_ref()
            .unwrap();
        assert_eq!(record[1], "first");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_non_integer_column_is_fatal() {
        let (path, base) = write_csv("bad", "foo,1\n");
        let mut store = CsvStore::new();
        let table = store.load(&base).unwrap();
        let mut index = ValueIndex::new();
        assert!(build_int_index(table, 0, &mut index).is_err());
        std::fs::remove_file(path).ok();
    }
}
