// Wed Jan 14 2026 - Alex

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{FrontendError, Result};
use crate::rules::ast::{MatchValue, ValueIndex};

/// A typed table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Integer(i64),
    Bool(bool),
    Str(String),
}

impl Cell {
    fn parse(text: &str) -> Cell {
        match text {
            "true" => return Cell::Bool(true),
            "false" => return Cell::Bool(false),
            _ => {}
        }
        if let Some(value) = parse_integer(text) {
            return Cell::Integer(value);
        }
        Cell::Str(text.to_string())
    }

    /// The index key for this cell: numeric and boolean cells key under
    /// the integer tag, everything else under the string tag.
    pub fn index_key(&self) -> MatchValue {
        match self {
            Cell::Integer(i) => MatchValue::Integer(*i),
            Cell::Bool(b) => MatchValue::Integer(*b as i64),
            Cell::Str(s) => MatchValue::String(s.clone()),
        }
    }
}

fn parse_integer(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = if let Some(hex) = body.strip_prefix("0x") {
        (16, hex)
    } else if let Some(hex) = body.strip_prefix("0X") {
        (16, hex)
    } else if let Some(bin) = body.strip_prefix("0b") {
        (2, bin)
    } else if let Some(bin) = body.strip_prefix("0B") {
        (2, bin)
    } else {
        (10, body)
    };
    if digits.is_empty() {
        return None;
    }
    let value = i64::from_str_radix(digits, radix)
        .or_else(|_| u64::from_str_radix(digits, radix).map(|u| u as i64))
        .ok()?;
    Some(if negative { -value } else { value })
}

pub type Record = Vec<Cell>;

/// Loads `basename.csv` tables and builds column value-indexes.  A
/// basename is cached so repeated references share the loaded table.
pub struct CsvLoader {
    root: PathBuf,
    cache: HashMap<String, Rc<Vec<Rc<Record>>>>,
}

impl CsvLoader {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("."),
            cache: HashMap::new(),
        }
    }

    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            cache: HashMap::new(),
        }
    }

    pub fn load(&mut self, basename: &str) -> Result<Rc<Vec<Rc<Record>>>> {
        if let Some(table) = self.cache.get(basename) {
            return Ok(table.clone());
        }
        let path = self.root.join(format!("{}.csv", basename));
        let file = File::open(&path).map_err(|e| {
            FrontendError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read \"{}\": {}", path.display(), e),
            ))
        })?;
        let table = Rc::new(read_table(file).map_err(|e| {
            FrontendError::Semantic(format!(
                "failed to parse \"{}\": {}",
                path.display(),
                e
            ))
        })?);
        self.cache.insert(basename.to_string(), table.clone());
        Ok(table)
    }

    /// Build a `MatchValue -> record` index over one column.  The first
    /// record wins on duplicate keys.  A row without the column is fatal.
    pub fn index(&mut self, basename: &str, column: i64) -> Result<ValueIndex> {
        let table = self.load(basename)?;
        let mut index = ValueIndex::new();
        for (row, record) in table.iter().enumerate() {
            if column < 0 || column as usize >= record.len() {
                return Err(FrontendError::Semantic(format!(
                    "failed to build index for \"{}.csv\"; row {} has no \
                     column {}",
                    basename, row, column
                )));
            }
            index
                .entry(record[column as usize].index_key())
                .or_insert_with(|| Some(record.clone()));
        }
        Ok(index)
    }
}

impl Default for CsvLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokenize a table with the csv reader; cell typing is applied per
/// field.  Rows may have differing lengths; the column check happens at
/// index-build time.
fn read_table<R: Read>(reader: R) -> std::result::Result<Vec<Rc<Record>>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if record.len() == 1 && record.iter().all(|field| field.is_empty()) {
            continue;
        }
        rows.push(Rc::new(
            record.iter().map(Cell::parse).collect::<Record>(),
        ));
    }
    Ok(rows)
}
