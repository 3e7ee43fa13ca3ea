use indexmap::IndexMap;
use serde_json::{Map, Value};

/// One row keyed by column name, in column insertion order.
pub type Record = Map<String, Value>;

/// A tabular record set. Rows may carry different column subsets; the
/// column order is the order in which columns are first seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<Record>,
}

impl Table {
    pub fn new(rows: Vec<Record>) -> Self {
        Table { rows }
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Record> {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn append(&mut self, other: Table) {
        self.rows.extend(other.rows);
    }

    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.rows.iter().any(|r| r.contains_key(name))
    }

    /// Values of one column, `Null` where a row lacks it.
    pub fn column(&self, name: &str) -> Vec<&Value> {
        self.rows
            .iter()
            .map(|r| r.get(name).unwrap_or(&Value::Null))
            .collect()
    }
}

impl FromIterator<Record> for Table {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Table {
            rows: iter.into_iter().collect(),
        }
    }
}

/// Result of extracting one source: a single table, or one table per
/// iterator id for sources fetched over a fixed iterator set.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Table(Table),
    Iterated(IndexMap<String, Table>),
}

impl Extracted {
    pub fn empty() -> Self {
        Extracted::Table(Table::default())
    }

    pub fn len(&self) -> usize {
        match self {
            Extracted::Table(t) => t.len(),
            Extracted::Iterated(map) => map.values().map(Table::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Extracted::Table(t) => Some(t),
            Extracted::Iterated(_) => None,
        }
    }

    /// All rows in one table, iterator tables concatenated in order.
    pub fn to_table(&self) -> Table {
        match self {
            Extracted::Table(t) => t.clone(),
            Extracted::Iterated(map) => {
                let mut all = Table::default();
                for t in map.values() {
                    all.append(t.clone());
                }
                all
            }
        }
    }
}
