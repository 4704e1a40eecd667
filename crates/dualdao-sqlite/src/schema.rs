use dualdao_core::{fields, DaoError, DaoResult};

/// Columns every entity table carries, in select order.
pub const RESERVED_COLUMNS: [&str; 5] = [
    fields::ID,
    fields::VERSION,
    fields::APP_VERSION,
    fields::CREATED_DATE,
    fields::UPDATED_DATE,
];

pub(crate) const COUNTERS_DDL: &str = "
    CREATE TABLE IF NOT EXISTS counters (
        _id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        seq INTEGER NOT NULL,
        version INTEGER NOT NULL
    );
";

/// Table layout for one logical type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    columns: Vec<String>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

impl TableSchema {
    /// Validates the table and column names; only plain identifiers are
    /// accepted since they are spliced into SQL.
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> DaoResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        if !is_identifier(&table) || table.eq_ignore_ascii_case("counters") {
            return Err(DaoError::validation(format!("invalid table name '{}'", table)));
        }
        let mut declared: Vec<String> = Vec::new();
        for column in columns {
            let column = column.into();
            if !is_identifier(&column) {
                return Err(DaoError::validation(format!("invalid column name '{}'", column)));
            }
            let clashes = RESERVED_COLUMNS
                .iter()
                .chain(std::iter::once(&fields::ENTITY_TYPE))
                .any(|r| r.eq_ignore_ascii_case(&column))
                || declared.iter().any(|c| c.eq_ignore_ascii_case(&column));
            if clashes {
                return Err(DaoError::validation(format!(
                    "column '{}' is reserved or declared twice",
                    column
                )));
            }
            declared.push(column);
        }
        Ok(Self {
            table,
            columns: declared,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared domain columns.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// True for reserved and declared columns.
    pub fn has_column(&self, name: &str) -> bool {
        RESERVED_COLUMNS.contains(&name) || self.columns.iter().any(|c| c == name)
    }

    pub(crate) fn all_columns(&self) -> impl Iterator<Item = &str> {
        RESERVED_COLUMNS
            .iter()
            .copied()
            .chain(self.columns.iter().map(String::as_str))
    }

    pub(crate) fn quoted_table(&self) -> String {
        quote(&self.table)
    }

    pub(crate) fn select_list(&self) -> String {
        self.all_columns().map(quote).collect::<Vec<_>>().join(", ")
    }

    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \"_id\" TEXT PRIMARY KEY,\n    \"version\" INTEGER NOT NULL,\n    \"appVersion\" TEXT,\n    \"createdDate\" TEXT NOT NULL,\n    \"updatedDate\" TEXT",
            self.quoted_table()
        );
        for column in &self.columns {
            sql.push_str(",\n    ");
            sql.push_str(&quote(column));
        }
        sql.push_str("\n)");
        sql
    }

    pub(crate) fn index_sql(&self, column: &str) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote(&format!("idx_{}_{}", self.table, column)),
            self.quoted_table(),
            quote(column)
        )
    }
}
