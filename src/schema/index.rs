// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index and reference definitions.

use crate::storage::sql::Dialect;

/// A unique or non-unique index.
///
/// Indexes declared on fields exist in the database. A non-unique index may
/// additionally be `cached`, which keeps its id sets in RCACHE; a `single`
/// cached index is a one-result query served by an existing unique index and
/// has no database index of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    /// Positions of `columns` among the schema's non-ID fields.
    pub positions: Vec<usize>,
    pub unique: bool,
    pub cached: bool,
    pub single: bool,
    pub order_by: Vec<String>,
    pub order_positions: Vec<usize>,
    /// Whether a database index backs this definition.
    pub in_database: bool,
    /// `WHERE` template with one placeholder per column.
    pub where_clause: String,
    /// Positions whose change invalidates cached entries of this index.
    pub tracked: Vec<usize>,
}

impl IndexDefinition {
    pub fn is_tracking(&self, position: usize) -> bool {
        self.tracked.contains(&position)
    }

    /// One comparison per `(column, admits_null)`. Columns that can hold
    /// NULL compare null-safely so a NULL attribute matches NULL rows.
    pub(crate) fn build_where(
        dialect: Dialect,
        columns: &[(&str, bool)],
        fake_delete: bool,
    ) -> String {
        let null_safe = match dialect {
            Dialect::MySql => "<=>",
            Dialect::Sqlite => "IS",
        };
        let mut parts: Vec<String> = columns
            .iter()
            .map(|(c, admits_null)| {
                let op = if *admits_null { null_safe } else { "=" };
                format!("`{c}` {op} ?")
            })
            .collect();
        if fake_delete {
            parts.push("`FakeDelete` = 0".to_string());
        }
        parts.join(" AND ")
    }

    pub(crate) fn order_clause(&self) -> String {
        if self.order_by.is_empty() {
            "ORDER BY `ID`".to_string()
        } else {
            let cols: Vec<String> = self.order_by.iter().map(|c| format!("`{c}`")).collect();
            format!("ORDER BY {}", cols.join(", "))
        }
    }
}

/// A single-reference column pointing at another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDefinition {
    pub column: String,
    pub position: usize,
    pub target: String,
    /// Keep the list of referencing ids per parent in the caches.
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_with_fake_delete() {
        let cols = [("Age", false), ("Name", false)];
        assert_eq!(
            IndexDefinition::build_where(Dialect::MySql, &cols, true),
            "`Age` = ? AND `Name` = ? AND `FakeDelete` = 0"
        );
        assert_eq!(IndexDefinition::build_where(Dialect::MySql, &cols[..1], false), "`Age` = ?");
    }

    #[test]
    fn test_nullable_columns_compare_null_safely() {
        let cols = [("Age", false), ("Nick", true)];
        assert_eq!(
            IndexDefinition::build_where(Dialect::MySql, &cols, false),
            "`Age` = ? AND `Nick` <=> ?"
        );
        assert_eq!(
            IndexDefinition::build_where(Dialect::Sqlite, &cols, false),
            "`Age` = ? AND `Nick` IS ?"
        );
    }
}
