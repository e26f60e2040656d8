// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! DDL generation.
//!
//! Statements are only ever executed through the explicit alters passthrough
//! on the engine; nothing here touches a database.

use super::{EntitySchema, FieldDescriptor};
use crate::error::OrmError;
use crate::storage::sql::Dialect;

/// `CREATE TABLE` for an entity plus the statements that must follow it.
///
/// `target_table` resolves a referenced entity name to its table; references
/// it cannot resolve get no foreign key. On MySQL foreign keys are returned
/// as separate `ALTER TABLE` statements so tables can be created in any
/// order.
pub fn create_table(
    schema: &EntitySchema,
    target_table: impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    let table = schema.table();
    let dialect = schema.dialect();
    let mut statements = Vec::new();

    let mut lines = vec![match dialect {
        Dialect::MySql => "`ID` bigint(20) unsigned NOT NULL AUTO_INCREMENT".to_string(),
        Dialect::Sqlite => "`ID` INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
    }];
    lines.extend(schema.fields().iter().map(|f| f.column_definition(dialect)));

    let db_indexes = schema.indexes().iter().filter(|i| i.in_database);
    match dialect {
        Dialect::MySql => {
            for index in db_indexes {
                let kind = if index.unique { "UNIQUE INDEX" } else { "INDEX" };
                lines.push(format!("{kind} `{}` ({})", index.name, quote_list(&index.columns)));
            }
            lines.push("PRIMARY KEY (`ID`)".to_string());
            statements.push(format!(
                "CREATE TABLE `{table}` (\n  {}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                lines.join(",\n  ")
            ));
            for reference in schema.references() {
                if let Some(target) = target_table(&reference.target) {
                    statements.push(Alter::AddForeignKey {
                        table: table.to_string(),
                        column: reference.column.clone(),
                        target,
                    }
                    .render(dialect)
                    .unwrap_or_default());
                }
            }
        }
        Dialect::Sqlite => {
            for reference in schema.references() {
                if let Some(target) = target_table(&reference.target) {
                    lines.push(format!(
                        "FOREIGN KEY (`{}`) REFERENCES `{target}` (`ID`)",
                        reference.column
                    ));
                }
            }
            statements.push(format!("CREATE TABLE `{table}` (\n  {}\n)", lines.join(",\n  ")));
            for index in db_indexes {
                statements.push(create_sqlite_index(
                    table,
                    &index.name,
                    &index.columns,
                    index.unique,
                ));
            }
        }
    }
    statements.retain(|s| !s.is_empty());
    statements
}

fn quote_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQLite index names share one namespace per database.
fn sqlite_index_name(table: &str, index: &str) -> String {
    format!("{table}_{index}")
}

fn create_sqlite_index(table: &str, index: &str, columns: &[String], unique: bool) -> String {
    let kind = if unique { "UNIQUE INDEX" } else { "INDEX" };
    format!(
        "CREATE {kind} `{}` ON `{table}` ({})",
        sqlite_index_name(table, index),
        quote_list(columns)
    )
}

fn foreign_key_name(table: &str, column: &str) -> String {
    format!("fk_{table}_{column}")
}

/// One schema alteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Alter {
    AddColumn { table: String, column: FieldDescriptor },
    DropColumn { table: String, column: String },
    ModifyColumn { table: String, column: FieldDescriptor },
    AddIndex { table: String, index: String, columns: Vec<String>, unique: bool },
    DropIndex { table: String, index: String },
    AddForeignKey { table: String, column: String, target: String },
    DropForeignKey { table: String, column: String },
    DropTable { table: String },
}

impl Alter {
    pub fn render(&self, dialect: Dialect) -> Result<String, OrmError> {
        let unsupported = |what: &str| {
            Err(OrmError::InvalidArgument(format!("{what} is not supported on {dialect:?}")))
        };
        Ok(match self {
            Alter::AddColumn { table, column } => {
                format!("ALTER TABLE `{table}` ADD COLUMN {}", column.column_definition(dialect))
            }
            Alter::DropColumn { table, column } => {
                format!("ALTER TABLE `{table}` DROP COLUMN `{column}`")
            }
            Alter::ModifyColumn { table, column } => match dialect {
                Dialect::MySql => format!(
                    "ALTER TABLE `{table}` MODIFY COLUMN {}",
                    column.column_definition(dialect)
                ),
                Dialect::Sqlite => return unsupported("MODIFY COLUMN"),
            },
            Alter::AddIndex { table, index, columns, unique } => match dialect {
                Dialect::MySql => {
                    let kind = if *unique { "UNIQUE INDEX" } else { "INDEX" };
                    format!("ALTER TABLE `{table}` ADD {kind} `{index}` ({})", quote_list(columns))
                }
                Dialect::Sqlite => create_sqlite_index(table, index, columns, *unique),
            },
            Alter::DropIndex { table, index } => match dialect {
                Dialect::MySql => format!("ALTER TABLE `{table}` DROP INDEX `{index}`"),
                Dialect::Sqlite => format!("DROP INDEX `{}`", sqlite_index_name(table, index)),
            },
            Alter::AddForeignKey { table, column, target } => match dialect {
                Dialect::MySql => format!(
                    "ALTER TABLE `{table}` ADD CONSTRAINT `{}` \
                     FOREIGN KEY (`{column}`) REFERENCES `{target}` (`ID`)",
                    foreign_key_name(table, column)
                ),
                Dialect::Sqlite => return unsupported("ADD FOREIGN KEY"),
            },
            Alter::DropForeignKey { table, column } => match dialect {
                Dialect::MySql => format!(
                    "ALTER TABLE `{table}` DROP FOREIGN KEY `{}`",
                    foreign_key_name(table, column)
                ),
                Dialect::Sqlite => return unsupported("DROP FOREIGN KEY"),
            },
            Alter::DropTable { table } => format!("DROP TABLE `{table}`"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_support::compile;
    use crate::schema::{EntityDefinition, FieldKind};

    fn post() -> EntitySchema {
        let mut def = EntityDefinition::new("Post");
        def.field("Title", FieldKind::String).length(128).index("byTitle");
        def.field("Author", FieldKind::reference("User")).cached();
        compile(def)
    }

    #[test]
    fn test_sqlite_create_table() {
        let statements = create_table(&post(), |t| Some(t.to_string()));
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE `Post`"));
        assert!(statements[0].contains("`ID` INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(statements[0].contains("`Title` TEXT NOT NULL DEFAULT ''"));
        assert!(statements[0].contains("FOREIGN KEY (`Author`) REFERENCES `User` (`ID`)"));
        assert_eq!(statements[1], "CREATE INDEX `Post_byTitle` ON `Post` (`Title`)");
    }

    #[test]
    fn test_unresolved_reference_has_no_foreign_key() {
        let statements = create_table(&post(), |_| None);
        assert!(!statements[0].contains("FOREIGN KEY"));
    }

    #[test]
    fn test_alter_rendering() {
        let drop = Alter::DropIndex { table: "Post".into(), index: "byTitle".into() };
        assert_eq!(drop.render(Dialect::MySql).unwrap(), "ALTER TABLE `Post` DROP INDEX `byTitle`");
        assert_eq!(drop.render(Dialect::Sqlite).unwrap(), "DROP INDEX `Post_byTitle`");

        let fk = Alter::AddForeignKey {
            table: "Post".into(),
            column: "Author".into(),
            target: "User".into(),
        };
        assert_eq!(
            fk.render(Dialect::MySql).unwrap(),
            "ALTER TABLE `Post` ADD CONSTRAINT `fk_Post_Author` \
             FOREIGN KEY (`Author`) REFERENCES `User` (`ID`)"
        );
        assert!(fk.render(Dialect::Sqlite).is_err());
    }
}
