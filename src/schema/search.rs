//! Full-text index descriptor.
//!
//! Entities with at least one `searchable` column get a RediSearch index over
//! HASH documents. The engine only describes the index and hands documents to
//! a [`DocumentPusher`]; query execution belongs to the search layer.
//!
//! ```text
//! FT.CREATE idx:User
//!   ON HASH
//!   PREFIX 1 3fa1c:doc:
//!   SCHEMA
//!     Name TEXT WEIGHT 2 SORTABLE
//!     Age NUMERIC SORTABLE
//!     Color TAG
//! ```

use async_trait::async_trait;

use super::field::{FieldDescriptor, FieldKind};
use super::value::Value;
use crate::error::OrmError;

/// Per-column full-text flags collected from the field builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFieldOptions {
    pub sortable: bool,
    pub no_index: bool,
    pub stem: bool,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFieldType {
    Text,
    Numeric,
    Tag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchField {
    pub name: String,
    /// Position among the schema's non-ID columns.
    pub position: usize,
    pub field_type: SearchFieldType,
    pub options: SearchFieldOptions,
}

impl SearchField {
    fn to_schema_args(&self) -> Vec<String> {
        let mut args = vec![self.name.clone()];
        args.push(
            match self.field_type {
                SearchFieldType::Text => "TEXT",
                SearchFieldType::Numeric => "NUMERIC",
                SearchFieldType::Tag => "TAG",
            }
            .to_string(),
        );
        if self.field_type == SearchFieldType::Text {
            if !self.options.stem {
                args.push("NOSTEM".to_string());
            }
            if let Some(weight) = self.options.weight {
                args.push("WEIGHT".to_string());
                args.push(weight.to_string());
            }
        }
        if self.options.sortable {
            args.push("SORTABLE".to_string());
        }
        if self.options.no_index {
            args.push("NOINDEX".to_string());
        }
        args
    }
}

/// Index layout for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchIndexDescriptor {
    pub name: String,
    /// Pool code of the RCACHE instance hosting the index.
    pub pool: String,
    /// Key prefix of the HASH documents.
    pub prefix: String,
    pub fields: Vec<SearchField>,
}

impl SearchIndexDescriptor {
    /// Collect searchable columns; `None` when the entity has none.
    pub(crate) fn from_fields(
        entity: &str,
        pool: &str,
        cache_prefix: &str,
        fields: &[FieldDescriptor],
    ) -> Option<Self> {
        let searchable: Vec<SearchField> = fields
            .iter()
            .enumerate()
            .filter_map(|(position, field)| {
                let options = field.search.clone()?;
                let field_type = match field.kind() {
                    FieldKind::String | FieldKind::Json => SearchFieldType::Text,
                    FieldKind::Enum(_) | FieldKind::Set(_) => SearchFieldType::Tag,
                    FieldKind::Bytes | FieldKind::Refs(_) => return None,
                    _ => SearchFieldType::Numeric,
                };
                Some(SearchField {
                    name: field.name().to_string(),
                    position,
                    field_type,
                    options,
                })
            })
            .collect();

        if searchable.is_empty() {
            return None;
        }
        Some(Self {
            name: format!("idx:{entity}"),
            pool: pool.to_string(),
            prefix: format!("{cache_prefix}:doc:"),
            fields: searchable,
        })
    }

    /// `FT.CREATE` arguments, index name first.
    pub fn ft_create_args(&self, namespace: Option<&str>) -> Vec<String> {
        let ns = namespace.map(|n| format!("{n}:")).unwrap_or_default();
        let mut args = vec![
            format!("{ns}{}", self.name),
            "ON".to_string(),
            "HASH".to_string(),
            "PREFIX".to_string(),
            "1".to_string(),
            format!("{ns}{}", self.prefix),
            "SCHEMA".to_string(),
        ];
        for field in &self.fields {
            args.extend(field.to_schema_args());
        }
        args
    }

    pub fn document_key(&self, id: u64) -> String {
        format!("{}{id}", self.prefix)
    }

    /// Document for one row; `values` are the row's non-ID columns.
    pub fn document(&self, id: u64, values: &[Value]) -> DocumentAdd {
        let fields = self
            .fields
            .iter()
            .filter_map(|field| {
                let value = values.get(field.position)?;
                document_value(value).map(|v| (field.name.clone(), v))
            })
            .collect();
        DocumentAdd {
            key: self.document_key(id),
            id,
            fields,
        }
    }
}

fn document_value(value: &Value) -> Option<String> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => u8::from(*b).to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Str(s) => s.clone(),
        Value::Set(members) => members.join(","),
        Value::Time(t) => t.to_string(),
        Value::Json(v) => v.to_string(),
        Value::Ref(r) => r.id().to_string(),
        Value::Bytes(_) | Value::Refs(_) => return None,
    })
}

/// Document-add command produced by the indexer.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentAdd {
    pub key: String,
    pub id: u64,
    pub fields: Vec<(String, String)>,
}

/// Receiver of indexer output.
#[async_trait]
pub trait DocumentPusher: Send {
    async fn push(&mut self, documents: Vec<DocumentAdd>) -> Result<(), OrmError>;
}
