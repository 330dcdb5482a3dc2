use serde::{Deserialize, Serialize};

/// A table the operator asked the agent to work with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Introspected schema of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// DDL-like text handed to the model as schema context.
    pub fn to_ddl(&self) -> String {
        let column_defs = self
            .columns
            .iter()
            .map(|col| {
                let data_type = if col.data_type.trim().is_empty() {
                    "ANY"
                } else {
                    col.data_type.as_str()
                };
                if col.nullable {
                    format!("  {} {}", col.name, data_type)
                } else {
                    format!("  {} {} NOT NULL", col.name, data_type)
                }
            })
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE {} (\n{}\n);", self.name, column_defs)
    }
}

/// Everything the index keeps about one configured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_name: String,
    pub description: String,
    pub schema_ddl: String,
}

impl TableMetadata {
    pub fn from_schema(info: &TableInfo, schema: &TableSchema) -> Self {
        Self {
            table_name: info.table_name.clone(),
            description: info.description.clone(),
            schema_ddl: schema.to_ddl(),
        }
    }

    /// Document id in the table index.
    pub fn document_id(&self) -> String {
        document_id(&self.table_name)
    }
}

pub fn document_id(table_name: &str) -> String {
    format!("{}_doc", table_name)
}
