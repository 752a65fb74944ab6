use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use sfq_cluster::Span;
use sfq_common::{Result, SfqError};

/// Stable column identifier within one table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnId(pub u32);

/// Stable index identifier within one table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexId(pub u32);

/// One column of a table descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    /// Stable column id.
    pub id: ColumnId,
    /// Column name.
    pub name: String,
    /// Column value type.
    pub typ: DataType,
}

/// One index of a table descriptor.
///
/// `column_ids` lists the indexed columns in declared key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDesc {
    /// Stable index id.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Indexed column ids, in key order.
    pub column_ids: Vec<ColumnId>,
    /// The keyspace the index occupies.
    pub span: Span,
}

/// Table descriptor carried inside reader processor specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDesc {
    /// Table name.
    pub name: String,
    /// All table columns, in stored order.
    pub columns: Vec<ColumnDesc>,
    /// The primary index.
    pub primary_index: IndexDesc,
    /// Secondary indexes.
    pub indexes: Vec<IndexDesc>,
}

impl TableDesc {
    /// Resolves an index id to the reader's index selector: 0 for the
    /// primary index, i+1 for the i-th secondary index.
    pub fn index_idx(&self, index: IndexId) -> Result<usize> {
        if index == self.primary_index.id {
            return Ok(0);
        }
        self.indexes
            .iter()
            .position(|idx| idx.id == index)
            .map(|i| i + 1)
            .ok_or_else(|| {
                SfqError::Internal(format!(
                    "invalid scan index {:?} (table {})",
                    index, self.name
                ))
            })
    }

    /// Position of the column with id `col` in stored order.
    pub fn column_position(&self, col: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.id == col)
    }

    /// Looks up an index descriptor by id (primary or secondary).
    pub fn index(&self, id: IndexId) -> Option<&IndexDesc> {
        if self.primary_index.id == id {
            return Some(&self.primary_index);
        }
        self.indexes.iter().find(|idx| idx.id == id)
    }
}

/// One result column of a logical node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column value type.
    pub typ: DataType,
    /// Whether the column is elided from the node's visible output (used by
    /// join nodes for equality columns the query does not reference).
    #[serde(default)]
    pub omitted: bool,
}

impl Column {
    /// A visible column.
    pub fn new(name: impl Into<String>, typ: DataType) -> Self {
        Self {
            name: name.into(),
            typ,
            omitted: false,
        }
    }

    /// An omitted column.
    pub fn omitted(name: impl Into<String>, typ: DataType) -> Self {
        Self {
            name: name.into(),
            typ,
            omitted: true,
        }
    }
}
