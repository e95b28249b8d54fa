//! Result-set rows and their column metadata.
use std::sync::Arc;

use crate::common::ByteStr;

/// One column of a [`RowDescription`][crate::postgres::backend::BackendMessage::RowDescription].
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table, the object ID of the
    /// table; otherwise zero.
    pub table_oid: i32,
    /// If the field can be identified as a column of a specific table, the attribute number of
    /// the column; otherwise zero.
    pub column_attr_num: i16,
    /// The object ID of the field's data type.
    pub data_type_oid: i32,
    /// The data type size (negative values denote variable-width types).
    pub data_type_size: i16,
    /// The type modifier, type-specific.
    pub type_modifier: i32,
    /// The format code used for the field: 0 is text, 1 is binary. Only text is decoded.
    pub format: i16,
}

impl FieldDescriptor {
    /// `true` for the only format this core decodes.
    pub fn is_text(&self) -> bool {
        self.format == 0
    }
}

/// A single value of a [`Row`]: either UTF-8 text or SQL `NULL`.
///
/// This core never sees binary-format values: the simple query protocol always asks the
/// server for text, so [`FieldDescriptor::format`] is `0` in practice; decoding anything else
/// is out of scope (see the crate's binary-format non-goal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(ByteStr),
    Null,
}

impl Value {
    /// Borrow the value as `&str`, or `None` for `NULL`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Null => None,
        }
    }

    /// `true` if this is SQL `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One row of a query result.
///
/// Represented as a positional vector of [`Value`]s plus a shared [`FieldDescriptor`] index,
/// rather than a name-keyed map: `SELECT 1 AS x, 2 AS x` legitimately produces two columns
/// named `x`, and collapsing them into one map entry would silently drop a column. [`Row::get`]
/// by name returns the first match, matching how most callers index result sets; [`Row::iter`]
/// exposes every column, duplicates included.
#[derive(Debug, Clone)]
pub struct Row {
    fields: Arc<[FieldDescriptor]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(fields: Arc<[FieldDescriptor]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(fields.len(), values.len());
        Self { fields, values }
    }

    /// The field descriptors for this row's columns, shared with every other row of the same
    /// result set.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` if this row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a column by position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a column by name, returning the first match when the name is duplicated.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self.fields.iter().position(|f| &*f.name == name)?;
        self.values.get(index)
    }

    /// Iterate over `(name, value)` pairs in column order, duplicates included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|f| f.name.as_str()).zip(self.values.iter())
    }

    /// Consume the row into its positional values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> FieldDescriptor {
        FieldDescriptor {
            name: ByteStr::copy_from_str(name),
            table_oid: 0,
            column_attr_num: 0,
            data_type_oid: 25,
            data_type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }

    #[test]
    fn duplicate_column_names_are_preserved() {
        let fields: Arc<[FieldDescriptor]> = Arc::from(vec![field("x"), field("x")]);
        let row = Row::new(
            fields,
            vec![
                Value::Text(ByteStr::copy_from_str("1")),
                Value::Text(ByteStr::copy_from_str("2")),
            ],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0).unwrap().as_str(), Some("1"));
        assert_eq!(row.get(1).unwrap().as_str(), Some("2"));
        // name lookup returns the first match, never silently overwritten
        assert_eq!(row.get_by_name("x").unwrap().as_str(), Some("1"));

        let pairs: Vec<_> = row.iter().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "x");
        assert_eq!(pairs[1].0, "x");
    }

    #[test]
    fn null_value() {
        let fields: Arc<[FieldDescriptor]> = Arc::from(vec![field("a")]);
        let row = Row::new(fields, vec![Value::Null]);
        assert!(row.get(0).unwrap().is_null());
        assert_eq!(row.get(0).unwrap().as_str(), None);
    }
}
