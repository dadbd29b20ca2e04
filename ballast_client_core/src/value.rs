//! Field values and column types.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{IncompatibleSnafu, TypeError};

/// Column types understood by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Varchar,
    Varbinary,
    Timestamp,
}

impl ColumnType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::TinyInt => "TINYINT",
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Float => "FLOAT",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Varbinary => "VARBINARY",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single field value supplied by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Float(f64),
    Varchar(String),
    Varbinary(Vec<u8>),
    /// Microseconds since the epoch.
    Timestamp(i64),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::TinyInt(_) => "tinyint",
            Value::SmallInt(_) => "smallint",
            Value::Integer(_) => "integer",
            Value::BigInt(_) => "bigint",
            Value::Float(_) => "float",
            Value::Varchar(_) => "varchar",
            Value::Varbinary(_) => "varbinary",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Coerces this value to the given column type.
    ///
    /// Identity and widening numeric coercions are supported; `Null` coerces
    /// to every column type. Anything else is a [`TypeError`].
    pub fn coerce_to(&self, column_type: ColumnType) -> Result<Value, TypeError> {
        use ColumnType as C;
        use Value as V;

        let coerced = match (self, column_type) {
            (V::Null, _) => V::Null,

            (V::TinyInt(v), C::TinyInt) => V::TinyInt(*v),
            (V::TinyInt(v), C::SmallInt) => V::SmallInt(*v as i16),
            (V::TinyInt(v), C::Integer) => V::Integer(*v as i32),
            (V::TinyInt(v), C::BigInt) => V::BigInt(*v as i64),
            (V::TinyInt(v), C::Float) => V::Float(*v as f64),

            (V::SmallInt(v), C::SmallInt) => V::SmallInt(*v),
            (V::SmallInt(v), C::Integer) => V::Integer(*v as i32),
            (V::SmallInt(v), C::BigInt) => V::BigInt(*v as i64),
            (V::SmallInt(v), C::Float) => V::Float(*v as f64),

            (V::Integer(v), C::Integer) => V::Integer(*v),
            (V::Integer(v), C::BigInt) => V::BigInt(*v as i64),
            (V::Integer(v), C::Float) => V::Float(*v as f64),

            (V::BigInt(v), C::BigInt) => V::BigInt(*v),
            (V::BigInt(v), C::Float) => V::Float(*v as f64),
            (V::BigInt(v), C::Timestamp) => V::Timestamp(*v),

            (V::Float(v), C::Float) => V::Float(*v),

            (V::Varchar(v), C::Varchar) => V::Varchar(v.clone()),
            (V::Varbinary(v), C::Varbinary) => V::Varbinary(v.clone()),
            (V::Timestamp(v), C::Timestamp) => V::Timestamp(*v),

            _ => {
                return IncompatibleSnafu {
                    column_type,
                    value_kind: self.kind(),
                }
                .fail()
            }
        };

        Ok(coerced)
    }

    /// Feeds a stable representation of this value into a hasher.
    ///
    /// Used by partition routing; floats hash by bit pattern.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            Value::Null => {}
            Value::TinyInt(v) => v.hash(state),
            Value::SmallInt(v) => v.hash(state),
            Value::Integer(v) => v.hash(state),
            Value::BigInt(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Varchar(v) => v.hash(state),
            Value::Varbinary(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_coercions() {
        assert_eq!(
            Value::TinyInt(7).coerce_to(ColumnType::BigInt).unwrap(),
            Value::BigInt(7)
        );
        assert_eq!(
            Value::Integer(-3).coerce_to(ColumnType::Float).unwrap(),
            Value::Float(-3.0)
        );
        assert_eq!(
            Value::BigInt(1_000).coerce_to(ColumnType::Timestamp).unwrap(),
            Value::Timestamp(1_000)
        );
    }

    #[test]
    fn identity_coercions() {
        assert_eq!(
            Value::Varchar("a".into())
                .coerce_to(ColumnType::Varchar)
                .unwrap(),
            Value::Varchar("a".into())
        );
        assert_eq!(
            Value::Float(1.5).coerce_to(ColumnType::Float).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn null_coerces_to_everything() {
        for ty in [
            ColumnType::TinyInt,
            ColumnType::Varchar,
            ColumnType::Timestamp,
        ] {
            assert_eq!(Value::Null.coerce_to(ty).unwrap(), Value::Null);
        }
    }

    #[test]
    fn narrowing_is_rejected() {
        assert!(Value::BigInt(1).coerce_to(ColumnType::Integer).is_err());
        assert!(Value::Varchar("x".into())
            .coerce_to(ColumnType::Integer)
            .is_err());
        assert!(Value::Float(1.0).coerce_to(ColumnType::BigInt).is_err());
    }
}
