//! Conversion from decoded values to Rust types.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::ValueError;
use crate::value::{Numeric, SqlValue};

/// Types that can be read out of a [`SqlValue`].
pub trait FromSql: Sized {
    /// Convert a value. NULL is an error.
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError>;

    /// Convert a value, mapping NULL to `None`.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, ValueError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

fn mismatch<T>(value: &SqlValue, to: &'static str) -> Result<T, ValueError> {
    if value.is_null() {
        Err(ValueError::UnexpectedNull)
    } else {
        Err(ValueError::Conversion {
            from: value.type_name(),
            to,
        })
    }
}

macro_rules! integer_from_sql {
    ($($ty:ty),*) => {
        $(
            impl FromSql for $ty {
                fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
                    match value.as_i64().map(<$ty>::try_from) {
                        Some(Ok(v)) => Ok(v),
                        _ => mismatch(value, stringify!($ty)),
                    }
                }
            }
        )*
    };
}

integer_from_sql!(u8, i16, i32, i64);

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            _ => mismatch(value, "bool"),
        }
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Real(v) => Ok(*v),
            _ => mismatch(value, "f32"),
        }
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value.as_f64() {
            Some(v) => Ok(v),
            None => mismatch(value, "f64"),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value.as_str() {
            Some(v) => Ok(v.to_owned()),
            None => mismatch(value, "String"),
        }
    }
}

impl FromSql for Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Binary(v) | SqlValue::Udt(v) => Ok(v.clone()),
            _ => mismatch(value, "Bytes"),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        Bytes::from_sql(value).map(|b| b.to_vec())
    }
}

impl FromSql for Uuid {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Guid(v) => Ok(*v),
            _ => mismatch(value, "Uuid"),
        }
    }
}

impl FromSql for Numeric {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Numeric(v) => Ok(*v),
            _ => mismatch(value, "Numeric"),
        }
    }
}

impl FromSql for Decimal {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Numeric(n) => match n.to_decimal() {
                Some(d) => Ok(d),
                None => mismatch(value, "Decimal"),
            },
            SqlValue::Money(v) => Ok(Decimal::new(*v, 4)),
            SqlValue::SmallMoney(v) => Ok(Decimal::new(i64::from(*v), 4)),
            _ => mismatch(value, "Decimal"),
        }
    }
}

impl FromSql for NaiveDate {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Date(v) => Ok(*v),
            _ => mismatch(value, "NaiveDate"),
        }
    }
}

impl FromSql for NaiveTime {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::Time(v) => Ok(*v),
            _ => mismatch(value, "NaiveTime"),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::DateTime(v) | SqlValue::SmallDateTime(v) | SqlValue::DateTime2(v) => Ok(*v),
            _ => mismatch(value, "NaiveDateTime"),
        }
    }
}

impl FromSql for DateTime<FixedOffset> {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(*v),
            _ => mismatch(value, "DateTime<FixedOffset>"),
        }
    }
}

impl FromSql for DateTime<Utc> {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(v.with_timezone(&Utc)),
            _ => mismatch(value, "DateTime<Utc>"),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, ValueError> {
        T::from_sql_nullable(value)
    }
}
