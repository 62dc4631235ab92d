//! # tds-values
//!
//! SQL value codec for the TDS engine.
//!
//! Decoding is driven by a column's [`TypeInfo`](tds_protocol::TypeInfo):
//! the length class selects how the length prefix is read, the null
//! conventions decide whether a value follows, and the type id selects the
//! data layout. Large values arrive as PLP chunks; [`PlpReader`] takes them
//! incrementally so a row can span many packets.
//!
//! ## Type Mappings
//!
//! | SQL Server Type | [`SqlValue`] variant | Rust type |
//! |-----------------|----------------------|-----------|
//! | `BIT` | `Bool` | `bool` |
//! | `TINYINT` | `TinyInt` | `u8` |
//! | `SMALLINT` / `INT` / `BIGINT` | `SmallInt` / `Int` / `BigInt` | `i16` / `i32` / `i64` |
//! | `REAL` / `FLOAT` | `Real` / `Float` | `f32` / `f64` |
//! | `DECIMAL` / `NUMERIC` | `Numeric` | [`Numeric`], `rust_decimal::Decimal` |
//! | `MONEY` / `SMALLMONEY` | `Money` / `SmallMoney` | ten-thousandths |
//! | `[N]CHAR` / `[N]VARCHAR` / `[N]TEXT` | `String` | `String` |
//! | `BINARY` / `VARBINARY` / `IMAGE` | `Binary` | `bytes::Bytes` |
//! | `UNIQUEIDENTIFIER` | `Guid` | `uuid::Uuid` |
//! | `DATE` / `TIME` | `Date` / `Time` | `chrono::NaiveDate` / `chrono::NaiveTime` |
//! | `DATETIME` / `SMALLDATETIME` / `DATETIME2` | `DateTime` / `SmallDateTime` / `DateTime2` | `chrono::NaiveDateTime` |
//! | `DATETIMEOFFSET` | `DateTimeOffset` | `chrono::DateTime<FixedOffset>` |
//! | `XML` | `Xml` | `String` |
//! | `SQL_VARIANT` | base type's variant | |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod decode;
pub mod encode;
pub mod error;
pub mod from_sql;
pub mod normalize;
pub mod plp;
pub mod temporal;
pub mod value;
pub mod variant;

pub use decode::{ValueLength, decode_value, read_value_length, skip_value};
pub use encode::{encode_type_info, encode_value, param_type_info};
pub use error::{DecodeError, DecodeResult, ValueError};
pub use from_sql::FromSql;
pub use normalize::{denormalize, normalize};
pub use plp::{PlpMode, PlpReader, PlpValue};
pub use value::{Numeric, SqlValue};
