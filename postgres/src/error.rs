//! sqlx error and row decoding helpers.

use loyalty_core::store::StoreError;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row};

/// Map a sqlx error, prefixing the failed operation.
pub(crate) fn store_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("{context}: {db}"))
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(format!("{context}: {e}")),
        sqlx::Error::RowNotFound => StoreError::NotFound(context.to_string()),
        _ => StoreError::Database(format!("{context}: {e}")),
    }
}

/// Decode one column, reporting the column name on failure.
pub(crate) fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {name}: {e}")))
}

/// Decode a non-negative `INTEGER` counter.
pub(crate) fn counter(row: &PgRow, name: &str) -> Result<u32, StoreError> {
    let value: i32 = column(row, name)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("column {name}: negative {value}")))
}

/// Saturating conversion for `LIMIT`/`OFFSET` binds.
pub(crate) fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Saturating conversion for `INTEGER` binds.
pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
