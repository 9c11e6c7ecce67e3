use std::time::Duration;

use sqlx::PgConnection;

use crate::domain::{truncate, Datapoint};

/// Create the `env` table when it does not exist yet.
pub async fn ensure_schema(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS env (
            ts   TIMESTAMPTZ      NOT NULL,
            wh   BIGINT           NOT NULL,
            degc DOUBLE PRECISION NOT NULL
        )
        "#,
    )
    .execute(conn)
    .await?;

    Ok(())
}

/// Insert a single reading, with its timestamp rounded down to `granularity`.
///
/// Callers batch these inside a transaction; pass `&mut *tx`.
pub async fn insert_datapoint(
    conn: &mut PgConnection,
    dp: &Datapoint,
    granularity: Duration,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO env (ts, wh, degc) VALUES ($1, $2, $3)")
        .bind(truncate(dp.time, granularity))
        .bind(dp.watt_hours)
        .bind(dp.temperature)
        .execute(conn)
        .await?;

    Ok(())
}
