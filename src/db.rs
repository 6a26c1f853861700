use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};

use crate::models::StudentState;

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str) -> Result<Db> {
    Ok(PgPoolOptions::new().max_connections(5).connect(url).await?)
}

/// Last writer wins: one row per learner, replaced whole.
pub async fn save_snapshot(db: &Db, state: &StudentState) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO progress_snapshots (student_id, snapshot, updated_at)
        VALUES ($1, $2, now())
        ON CONFLICT (student_id)
        DO UPDATE SET snapshot = EXCLUDED.snapshot, updated_at = now()
        "#,
    )
    .bind(&state.student_id)
    .bind(Json(state))
    .execute(db)
    .await?;
    Ok(())
}

pub async fn load_snapshot(db: &Db, student_id: &str) -> Result<Option<StudentState>, sqlx::Error> {
    let row: Option<(Json<StudentState>,)> =
        sqlx::query_as("SELECT snapshot FROM progress_snapshots WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(db)
            .await?;
    Ok(row.map(|(Json(state),)| state))
}
