//! Outbox 仓储
//!
//! 与画像变更同事务写入的外发事件行，由独立的中继进程异步投递到
//! 下游（中继不在本核心范围内）。

use serde_json::Value;
use sqlx::{PgConnection, Row};

use crate::error::Result;

/// 外发事件类型
pub mod event_types {
    pub const POINTS_AWARDED: &str = "loyalty.points.awarded.v1";
    pub const LEVEL_CHANGED: &str = "loyalty.level.changed.v1";
}

pub struct OutboxRepository;

impl OutboxRepository {
    /// 在事务中追加一行外发事件，返回行 ID
    pub async fn insert_in_tx(
        tx: &mut PgConnection,
        aggregate_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events (aggregate_id, event_type, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(aggregate_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(tx)
        .await?;

        Ok(row.get("id"))
    }
}
