//! 触发器模型
//!
//! `Trigger` 是一条入站消息经映射后的规范化内部表示，也是定时任务
//! 触发规则评估时的载体。它是短暂对象，不落库——审计由入站审计表
//! 负责，幂等由执行账本负责。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 定时规则绑定的伪事件类型
///
/// 定时规则不对应任何真实 topic，统一绑定到此标识，
/// 解释器按它选取受众模式的规则。
pub const CRON_EVENT_TYPE: &str = "loyalty.scheduler.cron";

/// 规范化触发器
///
/// 每条入站消息由映射器产出恰好一个 Trigger；定时驱动器为每个到期
/// tick 合成一个 user_id 为空的受众触发器。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// 事件类型标识，如 `users.user.created.v1`
    pub event_type: String,
    /// 主体用户 ID（事件模式下非空）
    pub user_id: String,
    /// 操作 ID——幂等账本的第一维键，字节级重放必得同一值
    pub operation_id: String,
    /// 按 Schema 提示提取的元数据
    pub metadata: Value,
    /// 原始负载（受保留开关控制，可为 None）
    pub raw_payload: Option<Value>,
    /// 来源（topic 或调度器标识）
    pub source: String,
    pub occurred_at: DateTime<Utc>,
}

impl Trigger {
    /// 将触发器转换为 `path:` 引用的事实上下文 JSON
    ///
    /// 图节点通过 `path:metadata.amount` 这样的表达式引用事实，
    /// 此方法把信封元数据与 metadata 合并为一棵树供路径解析。
    pub fn fact_context(&self) -> Value {
        serde_json::json!({
            "event_type": self.event_type,
            "user_id": self.user_id,
            "operation_id": self.operation_id,
            "source": self.source,
            "occurred_at": self.occurred_at.to_rfc3339(),
            "metadata": self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trigger() -> Trigger {
        Trigger {
            event_type: "users.user.created.v1".to_string(),
            user_id: "u-001".to_string(),
            operation_id: "op-123".to_string(),
            metadata: serde_json::json!({"department": "engineering", "amount": 250}),
            raw_payload: None,
            source: "users.user.events".to_string(),
            occurred_at: DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_fact_context_shape() {
        let ctx = sample_trigger().fact_context();

        assert_eq!(ctx["user_id"], "u-001");
        assert_eq!(ctx["event_type"], "users.user.created.v1");
        assert_eq!(ctx["metadata"]["amount"], 250);
        assert_eq!(ctx["occurred_at"], "2026-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_trigger_serialization_camel_case() {
        let json = serde_json::to_string(&sample_trigger()).unwrap();
        assert!(json.contains("eventType"));
        assert!(json.contains("operationId"));
        assert!(json.contains("occurredAt"));
    }
}
