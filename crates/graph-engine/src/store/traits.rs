//! 存储抽象
//!
//! 解释器通过这些 trait 访问规则、节点状态、画像与幂等账本，
//! 测试中以 mock/内存实现注入，无需真实数据库。

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::{AudienceFilter, GraphRule};
use crate::nodes::Effect;
use crate::profile::ProfileState;

/// 幂等账本的键：(操作, 规则, 用户) 三元组
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    pub operation_id: String,
    pub rule_id: i64,
    pub user_id: String,
}

impl ExecutionKey {
    pub fn new(operation_id: impl Into<String>, rule_id: i64, user_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            rule_id,
            user_id: user_id.into(),
        }
    }
}

/// 效果应用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// 本次应用成功，账本行已写入
    Applied { points: i64 },
    /// 账本中已存在同键记录（唯一约束吸收了重复），视为成功跳过
    AlreadyApplied,
    /// 规则执行计数已达上限，本次未应用
    ExecutionCapReached,
}

/// 规则读取
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// 绑定指定事件类型的活跃规则，按 priority 升序；
    /// 已达执行上限的规则被选择谓词永久排除
    async fn active_rules_for_event(&self, event_type: &str) -> Result<Vec<GraphRule>>;

    async fn rule_by_id(&self, rule_id: i64) -> Result<Option<GraphRule>>;

    /// 带调度规格（VariablesJson 含 `$schedule`）的活跃规则
    async fn schedulable_rules(&self) -> Result<Vec<GraphRule>>;
}

/// 节点级用户状态读写
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeStateStore: Send + Sync {
    async fn load(&self, rule_id: i64, user_id: &str, node_id: &str) -> Result<Option<Value>>;

    async fn save(&self, rule_id: i64, user_id: &str, node_id: &str, state: &Value) -> Result<()>;
}

/// 效果写入
///
/// `apply` 必须原子：账本插入（唯一约束兜底）、画像变更、
/// 执行计数递增、outbox 行，同一事务内全部成功或全部失败。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EffectWriter: Send + Sync {
    /// 快路径检查：该键是否已在账本中（命中则跳过整个图遍历）
    async fn is_applied(&self, key: &ExecutionKey) -> Result<bool>;

    async fn apply(&self, key: &ExecutionKey, effect: &Effect) -> Result<ApplyOutcome>;
}

/// 画像读取与受众查询
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudienceSource: Send + Sync {
    /// 加载单个用户画像（事件模式闸门）；用户可能还没有画像行
    async fn load_profile(&self, user_id: &str) -> Result<Option<ProfileState>>;

    /// 受众模式的匹配用户集，keyset 分页流式读取：
    /// 返回 user_id 升序、大于 `after_user` 的至多 `limit` 个用户
    async fn select_users<'a>(
        &self,
        filter: &AudienceFilter,
        after_user: Option<&'a str>,
        limit: i64,
    ) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_key_equality() {
        let a = ExecutionKey::new("op-1", 7, "u-001");
        let b = ExecutionKey::new("op-1", 7, "u-001");
        let c = ExecutionKey::new("op-1", 7, "u-002");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
