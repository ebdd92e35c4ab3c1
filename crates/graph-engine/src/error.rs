//! 解释器错误类型

use loyalty_shared::error::LoyaltyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("图解析失败: {0}")]
    ParseError(String),

    #[error("变量无法解析: {0}")]
    UnresolvedVariable(String),

    #[error("图执行故障: rule_id={rule_id} {reason}")]
    GraphFault { rule_id: i64, reason: String },

    #[error("超过最大跳数: rule_id={rule_id} max={max}")]
    HopLimitExceeded { rule_id: i64, max: u32 },

    #[error("规则未找到: rule_id={0}")]
    RuleNotFound(i64),

    #[error("数据库错误: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("基础设施错误: {0}")]
    Shared(#[from] LoyaltyError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// 该错误是否只应中止当前规则的求值而不波及兄弟规则
    ///
    /// 映射/变量/图结构类故障是规则自身的问题；存储错误则说明
    /// 基础设施不可用，继续处理其余规则没有意义。
    pub fn is_rule_local(&self) -> bool {
        matches!(
            self,
            Self::ParseError(_)
                | Self::UnresolvedVariable(_)
                | Self::GraphFault { .. }
                | Self::HopLimitExceeded { .. }
        )
    }
}
