//! 调度服务错误类型

use graph_engine::error::EngineError;
use loyalty_shared::error::LoyaltyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("调度规格无效: {0}")]
    InvalidSchedule(String),

    #[error("基础设施错误: {0}")]
    Shared(#[from] LoyaltyError),

    #[error("解释器错误: {0}")]
    Engine(#[from] EngineError),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
