//! 用户画像模型
//!
//! 画像是本核心唯一的变更目标：积分余额、等级、标签。
//! 折扣不落库，由等级在读取时推导。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户画像行
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileState {
    pub user_id: String,
    pub level: String,
    pub tags: Vec<String>,
    pub points_balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileState {
    /// 由等级推导的折扣百分比
    ///
    /// 未知等级（运营自定义的等级名）不享受折扣。
    pub fn discount_percent(&self) -> u8 {
        match self.level.to_ascii_lowercase().as_str() {
            "base" => 5,
            "silver" => 10,
            "gold" => 15,
            "platinum" => 20,
            _ => 0,
        }
    }
}
