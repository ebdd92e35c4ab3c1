//! 节点语义
//!
//! 节点求值的裁决类型、终端效果以及连续签到节点的状态与奖励计算。
//! 有副作用的求值（画像读取、节点状态读写）由解释器驱动，
//! 这里只放纯逻辑，便于单测。

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 终端效果
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// 增加积分
    AwardPoints(i64),
    /// 设置等级
    SetLevel(String),
    /// `end` 节点：成功但无变更
    None,
}

impl Effect {
    /// 效果涉及的积分增量（账本的 points_applied 列）
    pub fn points(&self) -> i64 {
        match self {
            Self::AwardPoints(n) => *n,
            _ => 0,
        }
    }
}

/// 单个节点的求值裁决
#[derive(Debug, Clone, PartialEq)]
pub enum NodeVerdict {
    /// 沿布尔守卫边路由
    Route(bool),
    /// 无条件继续（受众闸门通过）
    Advance,
    /// 干净的不匹配终止（非故障，不写账本）
    NotMatched,
    /// 到达终端节点
    Terminal(Effect),
}

// ---------------------------------------------------------------------------
// 连续签到状态
// ---------------------------------------------------------------------------

/// 连续签到节点的持久状态，按 (rule, user, node) 存储
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreakState {
    /// 上次发放奖励的 UTC 日历日
    pub last_day: Option<NaiveDate>,
    /// 截至 last_day 的连续天数（含 last_day）
    pub run_length: i32,
}

/// 连续签到节点的单步判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum StreakStep {
    /// 当日已发放过，路由 false，状态不变
    AlreadyGrantedToday,
    /// 发放奖励，携带更新后的状态
    Grant { bonus: i64, state: StreakState },
}

/// 推进连续签到状态
///
/// 公式为 base + step × 已完成连续天数，封顶 cap；
/// 具体数值全部来自规则变量，这里不含任何运营常量。
pub fn advance_streak(
    state: &StreakState,
    today: NaiveDate,
    base: i64,
    step: i64,
    cap: i64,
) -> StreakStep {
    if state.last_day == Some(today) {
        return StreakStep::AlreadyGrantedToday;
    }

    let run_length = match state.last_day {
        Some(last) if last.succ_opt() == Some(today) => state.run_length + 1,
        _ => 1,
    };

    let bonus = (base + step * i64::from(run_length - 1)).min(cap);

    StreakStep::Grant {
        bonus,
        state: StreakState {
            last_day: Some(today),
            run_length,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_day_grants_base() {
        let step = advance_streak(&StreakState::default(), day("2026-03-01"), 10, 5, 50);
        assert_eq!(
            step,
            StreakStep::Grant {
                bonus: 10,
                state: StreakState {
                    last_day: Some(day("2026-03-01")),
                    run_length: 1,
                },
            }
        );
    }

    #[test]
    fn test_same_day_short_circuits() {
        let state = StreakState {
            last_day: Some(day("2026-03-01")),
            run_length: 1,
        };
        // 同一 UTC 日内第二次调用不再发放——账本之前就幂等
        assert_eq!(
            advance_streak(&state, day("2026-03-01"), 10, 5, 50),
            StreakStep::AlreadyGrantedToday
        );
    }

    #[test]
    fn test_next_day_increments() {
        let state = StreakState {
            last_day: Some(day("2026-03-01")),
            run_length: 1,
        };
        let step = advance_streak(&state, day("2026-03-02"), 10, 5, 50);
        assert_eq!(
            step,
            StreakStep::Grant {
                bonus: 15,
                state: StreakState {
                    last_day: Some(day("2026-03-02")),
                    run_length: 2,
                },
            }
        );
    }

    #[test]
    fn test_gap_resets_run() {
        let state = StreakState {
            last_day: Some(day("2026-03-01")),
            run_length: 7,
        };
        // 断签一天重新从 1 起算
        let step = advance_streak(&state, day("2026-03-03"), 10, 5, 50);
        assert!(matches!(
            step,
            StreakStep::Grant { bonus: 10, ref state } if state.run_length == 1
        ));
    }

    #[test]
    fn test_bonus_capped() {
        let state = StreakState {
            last_day: Some(day("2026-03-09")),
            run_length: 20,
        };
        let step = advance_streak(&state, day("2026-03-10"), 10, 5, 50);
        assert!(matches!(step, StreakStep::Grant { bonus: 50, .. }));
    }

    #[test]
    fn test_month_boundary_is_consecutive() {
        let state = StreakState {
            last_day: Some(day("2026-01-31")),
            run_length: 3,
        };
        let step = advance_streak(&state, day("2026-02-01"), 10, 5, 100);
        assert!(matches!(
            step,
            StreakStep::Grant { bonus: 25, ref state } if state.run_length == 4
        ));
    }

    #[test]
    fn test_streak_state_serde_roundtrip() {
        let state = StreakState {
            last_day: Some(day("2026-03-01")),
            run_length: 4,
        };
        let json = serde_json::to_value(&state).unwrap();
        let back: StreakState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_effect_points() {
        assert_eq!(Effect::AwardPoints(30).points(), 30);
        assert_eq!(Effect::SetLevel("base".into()).points(), 0);
        assert_eq!(Effect::None.points(), 0);
    }
}
