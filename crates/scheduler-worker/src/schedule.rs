//! 调度规格与下次运行时间计算
//!
//! 规格存放在规则 VariablesJson 的保留键 `$schedule` 下：
//!
//! ```json
//! {"kind": "daily",  "time": "00:05", "utc_offset": 5}
//! {"kind": "weekly", "weekday": "mon", "time": "09:00", "utc_offset": 8}
//! {"kind": "cron",   "expr": "0 5 0 * * *"}
//! ```
//!
//! daily/weekly 以"本地时刻 + UTC 偏移"表达（运营按当地时间配置），
//! cron 直接用 6 字段表达式、按 UTC 求值。

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SchedulerError};

/// VariablesJson 中调度规格的保留键
pub const SCHEDULE_KEY: &str = "$schedule";

/// 调度规格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Daily {
        /// 本地时刻，"HH:MM"
        time: String,
        /// 本地时区相对 UTC 的小时偏移
        #[serde(default)]
        utc_offset: i32,
    },
    Weekly {
        /// 英文星期名或缩写（"mon" / "monday"）
        weekday: String,
        time: String,
        #[serde(default)]
        utc_offset: i32,
    },
    Cron {
        /// 6 字段 cron 表达式（秒 分 时 日 月 星期），UTC
        expr: String,
    },
}

impl ScheduleSpec {
    /// 从规则的 VariablesJson 解析；没有 `$schedule` 键返回 None
    pub fn from_variables(variables: &Value) -> Result<Option<Self>> {
        let Some(raw) = variables.get(SCHEDULE_KEY) else {
            return Ok(None);
        };

        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))
    }

    /// 严格晚于 `now` 的下一次运行时间（UTC）
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Daily { time, utc_offset } => {
                let (time, offset) = parse_local(time, *utc_offset)?;
                let local_now = now.with_timezone(&offset);

                let mut candidate = local_now
                    .date_naive()
                    .and_time(time)
                    .and_local_timezone(offset)
                    .single()
                    .ok_or_else(|| SchedulerError::InvalidSchedule("本地时刻不可表示".into()))?;
                if candidate <= local_now {
                    candidate += Duration::days(1);
                }
                Ok(candidate.with_timezone(&Utc))
            }

            Self::Weekly {
                weekday,
                time,
                utc_offset,
            } => {
                let target = Weekday::from_str(weekday).map_err(|_| {
                    SchedulerError::InvalidSchedule(format!("无法识别的星期名: {weekday}"))
                })?;
                let (time, offset) = parse_local(time, *utc_offset)?;
                let local_now = now.with_timezone(&offset);

                let mut candidate = local_now
                    .date_naive()
                    .and_time(time)
                    .and_local_timezone(offset)
                    .single()
                    .ok_or_else(|| SchedulerError::InvalidSchedule("本地时刻不可表示".into()))?;
                // 先对齐星期，再保证严格在未来
                while candidate.weekday() != target || candidate <= local_now {
                    candidate += Duration::days(1);
                }
                Ok(candidate.with_timezone(&Utc))
            }

            Self::Cron { expr } => {
                let schedule = cron::Schedule::from_str(expr).map_err(|e| {
                    SchedulerError::InvalidSchedule(format!("cron 表达式无效: {e}"))
                })?;
                schedule.after(&now).next().ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("cron 表达式没有未来触发点: {expr}"))
                })
            }
        }
    }
}

/// 解析 "HH:MM" 与小时偏移
fn parse_local(time: &str, utc_offset: i32) -> Result<(NaiveTime, FixedOffset)> {
    let time = NaiveTime::parse_from_str(time, "%H:%M")
        .map_err(|_| SchedulerError::InvalidSchedule(format!("时刻格式应为 HH:MM: {time}")))?;
    let offset = FixedOffset::east_opt(utc_offset * 3600)
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("UTC 偏移超界: {utc_offset}")))?;
    Ok((time, offset))
}

/// tick 的确定性操作 ID
///
/// 同一 (规则, tick 时刻) 永远得到同一 ID，配合任务表唯一约束，
/// 计划器重复运行也不会把同一个 tick 排两次。
pub fn tick_operation_id(rule_id: i64, run_at: DateTime<Utc>) -> String {
    format!("sched:{rule_id}:{}", run_at.format("%Y-%m-%dT%H:%MZ"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_daily_next_occurrence_across_offset() {
        // {daily, 00:05, UTC+5} 在 now=2026-01-01T10:00:00Z：
        // 本地 00:05 的下一次出现是本地 1 月 2 日，即 UTC 1 月 1 日 19:05
        let spec = ScheduleSpec::Daily {
            time: "00:05".to_string(),
            utc_offset: 5,
        };

        let next = spec.next_run_after(at("2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, at("2026-01-01T19:05:00Z"));
    }

    #[test]
    fn test_daily_today_still_in_future() {
        let spec = ScheduleSpec::Daily {
            time: "18:30".to_string(),
            utc_offset: 0,
        };

        let next = spec.next_run_after(at("2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, at("2026-01-01T18:30:00Z"));
    }

    #[test]
    fn test_daily_exact_now_rolls_to_tomorrow() {
        // 严格晚于 now：正好踩在时刻上要排到下一天
        let spec = ScheduleSpec::Daily {
            time: "10:00".to_string(),
            utc_offset: 0,
        };

        let next = spec.next_run_after(at("2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, at("2026-01-02T10:00:00Z"));
    }

    #[test]
    fn test_daily_negative_offset() {
        let spec = ScheduleSpec::Daily {
            time: "20:00".to_string(),
            utc_offset: -3,
        };

        // 本地（UTC-3）20:00 = UTC 23:00
        let next = spec.next_run_after(at("2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, at("2026-01-01T23:00:00Z"));
    }

    #[test]
    fn test_weekly_alignment() {
        // 2026-01-01 是周四；下一个周一是 1 月 5 日，09:00（UTC+8）= 01:00 UTC
        let spec = ScheduleSpec::Weekly {
            weekday: "mon".to_string(),
            time: "09:00".to_string(),
            utc_offset: 8,
        };

        let next = spec.next_run_after(at("2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, at("2026-01-05T01:00:00Z"));
    }

    #[test]
    fn test_cron_expression() {
        let spec = ScheduleSpec::Cron {
            expr: "0 5 0 * * *".to_string(),
        };

        let next = spec.next_run_after(at("2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(next, at("2026-01-02T00:05:00Z"));
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(
            ScheduleSpec::Daily {
                time: "25:99".to_string(),
                utc_offset: 0,
            }
            .next_run_after(Utc::now())
            .is_err()
        );
        assert!(
            ScheduleSpec::Weekly {
                weekday: "someday".to_string(),
                time: "09:00".to_string(),
                utc_offset: 0,
            }
            .next_run_after(Utc::now())
            .is_err()
        );
        assert!(
            ScheduleSpec::Cron {
                expr: "not a cron".to_string(),
            }
            .next_run_after(Utc::now())
            .is_err()
        );
    }

    #[test]
    fn test_from_variables() {
        let vars = json!({
            "streak_base": 10,
            "$schedule": {"kind": "daily", "time": "00:05", "utc_offset": 5}
        });

        let spec = ScheduleSpec::from_variables(&vars).unwrap().unwrap();
        assert_eq!(
            spec,
            ScheduleSpec::Daily {
                time: "00:05".to_string(),
                utc_offset: 5,
            }
        );

        // 无 $schedule 键
        assert_eq!(ScheduleSpec::from_variables(&json!({})).unwrap(), None);

        // 规格存在但不合法
        assert!(ScheduleSpec::from_variables(&json!({"$schedule": {"kind": "hourly"}})).is_err());
    }

    #[test]
    fn test_tick_operation_id_deterministic() {
        let run_at = at("2026-01-01T19:05:00Z");

        assert_eq!(tick_operation_id(42, run_at), "sched:42:2026-01-01T19:05Z");
        assert_eq!(tick_operation_id(42, run_at), tick_operation_id(42, run_at));
        assert_ne!(tick_operation_id(42, run_at), tick_operation_id(43, run_at));
    }
}
