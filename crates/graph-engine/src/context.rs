//! 求值上下文
//!
//! 每次对 (规则, 用户, 操作) 的求值持有一个 `EvalContext`：
//! 变量作用域由 VariablesJson 常量播种，遍历过程中节点可以写入新变量
//! （如连续签到节点产出的奖励金额）；事实上下文来自触发器，
//! 通过点号路径只读访问。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use loyalty_shared::trigger::Trigger;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::model::ValueRef;

/// VariablesJson 中的保留键，存放调度规格，不进入变量作用域
pub const SCHEDULE_VARIABLE_KEY: &str = "$schedule";

/// 单次求值的上下文
#[derive(Debug, Clone)]
pub struct EvalContext {
    /// 当前用户（受众模式下逐用户替换）
    pub user_id: String,
    /// 事件发生时间，连续签到节点以它的 UTC 日历日为准
    pub occurred_at: DateTime<Utc>,
    facts: Value,
    scope: HashMap<String, Value>,
}

impl EvalContext {
    /// 为触发器的主体用户构建上下文
    pub fn new(trigger: &Trigger, variables: &Value) -> Self {
        Self::for_user(trigger, variables, &trigger.user_id)
    }

    /// 为指定用户构建上下文（受众模式）
    pub fn for_user(trigger: &Trigger, variables: &Value, user_id: &str) -> Self {
        let mut scope = HashMap::new();
        if let Value::Object(map) = variables {
            for (name, value) in map {
                if name == SCHEDULE_VARIABLE_KEY {
                    continue;
                }
                scope.insert(name.clone(), value.clone());
            }
        }

        let mut facts = trigger.fact_context();
        if let Value::Object(ref mut map) = facts {
            map.insert("user_id".to_string(), Value::String(user_id.to_string()));
        }

        Self {
            user_id: user_id.to_string(),
            occurred_at: trigger.occurred_at,
            facts,
            scope,
        }
    }

    /// 读取事实（点号路径，支持数组数字下标）
    pub fn fact(&self, path: &str) -> Option<&Value> {
        let mut current = &self.facts;
        for part in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// 写入变量（节点产出）
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.scope.insert(name.into(), value);
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.scope.get(name)
    }

    /// 解析值引用
    ///
    /// 解析失败返回 `UnresolvedVariable`——按错误处理约定，
    /// 这只中止当前规则对当前用户/操作的求值。
    pub fn resolve(&self, value_ref: &ValueRef) -> Result<Value> {
        match value_ref {
            ValueRef::Var(name) => self
                .var(name)
                .cloned()
                .ok_or_else(|| EngineError::UnresolvedVariable(format!("var:{name}"))),
            ValueRef::Fact(path) => self
                .fact(path)
                .cloned()
                .ok_or_else(|| EngineError::UnresolvedVariable(format!("path:{path}"))),
            ValueRef::Literal(value) => Ok(value.clone()),
        }
    }

    /// 解析为数值
    pub fn resolve_number(&self, value_ref: &ValueRef) -> Result<f64> {
        let value = self.resolve(value_ref)?;
        match &value {
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                EngineError::UnresolvedVariable(format!("数值超出可表示范围: {value}"))
            }),
            // 允许字符串形式的数字，生产方的信封里常见
            Value::String(s) => s.parse::<f64>().map_err(|_| {
                EngineError::UnresolvedVariable(format!("期望数值，实际为字符串: {s:?}"))
            }),
            other => Err(EngineError::UnresolvedVariable(format!(
                "期望数值，实际为: {other}"
            ))),
        }
    }

    /// 解析为整数（积分金额）
    pub fn resolve_points(&self, value_ref: &ValueRef) -> Result<i64> {
        let n = self.resolve_number(value_ref)?;
        Ok(n.trunc() as i64)
    }

    /// 解析为非空字符串（等级名）
    pub fn resolve_string(&self, value_ref: &ValueRef) -> Result<String> {
        let value = self.resolve(value_ref)?;
        match value {
            Value::String(s) if !s.is_empty() => Ok(s),
            other => Err(EngineError::UnresolvedVariable(format!(
                "期望非空字符串，实际为: {other}"
            ))),
        }
    }
}
