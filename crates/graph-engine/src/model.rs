//! 规则图领域模型
//!
//! `GraphRule` 是数据库行；`RuleGraph` 是其 `graph_json` 字段解析出的
//! 图结构。节点类型是封闭集合：序列化层以 `"kind"` 标签区分，
//! 解析一次即得强类型 AST，执行期不再做字符串分派。

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::profile::ProfileState;

// ---------------------------------------------------------------------------
// GraphRule — 数据库行
// ---------------------------------------------------------------------------

/// 工作流规则
///
/// 由外部管理面写入；本核心只读定义、回写 `executions_count`。
/// `executions_count` 单调递增且一旦设置了 `max_executions` 就不会越过它
/// （由存储层条件更新保证）。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GraphRule {
    pub id: i64,
    pub name: String,
    pub topic: String,
    pub event_type: String,
    pub priority: i32,
    pub is_active: bool,
    pub max_executions: Option<i32>,
    pub executions_count: i32,
    pub is_system: bool,
    pub system_key: Option<String>,
    pub graph_json: Value,
    pub variables_json: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphRule {
    /// 规则是否已达执行上限（达到后永久跳过）
    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_executions, Some(max) if self.executions_count >= max)
    }
}

// ---------------------------------------------------------------------------
// ValueRef — 值引用
// ---------------------------------------------------------------------------

/// 图内的值引用
///
/// 三种形态：
/// - `"var:name"` —— 取自规则的 VariablesJson 常量或上游节点产出的变量；
/// - `"path:expr"` —— 取自触发器事实上下文的点号路径；
/// - 其余任意 JSON 值 —— 字面量，原样使用。
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef {
    Var(String),
    Fact(String),
    Literal(Value),
}

impl ValueRef {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }
}

impl<'de> Deserialize<'de> for ValueRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if let Value::String(s) = &value {
            if let Some(name) = s.strip_prefix("var:") {
                if name.is_empty() {
                    return Err(D::Error::custom("var: 引用缺少变量名"));
                }
                return Ok(ValueRef::Var(name.to_string()));
            }
            if let Some(path) = s.strip_prefix("path:") {
                if path.is_empty() {
                    return Err(D::Error::custom("path: 引用缺少路径"));
                }
                return Ok(ValueRef::Fact(path.to_string()));
            }
        }
        Ok(ValueRef::Literal(value))
    }
}

impl Serialize for ValueRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ValueRef::Var(name) => serializer.serialize_str(&format!("var:{name}")),
            ValueRef::Fact(path) => serializer.serialize_str(&format!("path:{path}")),
            ValueRef::Literal(value) => value.serialize(serializer),
        }
    }
}

// ---------------------------------------------------------------------------
// 受众过滤器
// ---------------------------------------------------------------------------

/// 受众选择条件
///
/// 事件模式下作为闸门对当前用户判真/假；受众模式下作为查询条件
/// 产出匹配用户集。空过滤器匹配所有用户——包括尚无画像行的新用户。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudienceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_any: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_points: Option<i64>,
}

impl AudienceFilter {
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.tags_any.is_empty() && self.min_points.is_none()
    }

    /// 判断画像是否匹配；`None` 表示该用户还没有画像行
    pub fn matches(&self, profile: Option<&ProfileState>) -> bool {
        let Some(p) = profile else {
            // 无画像的用户只有空过滤器能匹配（典型场景：注册事件）
            return self.is_empty();
        };

        if let Some(level) = &self.level
            && !p.level.eq_ignore_ascii_case(level)
        {
            return false;
        }
        if !self.tags_any.is_empty() && !self.tags_any.iter().any(|t| p.tags.contains(t)) {
            return false;
        }
        if let Some(min) = self.min_points
            && p.points_balance < min
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// 节点与边
// ---------------------------------------------------------------------------

fn default_streak_output() -> String {
    "streak_bonus".to_string()
}

/// 节点行为（封闭集合）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// 闸门/集合产出节点
    AudienceSelector {
        #[serde(default)]
        filter: AudienceFilter,
    },
    /// 数值比较路由：fact >= threshold 走 true 边，否则走 false 边
    RangeSwitch { fact: ValueRef, threshold: ValueRef },
    /// 有状态的每日连续奖励节点
    StreakDaily {
        base: ValueRef,
        step: ValueRef,
        max: ValueRef,
        /// 奖励金额写入的变量名，供下游 award 节点引用
        #[serde(default = "default_streak_output")]
        output: String,
    },
    /// 终端：设置用户等级
    ActionUpdateProfile { set_level: ValueRef },
    /// 终端：增加积分
    Award { amount: ValueRef },
    /// 终端：无效果的成功标记
    End,
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::AudienceSelector { .. } => "audience_selector",
            Self::RangeSwitch { .. } => "range_switch",
            Self::StreakDaily { .. } => "streak_daily",
            Self::ActionUpdateProfile { .. } => "action_update_profile",
            Self::Award { .. } => "award",
            Self::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ActionUpdateProfile { .. } | Self::Award { .. } | Self::End
        )
    }
}

/// 图节点：ID + 行为
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(flatten)]
    pub behavior: NodeKind,
}

/// 有向边，`when` 为可选的布尔守卫
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<bool>,
}

/// 规则图：单一起点 + 节点 + 有向边
///
/// 图按约定无环（发布时由管理面校验）；执行期只用跳数上限防御。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGraph {
    pub start: String,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}
