//! 规则图解释器
//!
//! 事件模式：一条触发器 → 绑定该事件类型的活跃规则按优先级逐条求值。
//! 受众模式：定时 tick → 起始受众节点给出匹配用户集 → 逐用户独立求值。
//!
//! 幂等协定：求值前先查账本快路径；终端效果经 `EffectWriter` 原子落地，
//! 并发重放由存储层唯一约束吸收。单条规则的故障（变量缺失、图结构
//! 问题）只中止该规则对该用户/操作的求值，不影响兄弟规则和其他用户。

use std::sync::Arc;

use chrono::Utc;
use loyalty_shared::trigger::{CRON_EVENT_TYPE, Trigger};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::compiler::{CompiledRule, GraphCache};
use crate::context::EvalContext;
use crate::error::{EngineError, Result};
use crate::model::{GraphRule, NodeDef, NodeKind};
use crate::nodes::{Effect, NodeVerdict, StreakState, StreakStep, advance_streak};
use crate::store::{ApplyOutcome, AudienceSource, EffectWriter, ExecutionKey, NodeStateStore, RuleSource};

// ---------------------------------------------------------------------------
// 配置与结果类型
// ---------------------------------------------------------------------------

/// 解释器配置
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// 单次遍历的跳数上限，防御误配置成环的图
    pub max_hops: u32,
    /// 受众模式 keyset 分页的页大小
    pub audience_page_size: i64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_hops: 64,
            audience_page_size: 500,
        }
    }
}

impl From<&loyalty_shared::config::EngineConfig> for InterpreterConfig {
    fn from(config: &loyalty_shared::config::EngineConfig) -> Self {
        Self {
            max_hops: config.max_hops,
            audience_page_size: config.audience_page_size,
        }
    }
}

/// 单条规则对单个用户/操作的求值结果
#[derive(Debug, Clone, PartialEq)]
pub enum RuleStatus {
    /// 效果已应用，账本行已写入
    Applied,
    /// 账本已有同键记录，跳过
    AlreadyApplied,
    /// 图遍历以不匹配结束，无效果
    NotMatched,
    /// 规则执行计数已达上限
    CapReached,
    /// 规则级故障（变量缺失、图结构问题），只影响本条规则
    Faulted,
}

/// 规则求值明细
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub rule_id: i64,
    pub rule_name: String,
    pub user_id: String,
    pub status: RuleStatus,
    pub points: i64,
    pub error: Option<String>,
}

/// 一条触发器的整体处理结果
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub operation_id: String,
    pub outcomes: Vec<RuleOutcome>,
}

impl TriggerOutcome {
    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == RuleStatus::Applied)
            .count()
    }

    pub fn total_points(&self) -> i64 {
        self.outcomes.iter().map(|o| o.points).sum()
    }

    pub fn fault_messages(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_deref())
            .collect()
    }
}

/// 受众模式（定时 tick）的整体结果
#[derive(Debug, Clone, Default)]
pub struct AudienceOutcome {
    pub rule_id: i64,
    pub operation_id: String,
    pub users_matched: u64,
    pub users_applied: u64,
    pub users_skipped: u64,
    pub total_points: i64,
    /// tick 执行中途规则计数打满，剩余用户未处理
    pub cap_reached: bool,
    pub errors: Vec<String>,
}

/// 一次图遍历的终点
enum WalkEnd {
    Terminal(Effect),
    NotMatched,
}

// ---------------------------------------------------------------------------
// RuleInterpreter
// ---------------------------------------------------------------------------

/// 规则图解释器
///
/// 存储依赖全部走 trait 注入；编译缓存随解释器实例存活，
/// 规则 `updated_at` 变化时自动重编译。
pub struct RuleInterpreter {
    rules: Arc<dyn RuleSource>,
    states: Arc<dyn NodeStateStore>,
    effects: Arc<dyn EffectWriter>,
    audience: Arc<dyn AudienceSource>,
    cache: GraphCache,
    config: InterpreterConfig,
}

impl RuleInterpreter {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        states: Arc<dyn NodeStateStore>,
        effects: Arc<dyn EffectWriter>,
        audience: Arc<dyn AudienceSource>,
        config: InterpreterConfig,
    ) -> Self {
        Self {
            rules,
            states,
            effects,
            audience,
            cache: GraphCache::new(),
            config,
        }
    }

    // -----------------------------------------------------------------------
    // 事件模式
    // -----------------------------------------------------------------------

    /// 处理一条触发器
    ///
    /// 规则级故障被就地吸收并记入结果；基础设施错误（存储不可用）
    /// 向上传播，由调用方决定不提交位点以待重投。
    #[instrument(skip(self, trigger), fields(
        event_type = %trigger.event_type,
        operation_id = %trigger.operation_id,
        user_id = %trigger.user_id,
    ))]
    pub async fn handle_trigger(&self, trigger: &Trigger) -> Result<TriggerOutcome> {
        let rules = self.rules.active_rules_for_event(&trigger.event_type).await?;

        debug!(rules = rules.len(), "已加载活跃规则");

        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in &rules {
            match self.evaluate_for_user(rule, trigger, &trigger.user_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_rule_local() => {
                    // 故障隔离：本条规则中止，兄弟规则继续
                    warn!(rule_id = rule.id, error = %e, "规则求值故障，跳过该规则");
                    outcomes.push(RuleOutcome {
                        rule_id: rule.id,
                        rule_name: rule.name.clone(),
                        user_id: trigger.user_id.clone(),
                        status: RuleStatus::Faulted,
                        points: 0,
                        error: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let outcome = TriggerOutcome {
            operation_id: trigger.operation_id.clone(),
            outcomes,
        };

        info!(
            rules = rules.len(),
            applied = outcome.applied_count(),
            points = outcome.total_points(),
            "触发器处理完成"
        );

        Ok(outcome)
    }

    /// 对单个 (规则, 用户) 求值并应用
    async fn evaluate_for_user(
        &self,
        rule: &GraphRule,
        trigger: &Trigger,
        user_id: &str,
    ) -> Result<RuleOutcome> {
        let outcome = |status, points, error| RuleOutcome {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            user_id: user_id.to_string(),
            status,
            points,
            error,
        };

        // 选择查询已排除达上限的规则，这里兜底并发窗口
        if rule.is_exhausted() {
            return Ok(outcome(RuleStatus::CapReached, 0, None));
        }

        let key = ExecutionKey::new(&trigger.operation_id, rule.id, user_id);

        // 幂等快路径：命中则不再走图
        if self.effects.is_applied(&key).await? {
            debug!(rule_id = rule.id, "账本命中，跳过图遍历");
            return Ok(outcome(RuleStatus::AlreadyApplied, 0, None));
        }

        let compiled = self.cache.get_or_compile(rule)?;
        let mut ctx = EvalContext::for_user(trigger, &rule.variables_json, user_id);

        let start_id = compiled.graph.start.clone();
        match self.walk(&compiled, &mut ctx, &start_id).await? {
            WalkEnd::NotMatched => Ok(outcome(RuleStatus::NotMatched, 0, None)),
            WalkEnd::Terminal(effect) => match self.effects.apply(&key, &effect).await? {
                ApplyOutcome::Applied { points } => Ok(outcome(RuleStatus::Applied, points, None)),
                ApplyOutcome::AlreadyApplied => Ok(outcome(RuleStatus::AlreadyApplied, 0, None)),
                ApplyOutcome::ExecutionCapReached => Ok(outcome(RuleStatus::CapReached, 0, None)),
            },
        }
    }

    // -----------------------------------------------------------------------
    // 受众模式
    // -----------------------------------------------------------------------

    /// 以受众模式执行一条规则（定时 tick）
    ///
    /// 每个匹配用户共享 tick 的 OperationId，账本键按用户独立，
    /// 中途崩溃后重跑同一 OperationId 会跳过已处理的用户。
    #[instrument(skip(self))]
    pub async fn run_audience(&self, rule_id: i64, operation_id: &str) -> Result<AudienceOutcome> {
        let rule = self
            .rules
            .rule_by_id(rule_id)
            .await?
            .ok_or(EngineError::RuleNotFound(rule_id))?;

        let mut outcome = AudienceOutcome {
            rule_id,
            operation_id: operation_id.to_string(),
            ..Default::default()
        };

        if !rule.is_active || rule.is_exhausted() {
            info!(rule_id, "规则非活跃或已达上限，tick 空转");
            return Ok(outcome);
        }

        let compiled = self.cache.get_or_compile(&rule)?;

        let start = compiled.start_node();
        let NodeKind::AudienceSelector { filter } = &start.behavior else {
            return Err(EngineError::GraphFault {
                rule_id,
                reason: format!(
                    "受众模式要求起始节点为 audience_selector，实际为 {}",
                    start.behavior.kind_name()
                ),
            });
        };
        let filter = filter.clone();

        // 受众选择节点的通过边即逐用户遍历的起点
        let continuation = {
            let edges = compiled.edges_from(&start.id);
            edges
                .iter()
                .find(|e| e.when == Some(true))
                .or_else(|| edges.iter().find(|e| e.when.is_none()))
                .map(|e| e.to.clone())
                .ok_or_else(|| EngineError::GraphFault {
                    rule_id,
                    reason: format!("受众选择节点 {} 没有通过边", start.id),
                })?
        };

        // tick 合成触发器：受众模式下主体用户逐个替换
        let tick = Trigger {
            event_type: CRON_EVENT_TYPE.to_string(),
            user_id: String::new(),
            operation_id: operation_id.to_string(),
            metadata: json!({}),
            raw_payload: None,
            source: "scheduler".to_string(),
            occurred_at: Utc::now(),
        };

        let mut after: Option<String> = None;
        'pages: loop {
            let users = self
                .audience
                .select_users(&filter, after.as_deref(), self.config.audience_page_size)
                .await?;
            if users.is_empty() {
                break;
            }

            for user_id in &users {
                outcome.users_matched += 1;

                let key = ExecutionKey::new(operation_id, rule_id, user_id);
                if self.effects.is_applied(&key).await? {
                    outcome.users_skipped += 1;
                    continue;
                }

                let mut ctx = EvalContext::for_user(&tick, &rule.variables_json, user_id);
                match self.walk(&compiled, &mut ctx, &continuation).await {
                    Ok(WalkEnd::NotMatched) => {}
                    Ok(WalkEnd::Terminal(effect)) => {
                        match self.effects.apply(&key, &effect).await? {
                            ApplyOutcome::Applied { points } => {
                                outcome.users_applied += 1;
                                outcome.total_points += points;
                            }
                            ApplyOutcome::AlreadyApplied => outcome.users_skipped += 1,
                            ApplyOutcome::ExecutionCapReached => {
                                outcome.cap_reached = true;
                                break 'pages;
                            }
                        }
                    }
                    // 单用户故障不影响受众中的其他用户
                    Err(e) if e.is_rule_local() => {
                        warn!(rule_id, user_id = %user_id, error = %e, "受众用户求值故障");
                        outcome.errors.push(format!("{user_id}: {e}"));
                    }
                    Err(e) => return Err(e),
                }
            }

            if users.len() < self.config.audience_page_size as usize {
                break;
            }
            after = users.last().cloned();
        }

        info!(
            rule_id,
            matched = outcome.users_matched,
            applied = outcome.users_applied,
            skipped = outcome.users_skipped,
            points = outcome.total_points,
            "受众 tick 执行完成"
        );

        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // 图遍历
    // -----------------------------------------------------------------------

    /// 从指定节点遍历到终点
    async fn walk(
        &self,
        compiled: &CompiledRule,
        ctx: &mut EvalContext,
        start_id: &str,
    ) -> Result<WalkEnd> {
        let rule_id = compiled.id();
        let mut current = compiled.node(start_id).ok_or_else(|| EngineError::GraphFault {
            rule_id,
            reason: format!("遍历起点不存在: {start_id}"),
        })?;

        for _hop in 0..self.config.max_hops {
            let verdict = self.evaluate_node(current, compiled, ctx).await?;

            let route = match verdict {
                NodeVerdict::Terminal(effect) => return Ok(WalkEnd::Terminal(effect)),
                NodeVerdict::NotMatched => return Ok(WalkEnd::NotMatched),
                NodeVerdict::Route(b) => Some(b),
                NodeVerdict::Advance => None,
            };

            current = match self.next_node(compiled, &current.id, route)? {
                Some(node) => node,
                None => return Ok(WalkEnd::NotMatched),
            };
        }

        Err(EngineError::HopLimitExceeded {
            rule_id,
            max: self.config.max_hops,
        })
    }

    /// 选择下一跳
    ///
    /// 无守卫边表示"成功继续"：true 路由找不到同值守卫边时可以落到
    /// 无守卫边上；false 路由只认 when=false 边，缺失时是干净的不匹配
    /// 终止（闸门未通过且规则没画否定分支，不算故障）。
    fn next_node<'a>(
        &self,
        compiled: &'a CompiledRule,
        from: &str,
        route: Option<bool>,
    ) -> Result<Option<&'a NodeDef>> {
        let edges = compiled.edges_from(from);

        let chosen = match route {
            Some(true) => edges
                .iter()
                .find(|e| e.when == Some(true))
                .or_else(|| edges.iter().find(|e| e.when.is_none())),
            Some(false) => edges.iter().find(|e| e.when == Some(false)),
            None => edges.iter().find(|e| e.when.is_none()),
        };

        match chosen {
            Some(edge) => {
                // 编译时已校验边的目标存在
                let node = compiled.node(&edge.to).ok_or_else(|| EngineError::GraphFault {
                    rule_id: compiled.id(),
                    reason: format!("边指向未知节点: {}", edge.to),
                })?;
                Ok(Some(node))
            }
            None if route == Some(false) => Ok(None),
            None => Err(EngineError::GraphFault {
                rule_id: compiled.id(),
                reason: format!("节点 {from} 没有可满足的出边"),
            }),
        }
    }

    /// 求值单个节点
    async fn evaluate_node(
        &self,
        node: &NodeDef,
        compiled: &CompiledRule,
        ctx: &mut EvalContext,
    ) -> Result<NodeVerdict> {
        match &node.behavior {
            NodeKind::AudienceSelector { filter } => {
                let profile = self.audience.load_profile(&ctx.user_id).await?;
                if filter.matches(profile.as_ref()) {
                    Ok(NodeVerdict::Advance)
                } else {
                    Ok(NodeVerdict::NotMatched)
                }
            }

            NodeKind::RangeSwitch { fact, threshold } => {
                let fact_value = ctx.resolve_number(fact)?;
                let threshold_value = ctx.resolve_number(threshold)?;
                Ok(NodeVerdict::Route(fact_value >= threshold_value))
            }

            NodeKind::StreakDaily {
                base,
                step,
                max,
                output,
            } => {
                let base = ctx.resolve_points(base)?;
                let step = ctx.resolve_points(step)?;
                let cap = ctx.resolve_points(max)?;

                // 以事件时间的 UTC 日历日为准，重放同一事件得到同一判定
                let today = ctx.occurred_at.date_naive();

                let state = match self
                    .states
                    .load(compiled.id(), &ctx.user_id, &node.id)
                    .await?
                {
                    Some(raw) => serde_json::from_value(raw).unwrap_or_else(|e| {
                        warn!(
                            rule_id = compiled.id(),
                            node_id = %node.id,
                            error = %e,
                            "节点状态损坏，按全新状态处理"
                        );
                        StreakState::default()
                    }),
                    None => StreakState::default(),
                };

                match advance_streak(&state, today, base, step, cap) {
                    // 当日已发放：账本之前就短路为 false 分支
                    StreakStep::AlreadyGrantedToday => Ok(NodeVerdict::Route(false)),
                    StreakStep::Grant { bonus, state } => {
                        self.states
                            .save(
                                compiled.id(),
                                &ctx.user_id,
                                &node.id,
                                &serde_json::to_value(&state)?,
                            )
                            .await?;
                        ctx.set_var(output.clone(), json!(bonus));
                        Ok(NodeVerdict::Route(true))
                    }
                }
            }

            NodeKind::ActionUpdateProfile { set_level } => {
                let level = ctx.resolve_string(set_level)?;
                Ok(NodeVerdict::Terminal(Effect::SetLevel(level)))
            }

            NodeKind::Award { amount } => {
                let points = ctx.resolve_points(amount)?;
                Ok(NodeVerdict::Terminal(Effect::AwardPoints(points)))
            }

            NodeKind::End => Ok(NodeVerdict::Terminal(Effect::None)),
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
