//! 调度驱动循环
//!
//! 低频循环做两件事：
//! 1. 计划——为每条可调度规则计算下一次 RunAtUtc 并落任务行；
//! 2. 认领执行——发现到期任务，条件认领成功后以受众模式驱动解释器，
//!    按结果落终态或退避重试。
//!
//! 多实例并行运行是常态：计划的重复由任务表唯一约束吸收，
//! 执行的互斥由租约承担，这里没有任何进程内锁。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use graph_engine::interpreter::RuleInterpreter;
use graph_engine::store::RuleSource;
use loyalty_shared::config_watcher::DynamicConfig;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job_repo::ScheduledJobRepository;
use crate::schedule::{ScheduleSpec, tick_operation_id};

/// 单轮认领的任务条数上限
const CLAIM_BATCH: i64 = 20;

/// 退避上限，防止 attempts 较大时位移溢出或推迟过远
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// 指数退避 + 抖动
///
/// 第 N 次失败等待约 base * 2^(N-1)，加最多 base/2 的随机抖动，
/// 避免多实例同时重试同一批任务。
pub fn backoff_delay(base_seconds: u64, attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let base = Duration::from_secs(base_seconds.max(1));
    let delay = base.saturating_mul(2u32.saturating_pow(exponent)).min(MAX_BACKOFF);

    let jitter_max = (base_seconds.max(2) / 2).max(1);
    let jitter = Duration::from_secs(rand::rng().random_range(0..jitter_max));
    delay + jitter
}

/// 调度驱动器
pub struct SchedulerDriver {
    rules: Arc<dyn RuleSource>,
    jobs: ScheduledJobRepository,
    interpreter: Arc<RuleInterpreter>,
    config: DynamicConfig,
    /// 实例身份，写入 locked_by 供运维排查
    worker_id: String,
}

impl SchedulerDriver {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        jobs: ScheduledJobRepository,
        interpreter: Arc<RuleInterpreter>,
        config: DynamicConfig,
    ) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            rules,
            jobs,
            interpreter,
            config,
            worker_id: format!("{host}:{}", Uuid::new_v4()),
        }
    }

    /// 计划阶段：为可调度规则落到期任务行
    ///
    /// 单条规则的规格错误只跳过该规则；返回本轮新计划的任务数。
    #[instrument(skip(self))]
    pub async fn plan(&self, now: DateTime<Utc>) -> Result<u32> {
        let rules = self.rules.schedulable_rules().await?;
        let mut planned = 0;

        for rule in rules {
            let spec = match ScheduleSpec::from_variables(&rule.variables_json) {
                Ok(Some(spec)) => spec,
                // 查询谓词保证了 $schedule 存在，这里只是防御
                Ok(None) => continue,
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "规则调度规格无效，跳过");
                    continue;
                }
            };

            let run_at = match spec.next_run_after(now) {
                Ok(run_at) => run_at,
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "计算下次运行时间失败，跳过");
                    continue;
                }
            };

            let operation_id = tick_operation_id(rule.id, run_at);
            if self.jobs.schedule_tick(rule.id, run_at, &operation_id).await? {
                planned += 1;
            }
        }

        Ok(planned)
    }

    /// 认领执行阶段：发现到期任务并逐个处理
    #[instrument(skip(self))]
    pub async fn claim_and_run(&self, now: DateTime<Utc>) -> Result<u32> {
        let scheduler_config = self.config.load().scheduler.clone();
        let lease = Duration::from_secs(scheduler_config.lease_seconds);

        let due = self.jobs.find_due(now, CLAIM_BATCH).await?;
        let mut executed = 0;

        for job in due {
            // 输掉的认领影响 0 行——竞争不是错误，换下一个候选
            if !self.jobs.try_claim(job.id, &self.worker_id, now, lease).await? {
                continue;
            }

            info!(
                job_id = job.id,
                rule_id = job.rule_id,
                operation_id = %job.operation_id,
                attempts = job.attempts,
                "已认领定时任务"
            );

            match self
                .interpreter
                .run_audience(job.rule_id, &job.operation_id)
                .await
            {
                Ok(outcome) => {
                    self.jobs.complete(job.id, outcome.total_points).await?;
                    info!(
                        job_id = job.id,
                        applied = outcome.users_applied,
                        points = outcome.total_points,
                        "定时任务执行完成"
                    );
                    executed += 1;
                }
                Err(e) => {
                    let attempts = job.attempts + 1;
                    if attempts >= scheduler_config.max_attempts {
                        error!(
                            job_id = job.id,
                            attempts,
                            error = %e,
                            "定时任务超过重试上限，进入终态 FAILED"
                        );
                        self.jobs.fail(job.id, &e.to_string()).await?;
                    } else {
                        let backoff = backoff_delay(scheduler_config.backoff_base_seconds, attempts);
                        let retry_at = now
                            + chrono::Duration::from_std(backoff)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        warn!(
                            job_id = job.id,
                            attempts,
                            %retry_at,
                            error = %e,
                            "定时任务执行失败，退避后重试"
                        );
                        self.jobs.retry_later(job.id, retry_at, &e.to_string()).await?;
                    }
                }
            }
        }

        Ok(executed)
    }

    /// 主循环
    ///
    /// 每轮先计划后执行；任一阶段的错误只记日志，下一轮重来
    /// （保可用性优先于崩溃退出）。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "调度驱动循环已启动");

        loop {
            let tick = Duration::from_secs(self.config.load().scheduler.tick_seconds);

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，调度驱动循环退出");
                        break;
                    }
                }

                _ = tokio::time::sleep(tick) => {
                    let now = Utc::now();
                    if let Err(e) = self.plan(now).await {
                        warn!(error = %e, "计划阶段失败，下一轮重试");
                    }
                    if let Err(e) = self.claim_and_run(now).await {
                        warn!(error = %e, "认领执行阶段失败，下一轮重试");
                    }
                }
            }
        }
    }
}
