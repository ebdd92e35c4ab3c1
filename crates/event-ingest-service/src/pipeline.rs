//! 消息处理管道
//!
//! 单条消息的完整流程：Schema 候选查找 → 映射 → 审计接收 → 解释执行
//! → 审计结果。返回 Ok 表示位点可以提交（含映射失败的"静默丢弃"），
//! 返回 Err 表示瞬时基础设施故障，位点不提交、等待重投。

use chrono::Utc;
use graph_engine::interpreter::RuleInterpreter;
use loyalty_shared::config_watcher::DynamicConfig;
use loyalty_shared::kafka::ConsumerMessage;
use loyalty_shared::registry::SchemaCache;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::IngressAuditRepository;
use crate::error::IngestError;
use crate::mapper;

/// 入站处理管道
pub struct IngestPipeline {
    cache: SchemaCache,
    interpreter: Arc<RuleInterpreter>,
    audit: IngressAuditRepository,
    config: DynamicConfig,
}

impl IngestPipeline {
    pub fn new(
        cache: SchemaCache,
        interpreter: Arc<RuleInterpreter>,
        audit: IngressAuditRepository,
        config: DynamicConfig,
    ) -> Self {
        Self {
            cache,
            interpreter,
            audit,
            config,
        }
    }

    /// 处理单条消息
    pub async fn handle(&self, msg: &ConsumerMessage) -> Result<(), IngestError> {
        let snapshot = self.cache.load();
        let candidates = snapshot.schemas_for_topic(&msg.topic);

        // 订阅与快照之间存在短暂窗口：topic 刚被移出注册中心时
        // 可能还有在途消息，无候选即丢弃
        if candidates.is_empty() {
            debug!(topic = %msg.topic, "topic 已无 Schema 候选，丢弃消息");
            return Ok(());
        }

        let retain_raw = self.config.load().ingest.retain_raw_payload;

        let trigger = match mapper::map_message(candidates, msg, retain_raw, Utc::now()) {
            Ok(trigger) => trigger,
            Err(failure) => {
                // 映射失败：记审计行 + 错误码后吸收，绝不卡住消费
                warn!(
                    topic = %msg.topic,
                    operation_id = %failure.operation_id,
                    error = %failure.error,
                    "消息映射失败，记录审计后丢弃"
                );
                self.audit
                    .record_received(&msg.topic, &failure.operation_id, None, None, None)
                    .await?;
                self.audit
                    .mark_failed(&msg.topic, &failure.operation_id, failure.error.code())
                    .await?;
                return Ok(());
            }
        };

        self.audit
            .record_received(
                &msg.topic,
                &trigger.operation_id,
                Some(&trigger.event_type),
                Some(&trigger.user_id),
                trigger.raw_payload.as_ref(),
            )
            .await?;

        // 规则级故障已在解释器内部吸收；这里的 Err 都是基础设施故障，
        // 向上传播以阻止位点提交
        let outcome = self.interpreter.handle_trigger(&trigger).await?;

        self.audit
            .mark_processed(&msg.topic, &trigger.operation_id)
            .await?;

        info!(
            topic = %msg.topic,
            operation_id = %trigger.operation_id,
            user_id = %trigger.user_id,
            applied = outcome.applied_count(),
            points = outcome.total_points(),
            "消息处理完成"
        );

        Ok(())
    }
}
