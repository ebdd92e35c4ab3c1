//! 动态订阅管理
//!
//! 消费者的 topic 集合不是静态配置，而是跟随 Schema 注册中心：
//! 定时刷新或收到失效信号时全量拉取描述符，按前缀白名单过滤后
//! 计算新 topic 集合；与当前集合（大小写不敏感、与顺序无关）不同
//! 才整体重订阅。注册中心读取失败时保持既有订阅（fail static），
//! 空集合时退订并放慢轮询节奏，避免忙等。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::config_watcher::DynamicConfig;
use loyalty_shared::kafka::KafkaConsumer;
use loyalty_shared::registry::{SchemaCache, SchemaRegistry};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pipeline::IngestPipeline;

/// 动态订阅管理器
///
/// 同时持有消费者与 Schema 缓存：订阅集和快照总是成对更新，
/// 管道看到的候选 Schema 与正在消费的 topic 保持一致。
pub struct SubscriptionManager {
    registry: Arc<dyn SchemaRegistry>,
    cache: SchemaCache,
    consumer: KafkaConsumer,
    config: DynamicConfig,
    current_topics: BTreeSet<String>,
}

/// topic 是否在前缀白名单内（大小写不敏感；空白名单放行所有）
pub fn is_topic_allowed(topic: &str, prefixes: &[String]) -> bool {
    if prefixes.is_empty() {
        return true;
    }
    let topic = topic.to_lowercase();
    prefixes.iter().any(|p| topic.starts_with(&p.to_lowercase()))
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        cache: SchemaCache,
        consumer: KafkaConsumer,
        config: DynamicConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            consumer,
            config,
            current_topics: BTreeSet::new(),
        }
    }

    /// 当前订阅的 topic 集合（规范化小写）
    pub fn current_topics(&self) -> &BTreeSet<String> {
        &self.current_topics
    }

    /// 刷新一轮：拉取注册中心 → 过滤 → 比较 → 必要时重订阅
    ///
    /// 返回订阅集是否发生了变化。注册中心不可用时保持旧订阅和旧快照，
    /// 记警告继续运行。
    pub async fn refresh(&mut self) -> bool {
        let descriptors = match self.registry.fetch_all().await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                // fail static：宁可继续消费旧集合，也不清空订阅
                warn!(error = %e, "注册中心读取失败，保持当前订阅");
                return false;
            }
        };

        let prefixes = self.config.load().registry.topic_prefixes.clone();
        let allowed: Vec<_> = descriptors
            .into_iter()
            .filter(|d| is_topic_allowed(&d.topic, &prefixes))
            .collect();

        let new_topics = self.cache.replace(allowed);

        if new_topics == self.current_topics {
            debug!(topics = new_topics.len(), "topic 集合无变化");
            return false;
        }

        if new_topics.is_empty() {
            self.consumer.unsubscribe();
            info!(
                previous = self.current_topics.len(),
                "注册中心无匹配 topic，已退订并进入空转轮询"
            );
        } else {
            let refs: Vec<&str> = new_topics.iter().map(String::as_str).collect();
            if let Err(e) = self.consumer.subscribe(&refs) {
                // 订阅失败保持旧集合，下一轮重试
                error!(error = %e, "重订阅失败，保持当前订阅");
                return false;
            }
            info!(
                previous = self.current_topics.len(),
                current = new_topics.len(),
                topics = ?new_topics,
                "topic 集合已变更，完成重订阅"
            );
        }

        self.current_topics = new_topics;
        true
    }

    /// 主循环：消费 + 定时刷新 + 失效信号 + 优雅关闭
    ///
    /// 位点只在管道返回 Ok 后提交；管道的 Err 表示瞬时基础设施故障，
    /// 不提交位点，消息将被重投（下游幂等账本吸收重复）。
    pub async fn run(
        mut self,
        pipeline: Arc<IngestPipeline>,
        mut invalidate_rx: watch::Receiver<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.refresh().await;
        info!("动态订阅消费循环已启动");

        // 失效信号通道关闭后禁用该分支，退化为纯定时刷新
        let mut invalidate_open = true;

        loop {
            // 空集合时放慢到空转节奏，有订阅时按正常刷新间隔
            let app_config = self.config.load();
            let refresh_after = if self.current_topics.is_empty() {
                Duration::from_secs(app_config.registry.empty_poll_seconds)
            } else {
                Duration::from_secs(app_config.registry.refresh_interval_seconds)
            };

            tokio::select! {
                // 偏向关闭信号；在途消息的处理在各分支内自然完成
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，动态订阅消费循环退出");
                        break;
                    }
                }

                // 失效信号：无负载，收到即全量重拉
                changed = invalidate_rx.changed(), if invalidate_open => {
                    match changed {
                        Ok(()) => {
                            debug!("收到注册中心失效信号");
                            self.refresh().await;
                        }
                        Err(_) => {
                            warn!("失效信号通道已关闭，仅靠定时刷新");
                            invalidate_open = false;
                        }
                    }
                }

                _ = tokio::time::sleep(refresh_after) => {
                    self.refresh().await;
                }

                msg_result = self.consumer.recv(), if !self.current_topics.is_empty() => {
                    match msg_result {
                        Ok(msg) => {
                            match pipeline.handle(&msg).await {
                                Ok(()) => {
                                    if let Err(e) = self.consumer.commit(&msg) {
                                        warn!(error = %e, "提交位点失败，消息可能被重投");
                                    }
                                }
                                Err(e) => {
                                    // 不提交位点，等待重投
                                    error!(
                                        error = %e,
                                        topic = %msg.topic,
                                        offset = msg.offset,
                                        "消息处理遇到瞬时故障，位点未提交"
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loyalty_shared::config::{AppConfig, KafkaConfig};
    use loyalty_shared::error::LoyaltyError;
    use loyalty_shared::registry::{EventSchemaDescriptor, FieldHints};
    use std::sync::Mutex;

    /// 可编程的注册中心替身
    struct StubRegistry {
        responses: Mutex<Vec<Result<Vec<EventSchemaDescriptor>, LoyaltyError>>>,
    }

    impl StubRegistry {
        fn new(responses: Vec<Result<Vec<EventSchemaDescriptor>, LoyaltyError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl SchemaRegistry for StubRegistry {
        async fn fetch_all(&self) -> Result<Vec<EventSchemaDescriptor>, LoyaltyError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(vec![])
            } else {
                responses.remove(0)
            }
        }
    }

    fn descriptor(event_type: &str, topic: &str) -> EventSchemaDescriptor {
        EventSchemaDescriptor {
            event_type: event_type.to_string(),
            topic: topic.to_string(),
            producer: "test".to_string(),
            version: 1,
            hints: FieldHints::default(),
        }
    }

    fn manager(responses: Vec<Result<Vec<EventSchemaDescriptor>, LoyaltyError>>) -> SubscriptionManager {
        let mut config = AppConfig::default();
        config.registry.topic_prefixes = vec!["loyalty.".to_string(), "users.".to_string()];

        // 消费者的创建与订阅都是本地操作，不需要真实 broker
        let consumer = KafkaConsumer::new(&KafkaConfig::default(), None).unwrap();

        SubscriptionManager::new(
            Arc::new(StubRegistry::new(responses)),
            SchemaCache::new(),
            consumer,
            DynamicConfig::new(config),
        )
    }

    #[test]
    fn test_topic_allowlist() {
        let prefixes = vec!["loyalty.".to_string(), "users.".to_string()];

        assert!(is_topic_allowed("users.user.events", &prefixes));
        assert!(is_topic_allowed("USERS.User.Events", &prefixes));
        assert!(is_topic_allowed("loyalty.schema.invalidate", &prefixes));
        assert!(!is_topic_allowed("orders.order.events", &prefixes));

        // 空白名单放行所有
        assert!(is_topic_allowed("anything.at.all", &[]));
    }

    #[tokio::test]
    async fn test_refresh_filters_and_normalizes() {
        let mut mgr = manager(vec![Ok(vec![
            descriptor("users.user.created.v1", "Users.User.Events"),
            descriptor("users.user.updated.v1", "users.user.events"),
            descriptor("orders.order.paid.v1", "orders.order.events"),
        ])]);

        let changed = mgr.refresh().await;

        assert!(changed);
        // 白名单外的 topic 被滤掉；大小写归并为一个 topic
        assert_eq!(mgr.current_topics().len(), 1);
        assert!(mgr.current_topics().contains("users.user.events"));
    }

    #[tokio::test]
    async fn test_refresh_is_order_and_case_insensitive() {
        let mut mgr = manager(vec![
            Ok(vec![
                descriptor("a.v1", "users.a.events"),
                descriptor("b.v1", "users.b.events"),
            ]),
            // 同一集合，顺序与大小写不同：不算变化
            Ok(vec![
                descriptor("b.v1", "Users.B.Events"),
                descriptor("a.v1", "USERS.A.EVENTS"),
            ]),
        ]);

        assert!(mgr.refresh().await);
        assert!(!mgr.refresh().await);
        assert_eq!(mgr.current_topics().len(), 2);
    }

    #[tokio::test]
    async fn test_registry_failure_keeps_previous_subscription() {
        let mut mgr = manager(vec![
            Ok(vec![descriptor("a.v1", "users.a.events")]),
            Err(LoyaltyError::Registry("connection refused".to_string())),
        ]);

        assert!(mgr.refresh().await);
        let before = mgr.current_topics().clone();

        // fail static：失败的刷新不改变订阅，也不清空快照
        assert!(!mgr.refresh().await);
        assert_eq!(mgr.current_topics(), &before);
        assert!(!mgr.cache.load().is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_unsubscribes() {
        let mut mgr = manager(vec![
            Ok(vec![descriptor("a.v1", "users.a.events")]),
            Ok(vec![]),
        ]);

        assert!(mgr.refresh().await);
        assert!(mgr.refresh().await);
        assert!(mgr.current_topics().is_empty());
        assert!(mgr.cache.load().is_empty());
    }
}
