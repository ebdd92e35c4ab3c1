//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和优雅关闭语义。与多数消费场景不同，
//! 奖励核心要求"处理完成后才提交位点"的至少一次语义，因此消费者
//! 关闭自动提交，由调用方在消息完整处理后显式 commit。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::LoyaltyError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 本核心自有的内部 topic
///
/// 业务事件 topic 不在此列——它们由 Schema 注册中心动态发现。
pub mod topics {
    /// 注册中心变更通知（无负载，收到即全量重拉）
    pub const SCHEMA_INVALIDATE: &str = "loyalty.schema.invalidate";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数，处理完成后再凭
/// (topic, partition, offset) 提交位点。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str, LoyaltyError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| LoyaltyError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, LoyaltyError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| LoyaltyError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 设为 5 秒——投递迟迟不成功时应由上层
    /// 感知并处理，而非无限等待。
    pub fn new(config: &KafkaConfig) -> Result<Self, LoyaltyError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| LoyaltyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), LoyaltyError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| LoyaltyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), LoyaltyError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| LoyaltyError::Kafka(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 自动提交被关闭：位点只在消息完整处理后由调用方通过 `commit` 提交，
/// 配合存储层幂等约束构成至少一次投递语义。订阅集可在运行期整体替换
/// （动态订阅管理器按注册中心内容重订阅）。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如业务消费用主组、失效信号监听用 "{group}.invalidate"——
    /// 后者每个实例都要收到每条信号，不能与业务消费共享分区分配。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, LoyaltyError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| LoyaltyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer })
    }

    /// 将订阅集整体替换为给定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), LoyaltyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| LoyaltyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 取消全部订阅（注册中心返回空集时进入空转状态）
    pub fn unsubscribe(&self) {
        self.consumer.unsubscribe();
        info!("已取消全部 Kafka 订阅");
    }

    /// 接收下一条消息
    ///
    /// rdkafka 的 `recv` 是取消安全的，可以放进 `tokio::select!`
    /// 与关闭信号、刷新定时器一起等待。
    pub async fn recv(&self) -> Result<ConsumerMessage, LoyaltyError> {
        let borrowed = self
            .consumer
            .recv()
            .await
            .map_err(|e| LoyaltyError::Kafka(format!("接收消息失败: {e}")))?;

        Ok(ConsumerMessage::from_borrowed(&borrowed))
    }

    /// 提交单条消息的位点（offset + 1）
    ///
    /// 异步提交即可：提交丢失最多导致重复投递，
    /// 下游幂等账本会吸收重复。
    pub fn commit(&self, msg: &ConsumerMessage) -> Result<(), LoyaltyError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| LoyaltyError::Kafka(format!("构造位点列表失败: {e}")))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| LoyaltyError::Kafka(format!("提交位点失败: {e}")))
    }

    /// 启动简单消费循环
    ///
    /// 适用于订阅集固定的辅助消费者（如失效信号监听）。
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - handler 返回错误只记录日志而不中断循环；
    /// - handler 返回后无论成败都提交位点（信号类消息无需重放）；
    /// - 关闭信号变为 `true` 时退出循环，正在执行的 handler 自然完成。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), LoyaltyError>>,
    {
        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                changed = shutdown.changed() => {
                    // 发送端被释放也视为关闭，避免对已关闭通道空转
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = self.recv() => {
                    match msg_result {
                        Ok(msg) => {
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                "收到 Kafka 消息"
                            );

                            if let Err(e) = handler(msg.clone()).await {
                                error!(error = %e, "处理 Kafka 消息失败");
                            }
                            if let Err(e) = self.commit(&msg) {
                                warn!(error = %e, "提交位点失败");
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

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
