//! Schema 注册中心读取与快照缓存
//!
//! 注册中心是外部协作方维护的只读 API，返回当前全量的事件 Schema
//! 描述符集合。本模块提供：
//! - `SchemaRegistry` trait：读取抽象，便于测试注入；
//! - `HttpSchemaRegistry`：基于 HTTP 的默认实现；
//! - `SchemaCache`：进程内不可变快照缓存，整体原子替换，
//!   读取方永远不会观察到半更新的映射。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LoyaltyError;

// ---------------------------------------------------------------------------
// 描述符模型
// ---------------------------------------------------------------------------

/// 字段路径提示
///
/// 注册中心为每个事件类型声明各关键字段在 JSON 信封中的点号路径。
/// 路径缺失时由入站映射器按文档化的回退链解析。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldHints {
    /// 主体用户 ID 的路径
    pub subject_id: Option<String>,
    /// 事件发生时间的路径
    pub occurred_at: Option<String>,
    /// 操作 ID 的路径
    pub operation_id: Option<String>,
    /// 元数据名 -> 路径 的映射，逐项尽力提取
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// 事件 Schema 描述符
///
/// 每个版本不可变；新版本发布后旧版本仍可能在途。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSchemaDescriptor {
    /// 事件类型标识，如 `users.user.created.v1`
    pub event_type: String,
    /// 承载该事件的 Kafka topic
    pub topic: String,
    /// 生产方身份
    pub producer: String,
    pub version: i32,
    #[serde(default)]
    pub hints: FieldHints,
}

// ---------------------------------------------------------------------------
// SchemaRegistry trait 与 HTTP 实现
// ---------------------------------------------------------------------------

/// 注册中心读取抽象
///
/// 变更通知渠道不带负载，收到信号后总是调用 `fetch_all` 全量重拉。
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// 返回当前全量描述符集合
    async fn fetch_all(&self) -> Result<Vec<EventSchemaDescriptor>, LoyaltyError>;
}

/// 基于 HTTP 的注册中心客户端
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn fetch_all(&self) -> Result<Vec<EventSchemaDescriptor>, LoyaltyError> {
        let url = format!("{}/schemas", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LoyaltyError::Registry(format!("请求注册中心失败: {e}")))?;

        if !response.status().is_success() {
            return Err(LoyaltyError::Registry(format!(
                "注册中心返回非成功状态: {}",
                response.status()
            )));
        }

        let descriptors: Vec<EventSchemaDescriptor> = response
            .json()
            .await
            .map_err(|e| LoyaltyError::Registry(format!("解析描述符失败: {e}")))?;

        debug!(count = descriptors.len(), "已拉取注册中心描述符");
        Ok(descriptors)
    }
}

// ---------------------------------------------------------------------------
// SchemaCache — 不可变快照缓存
// ---------------------------------------------------------------------------

/// 按 topic 分组后的描述符快照
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    /// key 为小写 topic 名，分组内保持注册中心返回顺序
    by_topic: HashMap<String, Vec<EventSchemaDescriptor>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl SchemaSnapshot {
    /// 指定 topic 下的候选描述符（大小写不敏感）
    pub fn schemas_for_topic(&self, topic: &str) -> &[EventSchemaDescriptor] {
        self.by_topic
            .get(&topic.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 规范化（小写、去重、有序）的 topic 集合，用于订阅差异比较
    pub fn topic_set(&self) -> BTreeSet<String> {
        self.by_topic.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

/// 进程级 Schema 缓存
///
/// 整个快照通过 `ArcSwap` 原子替换；刷新失败时调用方不调用
/// `replace`，旧快照自然保留（fail static）。
#[derive(Clone)]
pub struct SchemaCache {
    snapshot: Arc<ArcSwap<SchemaSnapshot>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(SchemaSnapshot::default())),
        }
    }

    /// 获取当前快照（无锁原子 load）
    pub fn load(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.load_full()
    }

    /// 用新的描述符集合整体替换快照，返回新的 topic 集合
    pub fn replace(&self, descriptors: Vec<EventSchemaDescriptor>) -> BTreeSet<String> {
        let mut by_topic: HashMap<String, Vec<EventSchemaDescriptor>> = HashMap::new();
        for desc in descriptors {
            by_topic
                .entry(desc.topic.to_lowercase())
                .or_default()
                .push(desc);
        }

        let snapshot = SchemaSnapshot {
            by_topic,
            fetched_at: Some(Utc::now()),
        };
        let topics = snapshot.topic_set();

        self.snapshot.store(Arc::new(snapshot));
        debug!(topics = topics.len(), "Schema 快照已替换");
        topics
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}
