//! 入站事件处理服务入口
//!
//! 组装依赖：配置（含热更新）、数据库、解释器、注册中心客户端、
//! 失效信号监听与动态订阅消费循环。Ctrl-C 触发协作式关闭，
//! 在途消息处理完成后才退出。

use std::sync::Arc;

use anyhow::Result;
use graph_engine::interpreter::{InterpreterConfig, RuleInterpreter};
use graph_engine::store::{PgEffectWriter, PgNodeStateStore, PgProfileStore, PgRuleSource};
use loyalty_shared::config::AppConfig;
use loyalty_shared::config_watcher::{DynamicConfig, FileConfigWatcher};
use loyalty_shared::database::Database;
use loyalty_shared::kafka::{KafkaConsumer, topics};
use loyalty_shared::registry::{HttpSchemaRegistry, SchemaCache};
use loyalty_shared::telemetry;
use tokio::sync::watch;
use tracing::info;

use event_ingest_service::audit::IngressAuditRepository;
use event_ingest_service::pipeline::IngestPipeline;
use event_ingest_service::subscription::SubscriptionManager;

const SERVICE_NAME: &str = "event-ingest-service";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    telemetry::init(&config.observability)?;

    info!(environment = %config.environment, "Starting event-ingest-service...");

    let dynamic_config = DynamicConfig::new(config.clone());
    // watcher 随 main 存活到进程退出，其内部任务由它的关闭通道管理
    let _config_watcher = if config.config_watch.enabled {
        let watcher = FileConfigWatcher::from_config(SERVICE_NAME, dynamic_config.clone());
        watcher.start()?;
        Some(watcher)
    } else {
        None
    };

    let db = Database::connect(&config.database).await?;
    if config.database.auto_migrate {
        db.run_migrations().await?;
    }
    let pool = db.pool().clone();

    let interpreter = Arc::new(RuleInterpreter::new(
        Arc::new(PgRuleSource::new(pool.clone())),
        Arc::new(PgNodeStateStore::new(pool.clone())),
        Arc::new(PgEffectWriter::new(pool.clone())),
        Arc::new(PgProfileStore::new(pool.clone())),
        InterpreterConfig::from(&config.engine),
    ));

    let cache = SchemaCache::new();
    let pipeline = Arc::new(IngestPipeline::new(
        cache.clone(),
        interpreter,
        IngressAuditRepository::new(pool),
        dynamic_config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 失效信号监听：独立消费组后缀，每个实例都收到每条信号
    let (invalidate_tx, invalidate_rx) = watch::channel(0u64);
    let invalidate_consumer = KafkaConsumer::new(&config.kafka, Some("invalidate"))?;
    invalidate_consumer.subscribe(&[topics::SCHEMA_INVALIDATE])?;
    tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            invalidate_consumer
                .start(shutdown, move |_msg| {
                    let tx = invalidate_tx.clone();
                    async move {
                        tx.send_modify(|n| *n = n.wrapping_add(1));
                        Ok(())
                    }
                })
                .await;
        }
    });

    // 动态订阅消费循环
    let registry = Arc::new(HttpSchemaRegistry::new(config.registry.base_url.clone()));
    let manager = SubscriptionManager::new(
        registry,
        cache,
        KafkaConsumer::new(&config.kafka, None)?,
        dynamic_config,
    );
    let consumer_task = tokio::spawn(manager.run(pipeline, invalidate_rx, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("收到关闭信号，开始优雅退出");
    let _ = shutdown_tx.send(true);

    consumer_task.await?;
    db.close().await;

    info!("event-ingest-service 已退出");
    Ok(())
}
