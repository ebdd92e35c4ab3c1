//! 定时任务调度服务入口

use std::sync::Arc;

use anyhow::Result;
use graph_engine::interpreter::{InterpreterConfig, RuleInterpreter};
use graph_engine::store::{PgEffectWriter, PgNodeStateStore, PgProfileStore, PgRuleSource};
use loyalty_shared::config::AppConfig;
use loyalty_shared::config_watcher::{DynamicConfig, FileConfigWatcher};
use loyalty_shared::database::Database;
use loyalty_shared::telemetry;
use tokio::sync::watch;
use tracing::info;

use scheduler_worker::driver::SchedulerDriver;
use scheduler_worker::job_repo::ScheduledJobRepository;

const SERVICE_NAME: &str = "scheduler-worker";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    telemetry::init(&config.observability)?;

    info!(environment = %config.environment, "Starting scheduler-worker...");

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

    let rules = Arc::new(PgRuleSource::new(pool.clone()));
    let interpreter = Arc::new(RuleInterpreter::new(
        rules.clone(),
        Arc::new(PgNodeStateStore::new(pool.clone())),
        Arc::new(PgEffectWriter::new(pool.clone())),
        Arc::new(PgProfileStore::new(pool.clone())),
        InterpreterConfig::from(&config.engine),
    ));

    let driver = SchedulerDriver::new(
        rules,
        ScheduledJobRepository::new(pool),
        interpreter,
        dynamic_config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver_task = tokio::spawn(driver.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("收到关闭信号，开始优雅退出");
    let _ = shutdown_tx.send(true);

    driver_task.await?;
    db.close().await;

    info!("scheduler-worker 已退出");
    Ok(())
}
