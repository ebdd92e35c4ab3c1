//! 配置热更新模块
//!
//! 各服务通过 `DynamicConfig` 持有 `Arc<ArcSwap<AppConfig>>`，
//! 读取几乎无开销（一次原子 load）；`FileConfigWatcher` 监听配置目录，
//! 文件变更经去抖后重新加载并推送新快照。刷新间隔、租约时长、
//! topic 前缀白名单等运行期可调的配置项由此获得热更新能力。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;

// ============================================================================
// DynamicConfig — 线程安全的动态配置容器
// ============================================================================

/// 动态配置容器
///
/// 使用 `ArcSwap` 实现近零开销的读取（仅一次原子 load），
/// 配合 `watch` channel 让消费方异步等待配置变更通知。
/// 读取方看到的永远是完整快照，不存在半更新状态。
#[derive(Clone)]
pub struct DynamicConfig {
    current: Arc<ArcSwap<AppConfig>>,
    tx: watch::Sender<Arc<AppConfig>>,
    rx: watch::Receiver<Arc<AppConfig>>,
}

impl DynamicConfig {
    /// 用初始配置创建 DynamicConfig
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let (tx, rx) = watch::channel(config.clone());
        Self {
            current: Arc::new(ArcSwap::from(config)),
            tx,
            rx,
        }
    }

    /// 获取当前配置快照（近零开销的原子 load）
    pub fn load(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// 获取 watch receiver，用于异步等待配置变更
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppConfig>> {
        self.rx.clone()
    }

    /// 更新配置（由 watcher 回调调用）
    ///
    /// 同时更新 ArcSwap 快照和 watch channel，
    /// 保证 load() 读取和 subscribe() 通知的一致性。
    pub fn update(&self, new_config: AppConfig) {
        let new_config = Arc::new(new_config);
        self.current.store(new_config.clone());
        // send 失败说明没有 receiver，属于正常情况（服务关闭阶段）
        let _ = self.tx.send(new_config);
    }
}

// ============================================================================
// FileConfigWatcher — 基于文件系统事件的配置热更新
// ============================================================================

/// 基于文件系统事件的配置监听器
///
/// 使用 `notify` crate 监听配置目录变化，
/// 文件写入后经 debounce 窗口去抖再重新加载并推送。
/// 适用于 K8s ConfigMap 挂载和本地手动编辑两种场景。
pub struct FileConfigWatcher {
    service_name: String,
    watch_path: PathBuf,
    debounce: Duration,
    dynamic_config: DynamicConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FileConfigWatcher {
    pub fn new(
        service_name: &str,
        watch_path: impl AsRef<Path>,
        debounce: Duration,
        dynamic_config: DynamicConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            service_name: service_name.to_string(),
            watch_path: watch_path.as_ref().to_path_buf(),
            debounce,
            dynamic_config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// 从当前配置快照自动构建
    pub fn from_config(service_name: &str, dynamic_config: DynamicConfig) -> Self {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        let debounce = Duration::from_millis(dynamic_config.load().config_watch.debounce_ms);
        Self::new(service_name, &config_dir, debounce, dynamic_config)
    }

    /// 启动监听
    ///
    /// notify 的回调运行在其内部线程上，事件通过 mpsc channel 转交给
    /// tokio 异步任务做去抖与重载；重载失败时保留当前配置（保可用）。
    pub fn start(&self) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let watch_path = self.watch_path.clone();
        let debounce = self.debounce;
        let service_name = self.service_name.clone();
        let dynamic_config = self.dynamic_config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        use notify::EventKind;
                        // 只关心写入/创建/删除事件
                        match event.kind {
                            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                                let _ = event_tx.try_send(());
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "文件监听器事件错误");
                    }
                }
            })
            .context("创建文件监听器失败")?;

        watcher
            .watch(&watch_path, RecursiveMode::NonRecursive)
            .context("启动文件监听失败")?;

        info!(path = %watch_path.display(), "配置文件监听已启动");

        tokio::spawn(async move {
            // watcher 随任务存活，任务退出时自动释放
            let _watcher = watcher;
            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        // 等待去抖窗口，丢弃窗口内积压的重复事件
                        tokio::time::sleep(debounce).await;
                        while event_rx.try_recv().is_ok() {}

                        match AppConfig::load(&service_name) {
                            Ok(new_config) => {
                                info!(service = %service_name, "配置文件变更，已重新加载");
                                dynamic_config.update(new_config);
                            }
                            Err(e) => {
                                error!(
                                    service = %service_name,
                                    error = %e,
                                    "配置文件重新加载失败，保留当前配置"
                                );
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        // 发送端被释放也视为停止，避免对已关闭通道空转
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("配置文件监听已停止");
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// 停止监听并释放资源
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
