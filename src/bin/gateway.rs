//! Triage Gateway - 执行底座 + 实时更新网关
//!
//! 运行方式：
//! ```bash
//! cargo run --bin triage-gateway
//! TRIAGE__EXECUTOR__WORKERS=8 RUST_LOG=triage=debug cargo run --bin triage-gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use triage::cache::ToolCache;
use triage::config::load_config;
use triage::core::ShutdownManager;
use triage::executor::{CancelRegistry, KeywordLoop, WorkerPool};
use triage::gateway::Hub;
use triage::queue::TaskQueue;
use triage::store::create_task_store;
use triage::tools::{CallPolicy, HostProvider, ToolRouter};
use triage::update_log::UpdateLog;
use triage::{observability, TaskService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    observability::init();

    let shutdown = Arc::new(ShutdownManager::new());
    let signals = shutdown.listen_for_signals();

    // 工具：缓存 + 路由 + 本机 provider
    let cache = Arc::new(ToolCache::new(&cfg.cache));
    let mut router = ToolRouter::new(Arc::clone(&cache), CallPolicy::new(&cfg.tools));
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    router
        .register(Arc::new(HostProvider::new(hostname, &cfg.tools.shell)))
        .context("Failed to register host provider")?;
    let router = Arc::new(router);

    // 任务状态、更新日志、队列
    let store = create_task_store(&cfg.store).await;
    let log = Arc::new(UpdateLog::new(&cfg.update_log));
    let queue = Arc::new(TaskQueue::new(Duration::from_secs(cfg.executor.lease_secs.max(1))));
    let cancels = Arc::new(CancelRegistry::new());

    let service = Arc::new(
        TaskService::new(
            Arc::clone(&store),
            Arc::clone(&log),
            Arc::clone(&queue),
            Arc::clone(&cancels),
        )
        .with_cache(Arc::clone(&cache))
        .with_store_retention(Duration::from_secs(cfg.store.retention_hours * 3600)),
    );
    let recovered = service.recover().await.context("Failed to recover unfinished tasks")?;
    tracing::info!(recovered, tools = router.tool_names().len(), "Task substrate ready");

    let pool = WorkerPool::new(
        &cfg.executor,
        store,
        log,
        queue,
        router,
        Arc::new(KeywordLoop::new()),
        cancels,
    );
    let workers = pool.spawn(shutdown.token().child_token());

    let maintenance = tokio::spawn(run_maintenance(
        Arc::clone(&service),
        Duration::from_secs(cfg.gateway.maintenance_interval_secs.max(1)),
        shutdown.token().child_token(),
    ));

    let hub = Hub::new(&cfg.gateway, Arc::clone(&service));
    tracing::info!("Press Ctrl+C to stop");
    if let Err(e) = hub.run(shutdown.token().child_token()).await {
        tracing::error!("Gateway failed: {}", e);
        shutdown.shutdown(triage::core::ShutdownReason::FatalError(e));
    }

    shutdown.wait_for_shutdown().await;
    tracing::info!(reason = ?shutdown.reason(), "Shutting down workers...");
    // 执行中的任务在下一个边界停下，未完成的留给下次启动 recover
    for handle in workers {
        let _ = handle.await;
    }
    let _ = maintenance.await;
    let _ = signals.await;

    Ok(())
}

/// 周期维护：清理过期日志 / 缓存 / 任务，回收过期租约
async fn run_maintenance(service: Arc<TaskService>, every: Duration, cancel: CancellationToken) {
    let mut timer = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                if let Err(e) = service.run_maintenance().await {
                    tracing::warn!("Maintenance sweep failed: {}", e);
                }
            }
        }
    }
}
