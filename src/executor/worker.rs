//! 工作者池
//!
//! 固定数量的工作者循环：领取 → 在线程提交锁内标记 in_progress → 续租 → 驱动控制循环 →
//! 在线程提交锁内写终态 → 确认租约。取消在每一步之前、每次工具调用之前检查。
//! 终态只有仍持有租约的工作者才能写入；租约丢失的工作者放弃结果。
//! 终态写入失败时有限次重试，仍失败则不确认租约，等租约过期后由回收器重新入队。
//! 关闭信号同样在边界处检查：被打断的任务不写终态，留给重启后的 `recover`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cancel::CancelRegistry;
use super::control_loop::{ControlLoop, LoopState, LoopStep, Observation, ToolCall};
use super::rule_loop::observation_preview;
use crate::config::ExecutorSection;
use crate::core::StoreError;
use crate::queue::{Lease, TaskQueue};
use crate::store::{ClaimOutcome, Message, Task, TaskOutcome, TaskStatus, TaskStore};
use crate::tools::{ToolRouter, ToolSession};
use crate::update_log::{Update, UpdateLog};

/// 写终态的总尝试次数
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);

struct PoolInner {
    workers: usize,
    max_iterations: usize,
    store: Arc<dyn TaskStore>,
    log: Arc<UpdateLog>,
    queue: Arc<TaskQueue>,
    router: Arc<ToolRouter>,
    control: Arc<dyn ControlLoop>,
    cancels: Arc<CancelRegistry>,
}

/// 工作者池
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        config: &ExecutorSection,
        store: Arc<dyn TaskStore>,
        log: Arc<UpdateLog>,
        queue: Arc<TaskQueue>,
        router: Arc<ToolRouter>,
        control: Arc<dyn ControlLoop>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                workers: config.workers.max(1),
                max_iterations: config.max_iterations.max(1),
                store,
                log,
                queue,
                router,
                control,
                cancels,
            }),
        }
    }

    /// 启动全部工作者；`shutdown` 触发后不再领取，执行中的任务在下一个边界停下
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.inner.workers)
            .map(|worker_id| {
                let inner = Arc::clone(&self.inner);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::info!(worker_id, "Worker started");
                    while let Some(lease) = inner.queue.claim(&shutdown).await {
                        inner.process(worker_id, lease, &shutdown).await;
                    }
                    tracing::info!(worker_id, "Worker stopped");
                })
            })
            .collect()
    }

    /// 领取并执行一个任务（测试与单步调度使用）；队列为空时返回 false
    pub async fn run_once(&self) -> bool {
        self.run_once_until(&CancellationToken::new()).await
    }

    /// 同 `run_once`，`shutdown` 触发时在下一个边界停下
    pub async fn run_once_until(&self, shutdown: &CancellationToken) -> bool {
        match self.inner.queue.try_claim() {
            Some(lease) => {
                self.inner.process(0, lease, shutdown).await;
                true
            }
            None => false,
        }
    }
}

impl PoolInner {
    async fn process(&self, worker_id: usize, lease: Lease, shutdown: &CancellationToken) {
        let task_id = lease.task_id.clone();
        let thread_id = match self.store.get_task(&task_id).await {
            Ok(Some(task)) => task.thread_id,
            Ok(None) => {
                tracing::warn!(task_id = %task_id, "Claimed task no longer exists");
                self.queue.ack(&lease);
                return;
            }
            Err(e) => {
                // 不确认租约，过期后重试
                tracing::error!(task_id = %task_id, "Failed to load claimed task: {}", e);
                return;
            }
        };

        let (task, token) = {
            let writer = self.log.lock_thread(&thread_id).await;
            match self.store.claim(&task_id, &lease.lease_id).await {
                Ok(ClaimOutcome::Claimed(task)) => {
                    writer.append(Update::status_change(&task.id, TaskStatus::InProgress));
                    let token = self.cancels.register(&task.id, &lease.lease_id);
                    if task.cancel_requested {
                        token.cancel();
                    }
                    (task, token)
                }
                Ok(ClaimOutcome::Skip(status)) => {
                    tracing::debug!(task_id = %task_id, status = %status, "Skipping finished task");
                    self.queue.ack(&lease);
                    return;
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, "Failed to claim task: {}", e);
                    return;
                }
            }
        };

        tracing::info!(
            worker_id,
            task_id = %task.id,
            thread_id = %thread_id,
            attempt = task.attempts,
            "Task claimed"
        );

        let lease_lost = Arc::new(AtomicBool::new(false));
        let keeper = spawn_lease_keeper(
            Arc::clone(&self.queue),
            lease.clone(),
            token.clone(),
            Arc::clone(&lease_lost),
        );

        let recorder = Recorder {
            store: Arc::clone(&self.store),
            log: Arc::clone(&self.log),
            task_id: task.id.clone(),
            thread_id: thread_id.clone(),
        };
        let outcome = self.drive(&task, &recorder, &token, shutdown).await;

        keeper.abort();
        self.cancels.remove(&task.id, &lease.lease_id);

        let Some(outcome) = outcome else {
            recorder
                .record(Update::progress(&task.id, "Interrupted by shutdown, will resume after restart"))
                .await;
            tracing::warn!(task_id = %task.id, "Shutdown interrupted task, left for recovery");
            return;
        };

        // 续租失败过，或此刻租约已过期 / 被回收
        if lease_lost.load(Ordering::SeqCst) || !self.queue.renew(&lease) {
            tracing::warn!(task_id = %task.id, "Lease lost during execution, result discarded");
            return;
        }

        for attempt in 1..=FINISH_ATTEMPTS {
            match self.commit_outcome(&task, &thread_id, &lease, &outcome).await {
                Ok(status) => {
                    tracing::info!(worker_id, task_id = %task.id, status = %status, "Task finished");
                    self.queue.ack(&lease);
                    return;
                }
                Err(StoreError::LeaseLost(_)) => {
                    tracing::warn!(task_id = %task.id, "Lease taken over before finish, result discarded");
                    self.queue.ack(&lease);
                    return;
                }
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(task_id = %task.id, attempt, "Failed to record task outcome, retrying: {}", e);
                    tokio::time::sleep(FINISH_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        task_id = %task.id,
                        "Failed to record task outcome, leaving lease to expire: {}",
                        e
                    );
                }
            }
        }
    }

    /// 在线程提交锁内写终态及其更新
    async fn commit_outcome(
        &self,
        task: &Task,
        thread_id: &str,
        lease: &Lease,
        outcome: &TaskOutcome,
    ) -> Result<TaskStatus, StoreError> {
        let writer = self.log.lock_thread(thread_id).await;
        let finished = self
            .store
            .finish(&task.id, &lease.lease_id, outcome.clone())
            .await?;
        match outcome {
            TaskOutcome::Done { result, .. } => {
                writer.append(Update::result_set(&task.id, result));
            }
            TaskOutcome::Failed(error) => {
                writer.append(Update::error(&task.id, error));
            }
            TaskOutcome::Cancelled => {}
        }
        writer.append(Update::status_change(&task.id, finished.status));
        Ok(finished.status)
    }

    /// 返回 None 表示被关闭信号打断
    async fn drive(
        &self,
        task: &Task,
        recorder: &Recorder,
        token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Option<TaskOutcome> {
        let session = match self.router.open_session().await {
            Ok(s) => s,
            Err(e) => return Some(TaskOutcome::Failed(format!("Tool providers unavailable: {e}"))),
        };
        let outcome = self.run_loop(task, &session, recorder, token, shutdown).await;
        session.release().await;
        outcome
    }

    async fn run_loop(
        &self,
        task: &Task,
        session: &ToolSession,
        recorder: &Recorder,
        token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Option<TaskOutcome> {
        let thread = match self.store.get_thread(&task.thread_id).await {
            Ok(Some(thread)) => thread,
            Ok(None) => return Some(TaskOutcome::Failed(format!("Thread {} not found", task.thread_id))),
            Err(e) => return Some(TaskOutcome::Failed(e.to_string())),
        };
        let mut state = LoopState::new(task, &thread, session.schema_list());

        loop {
            if token.is_cancelled() {
                return Some(TaskOutcome::Cancelled);
            }
            if shutdown.is_cancelled() {
                return None;
            }
            if state.iteration >= self.max_iterations {
                return Some(TaskOutcome::Failed(format!(
                    "Control loop did not finish within {} steps",
                    self.max_iterations
                )));
            }
            state.iteration += 1;

            let step = match self.control.next_step(&state).await {
                Ok(step) => step,
                Err(e) => return Some(TaskOutcome::Failed(e.to_string())),
            };

            match step {
                LoopStep::Progress(text) => {
                    recorder.record(Update::progress(&task.id, text)).await;
                }
                LoopStep::CallTools(calls) => {
                    for call in calls {
                        if token.is_cancelled() {
                            return Some(TaskOutcome::Cancelled);
                        }
                        if shutdown.is_cancelled() {
                            return None;
                        }
                        let observation = recorder.invoke(session, call).await;
                        state.observations.push(observation);
                    }
                }
                LoopStep::Finish {
                    result,
                    action_items,
                } => {
                    return Some(TaskOutcome::Done {
                        result,
                        action_items,
                    })
                }
            }
        }
    }
}

/// 每隔租约时长的三分之一续租；续租失败说明租约已被回收，触发取消让执行尽快停下
fn spawn_lease_keeper(
    queue: Arc<TaskQueue>,
    lease: Lease,
    token: CancellationToken,
    lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let period = (queue.lease_duration() / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if !queue.renew(&lease) {
                tracing::warn!(task_id = %lease.task_id, "Lease renewal failed");
                lost.store(true, Ordering::SeqCst);
                token.cancel();
                break;
            }
        }
    })
}

/// 把执行中的事件写入更新日志与线程
struct Recorder {
    store: Arc<dyn TaskStore>,
    log: Arc<UpdateLog>,
    task_id: String,
    thread_id: String,
}

impl Recorder {
    async fn record(&self, update: Update) {
        self.log.append(&self.thread_id, update).await;
    }

    /// 调用工具；错误转换为结构化观察结果交回控制循环
    async fn invoke(&self, session: &ToolSession, call: ToolCall) -> Observation {
        self.record(Update::tool_start(&self.task_id, &call.tool, &call.args))
            .await;

        let result = match session.invoke(&call.tool, call.args.clone()).await {
            Ok(output) => json!({
                "status": "ok",
                "cached": output.cached,
                "data": output.value,
            }),
            Err(e) => json!({
                "status": "error",
                "kind": e.kind(),
                "detail": e.to_string(),
            }),
        };
        let observation = Observation {
            tool: call.tool,
            args: call.args,
            result,
        };
        tracing::debug!(
            task_id = %self.task_id,
            tool = %observation.tool,
            observation = %observation_preview(&observation),
            "Tool observation"
        );

        let writer = self.log.lock_thread(&self.thread_id).await;
        let message = Message::tool(observation.result.to_string()).with_metadata(json!({
            "task_id": self.task_id,
            "tool": observation.tool,
        }));
        if let Err(e) = self.store.append_message(&self.thread_id, message).await {
            tracing::warn!(task_id = %self.task_id, "Failed to store tool message: {}", e);
        }
        writer.append(Update::tool_complete(&self.task_id, &observation.tool, &observation.result));
        observation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolCache;
    use crate::config::{CacheSection, ToolsSection, UpdateLogSection};
    use crate::core::LoopError;
    use crate::store::{MemoryTaskStore, NewTask, Thread};
    use crate::tools::{CallPolicy, OperationSpec, ToolProvider};
    use crate::update_log::UpdateType;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::Mutex;
    use tokio::sync::{Notify, Semaphore};

    struct EchoProvider;

    #[async_trait]
    impl ToolProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn instance_scope(&self) -> &str {
            "local"
        }

        fn operations(&self) -> Vec<OperationSpec> {
            vec![OperationSpec::read("say", "Echo the input")]
        }

        async fn call(&self, _operation: &str, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    /// 每次调用先通知 `entered`，再等待 `gate` 放行；放行一次后一直保持打开
    struct GatedProvider {
        entered: Notify,
        gate: Semaphore,
        calls: AtomicUsize,
    }

    impl GatedProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Notify::new(),
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl ToolProvider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        fn instance_scope(&self) -> &str {
            "local"
        }

        fn operations(&self) -> Vec<OperationSpec> {
            vec![OperationSpec::write("step", "Blocks until released")]
        }

        async fn call(&self, _operation: &str, _args: Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            let _permit = self.gate.acquire().await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }
    }

    /// 前 `failures` 次 finish 返回数据库错误，其余操作转发给内存存储
    struct FlakyFinishStore {
        inner: MemoryTaskStore,
        failures: AtomicU32,
    }

    impl FlakyFinishStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryTaskStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl TaskStore for FlakyFinishStore {
        async fn create_thread(&self, thread_id: &str, metadata: Value) -> Result<Thread, StoreError> {
            self.inner.create_thread(thread_id, metadata).await
        }

        async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
            self.inner.get_thread(thread_id).await
        }

        async fn begin_task(&self, request: NewTask) -> Result<Task, StoreError> {
            self.inner.begin_task(request).await
        }

        async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
            self.inner.get_task(task_id).await
        }

        async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError> {
            self.inner.tasks_for_thread(thread_id).await
        }

        async fn claim(&self, task_id: &str, lease_id: &str) -> Result<ClaimOutcome, StoreError> {
            self.inner.claim(task_id, lease_id).await
        }

        async fn request_cancel(&self, task_id: &str) -> Result<Task, StoreError> {
            self.inner.request_cancel(task_id).await
        }

        async fn finish(&self, task_id: &str, lease_id: &str, outcome: TaskOutcome) -> Result<Task, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Database("database is locked".into()));
            }
            self.inner.finish(task_id, lease_id, outcome).await
        }

        async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError> {
            self.inner.append_message(thread_id, message).await
        }

        async fn unfinished_tasks(&self) -> Result<Vec<Task>, StoreError> {
            self.inner.unfinished_tasks().await
        }

        async fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
            self.inner.purge_expired(max_age).await
        }
    }

    /// 按脚本依次返回步骤
    struct ScriptedLoop {
        steps: Mutex<Vec<Result<LoopStep, LoopError>>>,
        seen_observations: AtomicUsize,
    }

    impl ScriptedLoop {
        fn new(mut steps: Vec<Result<LoopStep, LoopError>>) -> Self {
            steps.reverse();
            Self {
                steps: Mutex::new(steps),
                seen_observations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ControlLoop for ScriptedLoop {
        async fn next_step(&self, state: &LoopState) -> Result<LoopStep, LoopError> {
            self.seen_observations
                .store(state.observations.len(), Ordering::SeqCst);
            self.steps
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(LoopStep::Progress("thinking".into())))
        }
    }

    /// 第一步调用第一个工具，第二步结束
    struct KeywordLoopFixture;

    #[async_trait]
    impl ControlLoop for KeywordLoopFixture {
        async fn next_step(&self, state: &LoopState) -> Result<LoopStep, LoopError> {
            if state.observations.is_empty() {
                let tool = state.tools[0].name.clone();
                Ok(LoopStep::CallTools(vec![ToolCall::new(tool, json!({"x": 1}))]))
            } else {
                Ok(LoopStep::Finish {
                    result: "done".into(),
                    action_items: vec![],
                })
            }
        }
    }

    /// 一步里连续调用两次第一个工具，然后结束
    struct TwoCallsLoop;

    #[async_trait]
    impl ControlLoop for TwoCallsLoop {
        async fn next_step(&self, state: &LoopState) -> Result<LoopStep, LoopError> {
            if state.observations.is_empty() {
                let tool = state.tools[0].name.clone();
                Ok(LoopStep::CallTools(vec![
                    ToolCall::new(tool.clone(), json!({})),
                    ToolCall::new(tool, json!({})),
                ]))
            } else {
                Ok(LoopStep::Finish {
                    result: "done".into(),
                    action_items: vec![],
                })
            }
        }
    }

    struct Harness {
        store: Arc<dyn TaskStore>,
        log: Arc<UpdateLog>,
        queue: Arc<TaskQueue>,
        cancels: Arc<CancelRegistry>,
        pool: WorkerPool,
    }

    fn harness(control: Arc<dyn ControlLoop>, max_iterations: usize) -> Harness {
        harness_with(
            control,
            max_iterations,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(EchoProvider),
            Duration::from_secs(300),
        )
    }

    fn harness_with(
        control: Arc<dyn ControlLoop>,
        max_iterations: usize,
        store: Arc<dyn TaskStore>,
        provider: Arc<dyn ToolProvider>,
        lease: Duration,
    ) -> Harness {
        let log = Arc::new(UpdateLog::new(&UpdateLogSection::default()));
        let queue = Arc::new(TaskQueue::new(lease));
        let cancels = Arc::new(CancelRegistry::new());
        let mut router = ToolRouter::new(
            Arc::new(ToolCache::new(&CacheSection::default())),
            CallPolicy::new(&ToolsSection {
                tool_timeout_secs: 3600,
                ..ToolsSection::default()
            }),
        );
        router.register(provider).unwrap();
        let pool = WorkerPool::new(
            &ExecutorSection {
                workers: 1,
                lease_secs: lease.as_secs(),
                max_iterations,
            },
            Arc::clone(&store),
            Arc::clone(&log),
            Arc::clone(&queue),
            Arc::new(router),
            control,
            Arc::clone(&cancels),
        );
        Harness {
            store,
            log,
            queue,
            cancels,
            pool,
        }
    }

    async fn submit(h: &Harness, message: &str) -> Task {
        h.store.create_thread("thread_1", Value::Null).await.ok();
        let task = h
            .store
            .begin_task(NewTask {
                thread_id: "thread_1".into(),
                message: message.into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        h.queue.enqueue(&task.id, task.priority);
        task
    }

    fn update_types(h: &Harness) -> Vec<UpdateType> {
        h.log
            .read_from("thread_1", 1)
            .entries
            .into_iter()
            .map(|e| e.update.update_type)
            .collect()
    }

    #[tokio::test]
    async fn test_tool_calls_and_finish_are_recorded() {
        let h = harness(Arc::new(KeywordLoopFixture), 10);
        let task = submit(&h, "go").await;
        assert!(h.pool.run_once().await);

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        assert_eq!(
            update_types(&h),
            vec![
                UpdateType::StatusChange,
                UpdateType::ToolStart,
                UpdateType::ToolComplete,
                UpdateType::ResultSet,
                UpdateType::StatusChange,
            ]
        );
        let thread = h.store.get_thread("thread_1").await.unwrap().unwrap();
        assert_eq!(thread.result.as_deref(), Some("done"));
        // user + tool + assistant
        assert_eq!(thread.messages.len(), 3);
        assert_eq!(h.queue.stats().leased, 0);
        assert_eq!(h.cancels.running(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_observation() {
        let control = Arc::new(ScriptedLoop::new(vec![
            Ok(LoopStep::CallTools(vec![ToolCall::new("nope_00000000_x", json!({}))])),
            Ok(LoopStep::Finish {
                result: "handled".into(),
                action_items: vec![],
            }),
        ]));
        let h = harness(control.clone(), 10);
        let task = submit(&h, "go").await;
        h.pool.run_once().await;

        assert_eq!(control.seen_observations.load(Ordering::SeqCst), 1);
        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        let complete = h
            .log
            .read_from("thread_1", 1)
            .entries
            .into_iter()
            .find(|e| e.update.update_type == UpdateType::ToolComplete)
            .unwrap();
        let obs = &complete.update.metadata.unwrap()["observation"];
        assert_eq!(obs["status"], "error");
        assert_eq!(obs["kind"], "tool_not_found");
    }

    #[tokio::test]
    async fn test_loop_error_fails_task() {
        let control = Arc::new(ScriptedLoop::new(vec![Err(LoopError::Fatal(
            "model refused".into(),
        ))]));
        let h = harness(control, 10);
        let task = submit(&h, "go").await;
        h.pool.run_once().await;

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let thread = h.store.get_thread("thread_1").await.unwrap().unwrap();
        assert!(thread.error_message.unwrap().contains("model refused"));
        let last = h.log.read_from("thread_1", 1).entries;
        assert_eq!(last[last.len() - 2].update.update_type, UpdateType::Error);
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let h = harness(Arc::new(ScriptedLoop::new(vec![])), 3);
        let task = submit(&h, "go").await;
        h.pool.run_once().await;
        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("3 steps"));
    }

    #[tokio::test]
    async fn test_cancel_requested_before_run_is_observed() {
        let h = harness(Arc::new(KeywordLoopFixture), 10);
        let task = submit(&h, "go").await;
        // 模拟「已被领取、执行中收到取消」：先领取再请求取消，然后由新租约重新领取
        h.store.claim(&task.id, "old-lease").await.unwrap();
        h.store.request_cancel(&task.id).await.unwrap();
        h.pool.run_once().await;

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(!update_types(&h).contains(&UpdateType::ToolStart));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_finish_is_retried() {
        let store = Arc::new(FlakyFinishStore::new(1));
        let h = harness_with(
            Arc::new(KeywordLoopFixture),
            10,
            store,
            Arc::new(EchoProvider),
            Duration::from_secs(300),
        );
        let task = submit(&h, "go").await;
        h.pool.run_once().await;

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(h.queue.stats().leased, 0);
        let types = update_types(&h);
        assert_eq!(types.iter().filter(|t| **t == UpdateType::ResultSet).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_outcome_leaves_task_reclaimable() {
        let store = Arc::new(FlakyFinishStore::new(FINISH_ATTEMPTS));
        let h = harness_with(
            Arc::new(KeywordLoopFixture),
            10,
            store,
            Arc::new(EchoProvider),
            Duration::from_secs(300),
        );
        let task = submit(&h, "go").await;
        h.pool.run_once().await;

        let stuck = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::InProgress);
        // 租约未确认，过期前没有人能再领取
        assert_eq!(h.queue.stats().leased, 1);
        assert!(!h.pool.run_once().await);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(h.pool.run_once().await);
        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 2);
        assert_eq!(h.queue.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_store_takeover_discards_result() {
        let provider = GatedProvider::new();
        let h = harness_with(
            Arc::new(KeywordLoopFixture),
            10,
            Arc::new(MemoryTaskStore::new()),
            provider.clone(),
            Duration::from_secs(300),
        );
        let task = submit(&h, "go").await;

        let pool = h.pool.clone();
        let run = tokio::spawn(async move { pool.run_once().await });
        provider.entered.notified().await;
        // 另一个工作者以新租约接管
        h.store.claim(&task.id, "other-lease").await.unwrap();
        provider.open();
        assert!(run.await.unwrap());

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.lease_id.as_deref(), Some("other-lease"));
        assert!(task.result.is_none());
        assert!(!update_types(&h).contains(&UpdateType::ResultSet));
        assert_eq!(h.queue.stats().leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_discards_result_and_task_is_reclaimed() {
        let provider = GatedProvider::new();
        let h = harness_with(
            Arc::new(KeywordLoopFixture),
            10,
            Arc::new(MemoryTaskStore::new()),
            provider.clone(),
            Duration::from_secs(30),
        );
        let task = submit(&h, "go").await;

        let pool = h.pool.clone();
        let run = tokio::spawn(async move { pool.run_once().await });
        provider.entered.notified().await;
        // 工具调用卡住超过租约时长，续租已无效
        tokio::time::advance(Duration::from_secs(31)).await;
        provider.open();
        assert!(run.await.unwrap());

        let stale = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::InProgress);
        assert!(!update_types(&h).contains(&UpdateType::ResultSet));
        assert_eq!(h.cancels.running(), 0);

        assert!(h.pool.run_once().await);
        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_call_stops_before_next_call() {
        let provider = GatedProvider::new();
        let h = harness_with(
            Arc::new(TwoCallsLoop),
            10,
            Arc::new(MemoryTaskStore::new()),
            provider.clone(),
            Duration::from_secs(300),
        );
        let task = submit(&h, "go").await;

        let pool = h.pool.clone();
        let run = tokio::spawn(async move { pool.run_once().await });
        provider.entered.notified().await;
        assert!(h.cancels.cancel(&task.id));
        provider.open();
        run.await.unwrap();

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_without_terminal_state() {
        let provider = GatedProvider::new();
        let h = harness_with(
            Arc::new(KeywordLoopFixture),
            10,
            Arc::new(MemoryTaskStore::new()),
            provider.clone(),
            Duration::from_secs(300),
        );
        let task = submit(&h, "go").await;
        let shutdown = CancellationToken::new();

        let pool = h.pool.clone();
        let stop = shutdown.clone();
        let run = tokio::spawn(async move { pool.run_once_until(&stop).await });
        provider.entered.notified().await;
        shutdown.cancel();
        provider.open();
        assert!(run.await.unwrap());

        let task = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        let entries = h.log.read_from("thread_1", 1).entries;
        let last = entries.last().unwrap();
        assert_eq!(last.update.update_type, UpdateType::Progress);
        assert!(last.update.message.as_deref().unwrap().contains("shutdown"));
        // 只有 in_progress 一次状态变更，没有终态
        let status_changes = update_types(&h)
            .into_iter()
            .filter(|t| *t == UpdateType::StatusChange)
            .count();
        assert_eq!(status_changes, 1);
        assert_eq!(h.cancels.running(), 0);
        assert!(h.store.unfinished_tasks().await.unwrap().iter().any(|t| t.id == task.id));
    }
}
