//! 运行中任务的取消令牌

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

struct Running {
    lease_id: String,
    token: CancellationToken,
}

/// task_id → (租约, 取消令牌)；执行器在边界处检查令牌，服务层在收到取消请求时触发
///
/// 同一任务在租约过期后可能被另一个工作者重新领取，登记与注销都以租约为准，
/// 旧工作者收尾时不会注销新工作者的令牌。
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, Running>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Running>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, task_id: &str, lease_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(
            task_id.to_string(),
            Running {
                lease_id: lease_id.to_string(),
                token: token.clone(),
            },
        );
        token
    }

    /// 触发取消；任务不在运行时返回 false
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock().get(task_id) {
            Some(running) => {
                running.token.cancel();
                true
            }
            None => false,
        }
    }

    /// 注销；只有登记时的租约才能注销
    pub fn remove(&self, task_id: &str, lease_id: &str) -> bool {
        let mut tokens = self.lock();
        match tokens.get(task_id) {
            Some(running) if running.lease_id == lease_id => {
                tokens.remove(task_id);
                true
            }
            _ => false,
        }
    }

    pub fn running(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancel_remove() {
        let registry = CancelRegistry::new();
        let token = registry.register("task_1", "lease_a");
        assert!(!registry.cancel("task_2"));
        assert!(registry.cancel("task_1"));
        assert!(token.is_cancelled());
        assert!(registry.remove("task_1", "lease_a"));
        assert_eq!(registry.running(), 0);
    }

    #[test]
    fn test_stale_lease_cannot_remove_new_token() {
        let registry = CancelRegistry::new();
        let _old = registry.register("task_1", "lease_a");
        let new = registry.register("task_1", "lease_b");

        assert!(!registry.remove("task_1", "lease_a"));
        assert!(registry.cancel("task_1"));
        assert!(new.is_cancelled());
        assert!(registry.remove("task_1", "lease_b"));
    }
}
