//! 日志跟随：订阅者持有自己的 cursor，等待新条目

use std::sync::Arc;

use tokio::sync::watch;

use super::{ReadBatch, ThreadLog};

/// 单个订阅者的跟随句柄
pub struct LogTail {
    log: Arc<ThreadLog>,
    head: watch::Receiver<u64>,
    cursor: u64,
}

impl LogTail {
    pub(crate) fn new(log: Arc<ThreadLog>, cursor: u64) -> Self {
        let head = log.watch();
        Self { log, head, cursor }
    }

    pub fn thread_id(&self) -> &str {
        self.log.thread_id()
    }

    /// 下一次读取的位置
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// 等待并返回下一批条目；返回的批次要么非空，要么带 truncated 标记
    ///
    /// 可安全地用在 `select!` 中：取消后 cursor 不变，不会丢条目。
    pub async fn next_batch(&mut self) -> ReadBatch {
        loop {
            self.head.borrow_and_update();
            let batch = self.log.read_from(self.cursor);
            if !batch.entries.is_empty() || batch.truncated {
                self.cursor = batch.next_cursor;
                return batch;
            }
            // 发送端与本句柄共同持有 ThreadLog，changed 不会因关闭而返回错误
            if self.head.changed().await.is_err() {
                return batch;
            }
        }
    }

    /// 跳到指定位置（重新快照后使用）
    pub fn seek(&mut self, cursor: u64) {
        self.cursor = cursor;
    }
}
