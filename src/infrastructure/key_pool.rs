//! API Key 池 - 基础设施层
//!
//! 多个 LLM API key 轮流使用。每次调用独占一个 key，用完归还；
//! 没有空闲 key 时调用方异步等待。

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

pub struct KeyPool {
    semaphore: Semaphore,
    free: Mutex<VecDeque<usize>>,
    size: usize,
}

/// 租用中的 key，drop 时自动归还
pub struct KeyLease<'a> {
    pool: &'a KeyPool,
    index: usize,
    _permit: SemaphorePermit<'a>,
}

impl KeyLease<'_> {
    /// key 在池中的序号
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        if let Ok(mut free) = self.pool.free.lock() {
            free.push_back(self.index);
        }
        debug!("归还 API key #{}", self.index);
    }
}

impl KeyPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Semaphore::new(size),
            free: Mutex::new((0..size).collect()),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 取得一个空闲 key，池为空时返回 `None`
    pub async fn acquire(&self) -> Option<KeyLease<'_>> {
        if self.size == 0 {
            return None;
        }
        let permit = self.semaphore.acquire().await.ok()?;
        let index = self.free.lock().ok()?.pop_front()?;
        debug!("取得 API key #{}", index);
        Some(KeyLease {
            pool: self,
            index,
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_leases_are_exclusive() {
        let pool = KeyPool::new(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.index(), b.index());

        // 两个 key 都被占用，第三次会等待
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        let released = a.index();
        drop(a);
        let c = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.index(), released);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = KeyPool::new(0);
        assert!(pool.acquire().await.is_none());
    }
}
