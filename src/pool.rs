//! 버퍼 풀
//!
//! 프레임/share 버퍼를 재사용한다. 풀이 가득 차 있으면 돌려받은 버퍼는 그냥 해제.
//! `PooledBuf`는 drop될 때 자기 풀로 돌아가므로 반환은 정확히 한 번만 일어난다.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

struct PoolInner {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    buf_size: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// 고정 크기 버퍼 풀
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// `capacity`개까지 보관하는 `buf_size` 바이트 버퍼 풀
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let (free_tx, free_rx) = bounded(capacity.max(1));
        Self {
            inner: Arc::new(PoolInner {
                free_tx,
                free_rx,
                buf_size,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// 빈 버퍼 하나 꺼내기 (없으면 새로 할당)
    pub fn acquire(&self) -> PooledBuf {
        let buf = match self.inner.free_rx.try_recv() {
            Ok(mut buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            Err(_) => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.inner.buf_size)
            }
        };

        PooledBuf {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// 버퍼 하나의 크기
    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// 현재 풀에 쉬고 있는 버퍼 수
    pub fn idle(&self) -> usize {
        self.inner.free_rx.len()
    }

    /// (새로 할당, 재사용, 버림) 횟수
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.inner.allocated.load(Ordering::Relaxed),
            self.inner.reused.load(Ordering::Relaxed),
            self.inner.discarded.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_size", &self.inner.buf_size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// 풀에서 빌린 버퍼
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    /// 명시적으로 풀에 반환
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        // 풀보다 커진 버퍼는 보관하지 않는다
        if buf.capacity() > self.pool.buf_size * 2 || self.pool.free_tx.try_send(buf).is_err() {
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.buf.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(2, 128);

        let mut a = pool.acquire();
        a.extend_from_slice(b"hello");
        a.release();
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire();
        assert!(b.is_empty(), "재사용 버퍼는 비어 있어야 함");
        assert!(b.capacity() >= 128);
        assert_eq!(pool.counters(), (1, 1, 0));
    }

    #[test]
    fn test_overflow_is_discarded() {
        let pool = BufferPool::new(1, 64);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.counters().2, 1);
    }
}
