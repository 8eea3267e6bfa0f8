//! 경로별 송신자
//!
//! - 경로 하나당 유한 큐 하나 + tokio 태스크 하나
//! - 생산자는 절대 막히지 않는다: 큐가 가득 차면 share를 버림
//! - `close()` 후에도 큐에 남은 share는 모두 보내고 종료

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::path::{usable_mtu, Path, PathFingerprint, PathStatsPublisher, Transport};
use crate::pool::PooledBuf;
use crate::stats::SessionMetrics;
use crate::{Error, Result, MIN_MTU};

/// 경로 하나를 맡는 송신자
pub struct PathSender {
    fingerprint: PathFingerprint,

    /// 경로 MTU (식별 비교용)
    path_mtu: usize,

    /// 헤더를 뺀 share 최대 크기
    mtu: usize,

    tx: Mutex<Option<mpsc::Sender<PooledBuf>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<SessionMetrics>,
}

impl PathSender {
    /// 송신자 생성 및 송신 태스크 시작
    ///
    /// 경로 MTU가 `MIN_MTU`보다 작거나 원시 데이터플레인 경로가 없으면 실패.
    pub fn spawn(
        path: &dyn Path,
        queue_capacity: usize,
        metrics: Arc<SessionMetrics>,
        publisher: Option<Arc<dyn PathStatsPublisher>>,
    ) -> Result<Self> {
        let mtu = usable_mtu(path)?;
        if mtu < MIN_MTU {
            return Err(Error::InsufficientMtu { mtu, min: MIN_MTU });
        }

        let fingerprint = path.fingerprint();
        let transport = path.transport();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));

        let handle = tokio::spawn(run(
            rx,
            transport,
            fingerprint.clone(),
            metrics.clone(),
            publisher,
        ));

        info!("경로 송신자 시작: {} (mtu {})", fingerprint, mtu);

        Ok(Self {
            fingerprint,
            path_mtu: path.mtu(),
            mtu,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            metrics,
        })
    }

    pub fn fingerprint(&self) -> &PathFingerprint {
        &self.fingerprint
    }

    /// share 하나의 최대 크기
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// 같은 경로인지 (fingerprint + MTU)
    pub fn matches(&self, path: &dyn Path) -> bool {
        self.fingerprint == path.fingerprint() && self.path_mtu == path.mtu()
    }

    /// share 하나를 큐에 넣는다. 큐가 가득 찼거나 닫혔으면 버린다
    pub fn write(&self, share: PooledBuf) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            trace!("닫힌 송신자에 share 버림: {}", self.fingerprint);
            return;
        };
        if tx.try_send(share).is_err() {
            self.metrics.record_queue_drop();
            trace!("송신 큐 가득 참, share 버림: {}", self.fingerprint);
        }
    }

    /// 큐를 닫는다. 남은 share는 계속 보낸다
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("경로 송신자 닫음: {}", self.fingerprint);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// 송신 태스크 종료 대기
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for PathSender {
    fn drop(&mut self) {
        // 태스크는 큐가 닫히면 스스로 끝난다
        self.tx.get_mut().take();
    }
}

async fn run(
    mut rx: mpsc::Receiver<PooledBuf>,
    transport: Arc<dyn Transport>,
    fingerprint: PathFingerprint,
    metrics: Arc<SessionMetrics>,
    publisher: Option<Arc<dyn PathStatsPublisher>>,
) {
    while let Some(share) = rx.recv().await {
        match transport.send(&share).await {
            Ok(_) => {
                metrics.record_share_sent(share.len());
                if let Some(publisher) = &publisher {
                    publisher.publish_egress_stats(&fingerprint, 1, share.len() as u64);
                }
            }
            Err(e) => {
                metrics.record_send_error();
                debug!("share 송신 실패 ({}): {}", fingerprint, e);
            }
        }
    }

    debug!("경로 송신자 종료: {}", fingerprint);
}
