//! 세션
//!
//! 인코더 하나와 경로별 송신자 집합을 묶는다.
//! 작업 태스크가 암호화된 프레임을 하나씩 꺼내 N개 share로 쪼갠 뒤 share i를 송신자 i에 넘긴다.
//!
//! 경로 집합은 실행 중에 `set_paths`로 바뀔 수 있다. 이미 큐에 들어간 share는 옛 경로로 나간다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::FrameCipher;
use crate::encoder::Encoder;
use crate::frame::set_path_index;
use crate::path::{Path, PathStatsPublisher};
use crate::pool::BufferPool;
use crate::sender::PathSender;
use crate::shamir;
use crate::stats::SessionMetrics;
use crate::{Config, Error, Result, HDR_LEN};

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// 정상 전송 중 (또는 첫 경로 설정 전)
    Running,

    /// 경로 대기 시간이 지나도록 N개 경로가 없음. 경로가 채워지면 다시 Running
    WaitingForPaths { available: usize, required: usize },

    /// 종료됨
    Closed,
}

/// 현재 송신자 집합
#[derive(Default)]
struct PathSet {
    /// fingerprint 순으로 정렬
    senders: Vec<Arc<PathSender>>,

    /// 송신자들의 최소 share MTU
    mtu: Option<usize>,
}

struct Shared {
    session_id: u8,
    config: Config,
    paths: Mutex<PathSet>,
    paths_changed: Notify,
    closed: AtomicBool,
    pool: BufferPool,
    metrics: Arc<SessionMetrics>,
    publisher: Option<Arc<dyn PathStatsPublisher>>,
    status: watch::Sender<SessionStatus>,
}

/// 다중 경로 송신 세션
pub struct Session {
    shared: Arc<Shared>,
    stream_id: u32,
    packet_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// 세션 생성 및 작업 태스크 시작
    ///
    /// 송신자 집합은 비어 있는 상태로 시작한다. `set_paths`로 경로를 넣어야 전송이 시작된다.
    pub fn new(
        session_id: u8,
        config: Config,
        cipher: FrameCipher,
        publisher: Option<Arc<dyn PathStatsPublisher>>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(SessionMetrics::new());
        let (packet_tx, encoder) =
            Encoder::new(session_id, config.packet_queue_capacity, metrics.clone());
        let stream_id = encoder.stream_id();
        let (status, _) = watch::channel(SessionStatus::Running);

        let shared = Arc::new(Shared {
            session_id,
            pool: BufferPool::new(config.pool_capacity, config.buffer_size),
            config,
            paths: Mutex::new(PathSet::default()),
            paths_changed: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
            publisher,
            status,
        });

        info!(
            "세션 {} 시작: stream {:#07x}, T={}, N={}",
            session_id, stream_id, shared.config.threshold, shared.config.parts
        );

        let worker = tokio::spawn(run(shared.clone(), encoder, cipher));

        Ok(Self {
            shared,
            stream_id,
            packet_tx: Mutex::new(Some(packet_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn session_id(&self) -> u8 {
        self.shared.session_id
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// IP 패킷 하나를 세션에 넣는다
    ///
    /// 입력 큐가 가득 차면 패킷은 조용히 버려진다 (카운터만 증가).
    pub fn write(&self, packet: Bytes) -> Result<()> {
        let tx = self.packet_tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(Error::SessionClosed);
        };

        let len = packet.len();
        match tx.try_send(packet) {
            Ok(()) => {
                self.shared.metrics.record_packet(len);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.shared.metrics.record_packet_dropped();
                trace!("세션 {} 입력 큐 가득 참, 패킷 버림", self.shared.session_id);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::SessionClosed),
        }
    }

    /// 이후 패킷에 쓸 경로 집합 교체
    ///
    /// 기존 송신자는 같은 경로(fingerprint + MTU)면 재사용, 빠진 경로는 닫는다.
    /// 새 송신자 생성이 하나라도 실패하면 새로 만든 것만 닫고 기존 집합을 그대로 둔다.
    pub fn set_paths(&self, paths: &[Arc<dyn Path>]) -> Result<()> {
        let mut set = self.shared.paths.lock();
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }

        let mut reused = vec![false; set.senders.len()];
        let mut created: Vec<Arc<PathSender>> = Vec::new();

        for path in paths {
            let path = path.as_ref();
            if let Some(pos) = set.senders.iter().position(|s| s.matches(path)) {
                reused[pos] = true;
                continue;
            }
            if created.iter().any(|s| s.matches(path)) {
                continue;
            }

            match PathSender::spawn(
                path,
                self.shared.config.send_queue_capacity,
                self.shared.metrics.clone(),
                self.shared.publisher.clone(),
            ) {
                Ok(sender) => created.push(Arc::new(sender)),
                Err(e) => {
                    warn!("경로 {} 송신자 생성 실패: {}", path.fingerprint(), e);
                    for sender in &created {
                        sender.close();
                    }
                    return Err(e);
                }
            }
        }

        let mut senders = created;
        let old = std::mem::take(&mut set.senders);
        for (sender, keep) in old.into_iter().zip(reused) {
            if keep {
                senders.push(sender);
            } else {
                info!("경로 제거: {}", sender.fingerprint());
                sender.close();
            }
        }

        // share → 경로 배정이 경로 순서에 흔들리지 않도록
        senders.sort_by(|a, b| a.fingerprint().cmp(b.fingerprint()));

        // 풀 버퍼 한 개에 share 하나가 들어가야 한다
        let buffer_size = self.shared.config.buffer_size;
        set.mtu = senders.iter().map(|s| s.mtu().min(buffer_size)).min();
        set.senders = senders;

        info!(
            "세션 {} 경로 갱신: {}개, mtu {:?}",
            self.shared.session_id,
            set.senders.len(),
            set.mtu
        );
        drop(set);

        self.shared.paths_changed.notify_waiters();
        Ok(())
    }

    /// 세션 종료 시작 (여러 번 호출해도 됨)
    ///
    /// 바로 반환한다. 이미 들어간 패킷은 경로가 있으면 마저 보낸다.
    pub fn close(&self) {
        self.packet_tx.lock().take();
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("세션 {} 종료 요청", self.shared.session_id);
        }
        self.shared.paths_changed.notify_waiters();
    }

    /// 작업 태스크와 모든 송신자가 끝날 때까지 대기
    pub async fn join(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let senders = self.shared.paths.lock().senders.clone();
        for sender in senders {
            sender.join().await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    /// 상태 변화 구독
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.shared.metrics.clone()
    }

    /// 현재 share MTU (경로가 없으면 `None`)
    pub fn mtu(&self) -> Option<usize> {
        self.shared.paths.lock().mtu
    }

    pub fn path_count(&self) -> usize {
        self.shared.paths.lock().senders.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status || *current == SessionStatus::Closed {
                return false;
            }
            *current = status;
            true
        });
    }

    /// N개 이상 송신자가 있으면 현재 MTU
    fn ready_mtu(&self) -> std::result::Result<usize, usize> {
        let set = self.paths.lock();
        match set.mtu {
            Some(mtu) if set.senders.len() >= self.config.parts => Ok(mtu),
            _ => Err(set.senders.len()),
        }
    }

    /// 경로가 준비될 때까지 대기. 닫혔는데 경로가 없으면 `None`
    ///
    /// 대기 시간이 지나도 에러로 끝내지 않고 WaitingForPaths 상태로 계속 기다린다.
    async fn wait_for_paths(&self) -> Option<usize> {
        loop {
            let notified = self.paths_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let available = match self.ready_mtu() {
                Ok(mtu) => {
                    self.set_status(SessionStatus::Running);
                    return Some(mtu);
                }
                Err(available) => available,
            };
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            if tokio::time::timeout(self.config.path_wait_timeout(), notified)
                .await
                .is_err()
            {
                warn!(
                    "세션 {}: 경로 부족 (사용 가능 {}, 필요 {}), 계속 대기",
                    self.session_id, available, self.config.parts
                );
                self.set_status(SessionStatus::WaitingForPaths {
                    available,
                    required: self.config.parts,
                });
            }
        }
    }

    /// 프레임을 N개 share로 쪼개 송신자들에 넘긴다
    fn split_and_send(&self, frame: &[u8]) -> Result<()> {
        let set = self.paths.lock();
        let parts = self.config.parts;
        if set.senders.len() < parts {
            return Err(Error::InsufficientPaths {
                available: set.senders.len(),
                required: parts,
            });
        }
        if frame.len() <= HDR_LEN {
            return Err(Error::FrameTooShort { len: frame.len() });
        }
        // 프레임을 만든 뒤 경로가 바뀌어 MTU가 줄었을 수 있다
        let share_len = frame.len() + shamir::SHARE_OVERHEAD;
        if let Some(mtu) = set.mtu {
            if share_len > mtu {
                return Err(Error::ShareExceedsMtu { len: share_len, mtu });
            }
        }

        let shares = shamir::split(&frame[HDR_LEN..], parts, self.config.threshold)?;
        for (i, (share, sender)) in shares.iter().zip(set.senders.iter()).enumerate() {
            let mut buf = self.pool.acquire();
            buf.extend_from_slice(&frame[..HDR_LEN]);
            set_path_index(&mut buf, i as u8);
            buf.extend_from_slice(share);
            sender.write(buf);
        }
        Ok(())
    }
}

async fn run(shared: Arc<Shared>, mut encoder: Encoder, cipher: FrameCipher) {
    loop {
        if shared.wait_for_paths().await.is_none() {
            break;
        }
        if !encoder.wait_for_packet().await {
            break;
        }
        // 패킷을 기다리는 동안 경로가 바뀌었을 수 있으니 MTU는 지금 다시 읽는다
        let Some(mtu) = shared.wait_for_paths().await else {
            break;
        };

        let frame = match encoder.read_encrypted_frame(mtu, &cipher).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                shared.metrics.record_split_error();
                warn!("세션 {} 프레임 암호화 실패: {}", shared.session_id, e);
                continue;
            }
        };

        match shared.split_and_send(frame) {
            Ok(()) => {}
            Err(e @ Error::ShareExceedsMtu { .. }) => {
                shared.metrics.record_split_error();
                warn!("세션 {} 프레임 버림: {}", shared.session_id, e);
            }
            Err(e) => {
                shared.metrics.record_split_error();
                debug!("세션 {} 프레임 버림: {}", shared.session_id, e);
            }
        }
    }

    // 송신자들은 큐를 다 비우고 끝난다
    for sender in shared.paths.lock().senders.iter() {
        sender.close();
    }
    shared.status.send_replace(SessionStatus::Closed);
    info!("세션 {} 종료", shared.session_id);
}
