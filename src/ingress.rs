//! 수신 측 진입점
//!
//! - 데이터그램 → share 파싱
//! - (세션 ID, 스트림 ID)별로 디코더 + 재조립 리스트 하나씩
//! - 한 스트림의 삽입/정리는 DashMap 엔트리 락으로 직렬화
//! - 백그라운드 태스크가 주기적으로 정리
//! - 제거된 스트림의 워터마크는 한동안 기억해서, 늦게 온 share로 같은 패킷을 두 번 내보내지 않는다

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::FrameCipher;
use crate::decoder::Decoder;
use crate::frame::Share;
use crate::pool::BufferPool;
use crate::reassembly::{PacketSink, ReassemblyList};
use crate::stats::IngressMetrics;
use crate::{Config, Result};

/// 제거된 스트림의 워터마크를 기억하는 정리 주기 수
const RETIRED_STREAM_SWEEPS: u32 = 16;

/// 스트림 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub session_id: u8,
    pub stream_id: u32,
}

struct StreamState {
    decoder: Decoder,
    reassembly: ReassemblyList,

    /// 마지막 데이터그램 이후 지난 정리 주기 수
    idle_sweeps: u32,
}

/// 유휴로 제거된 스트림
struct RetiredStream {
    watermark: u64,
    sweeps: u32,
}

/// 수신기
pub struct Ingress {
    config: Config,
    cipher: FrameCipher,
    pool: BufferPool,
    streams: DashMap<StreamKey, StreamState>,
    retired: DashMap<StreamKey, RetiredStream>,
    sink: Arc<dyn PacketSink>,
    metrics: Arc<IngressMetrics>,
    running: AtomicBool,
}

impl Ingress {
    /// 재조립된 패킷을 `sink`로 내보내는 수신기 생성
    pub fn new(config: Config, cipher: FrameCipher, sink: Arc<dyn PacketSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool: BufferPool::new(config.pool_capacity, config.buffer_size),
            config,
            cipher,
            streams: DashMap::new(),
            retired: DashMap::new(),
            sink,
            metrics: Arc::new(IngressMetrics::new()),
            running: AtomicBool::new(true),
        })
    }

    /// 데이터그램(share) 하나 처리
    pub fn handle_datagram(&self, datagram: &[u8]) -> Result<()> {
        self.metrics.record_share();
        let share = match Share::parse(&self.pool, datagram) {
            Ok(share) => share,
            Err(e) => {
                self.metrics.record_invalid_share();
                return Err(e);
            }
        };

        let key = StreamKey {
            session_id: share.header.session_id,
            stream_id: share.header.stream_id,
        };
        let mut entry = self.streams.entry(key).or_insert_with(|| {
            debug!("새 스트림: session {} stream {:#07x}", key.session_id, key.stream_id);
            self.new_stream(key)
        });
        let state = entry.value_mut();
        state.idle_sweeps = 0;

        if let Some(frame) = state.decoder.insert(share) {
            state.reassembly.insert(frame, self.sink.as_ref());
        }
        Ok(())
    }

    fn new_stream(&self, key: StreamKey) -> StreamState {
        let mut state = StreamState {
            decoder: Decoder::new(
                &self.config,
                self.cipher.clone(),
                self.pool.clone(),
                self.metrics.clone(),
            ),
            reassembly: ReassemblyList::new(
                self.config.reassembly_capacity,
                self.config.max_idle_sweeps,
                self.metrics.clone(),
            ),
            idle_sweeps: 0,
        };
        if let Some((_, retired)) = self.retired.remove(&key) {
            debug!(
                "제거됐던 스트림 복귀: session {} stream {:#07x}, 워터마크 {}",
                key.session_id, key.stream_id, retired.watermark
            );
            state.reassembly.restore_watermark(retired.watermark);
        }
        state
    }

    /// 모든 스트림 정리
    ///
    /// 만료된 share 그룹과 정체된 재조립 상태를 치우고, 오래 조용한 빈 스트림은 제거한다.
    pub fn sweep(&self) {
        let max_idle = self.config.max_idle_sweeps;
        self.retired.retain(|_, retired| {
            retired.sweeps += 1;
            retired.sweeps <= RETIRED_STREAM_SWEEPS
        });

        self.streams.retain(|key, state| {
            state.decoder.sweep();
            state.reassembly.sweep(self.sink.as_ref());

            state.idle_sweeps += 1;
            if state.idle_sweeps > max_idle && state.decoder.is_empty() && state.reassembly.is_empty() {
                trace!("유휴 스트림 제거: session {} stream {:#07x}", key.session_id, key.stream_id);
                if let Some(watermark) = state.reassembly.watermark() {
                    self.retired.insert(*key, RetiredStream { watermark, sweeps: 0 });
                }
                return false;
            }
            true
        });
    }

    /// 백그라운드 정리 태스크 시작
    ///
    /// 수신기가 drop되거나 `stop()`되면 끝난다.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(ingress) = weak.upgrade() else {
                    break;
                };
                if !ingress.is_running() {
                    break;
                }
                ingress.sweep();
            }
        })
    }

    /// UDP 소켓에서 받아 처리하는 루프
    ///
    /// `stop()`이 호출될 때까지 돈다.
    pub async fn serve(self: Arc<Self>, socket: Arc<UdpSocket>) -> Result<()> {
        info!("SIGMP Ingress started on {}", socket.local_addr()?);
        let mut buf = vec![0u8; self.config.buffer_size];

        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_millis(10), socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    if let Err(e) = self.handle_datagram(&buf[..len]) {
                        trace!("{}에서 온 데이터그램 버림: {}", from, e);
                    }
                }
                Ok(Err(e)) => {
                    warn!("수신 에러: {}", e);
                }
                Err(_) => {
                    // 타임아웃, 계속
                }
            }
        }

        info!("SIGMP Ingress stopped");
        Ok(())
    }

    /// 수신 루프/정리 태스크 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Arc<IngressMetrics> {
        self.metrics.clone()
    }

    /// 현재 추적 중인 스트림 수
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// 특정 스트림의 재조립 워터마크
    pub fn watermark(&self, session_id: u8, stream_id: u32) -> Option<u64> {
        self.streams
            .get(&StreamKey {
                session_id,
                stream_id,
            })
            .and_then(|state| state.reassembly.watermark())
    }
}

/// UDP 소켓 바인딩 후 수신 루프와 정리 태스크를 띄운다
pub async fn bind_and_serve(
    ingress: Arc<Ingress>,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local = socket.local_addr()?;
    ingress.spawn_sweeper();
    let handle = tokio::spawn(ingress.serve(socket));
    Ok((local, handle))
}
