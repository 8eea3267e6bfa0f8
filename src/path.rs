//! 경로 추상화
//!
//! 경로 선택/품질 측정은 외부 컴포넌트 몫이고, 여기서는 이미 고른 경로를 다루기 위한 최소한만 정의한다.
//! - `Path`: 식별자(fingerprint), MTU, 원시 데이터플레인 경로, 트랜스포트
//! - `Transport`: 비동기 데이터그램 송신
//! - `PathStatsPublisher`: 경로별 송신 통계 보고

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// 공통 헤더 길이
pub const CMN_HDR_LEN: usize = 12;

/// ISD-AS 식별자 바이트 수
pub const IA_BYTES: usize = 8;

/// UDP 헤더 길이
pub const UDP_HDR_LEN: usize = 8;

/// UDP 데이터그램 하나에 실을 수 있는 최대 바이트 수 (IPv4 기준)
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// 경로 식별자
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathFingerprint(pub String);

impl fmt::Display for PathFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathFingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// `Transport::send`가 돌려주는 future
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// 데이터그램 트랜스포트
pub trait Transport: Send + Sync {
    /// 데이터그램 하나 전송
    fn send<'a>(&'a self, datagram: &'a [u8]) -> SendFuture<'a>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

/// 송신에 쓸 경로
pub trait Path: Send + Sync {
    /// 경로 식별자. 같은 값이면 같은 경로로 취급
    fn fingerprint(&self) -> PathFingerprint;

    /// 경로 MTU (헤더 포함 전체)
    fn mtu(&self) -> usize;

    /// 원시 데이터플레인 경로 바이트. 표현할 수 없는 경로면 `None`
    fn raw_dataplane(&self) -> Option<&[u8]>;

    fn transport(&self) -> Arc<dyn Transport>;
}

/// 경로별 송신 통계 수신자
pub trait PathStatsPublisher: Send + Sync {
    fn publish_egress_stats(&self, fingerprint: &PathFingerprint, frames: u64, bytes: u64);
}

/// 경로 MTU에서 헤더들을 뺀 share 하나의 최대 크기
pub fn usable_mtu(path: &dyn Path) -> Result<usize> {
    let raw = path.raw_dataplane().ok_or_else(|| {
        Error::UnsupportedPath(format!("{}: 원시 데이터플레인 경로 없음", path.fingerprint()))
    })?;

    let transport = path.transport();
    let ip_len = |addr: SocketAddr| match addr {
        SocketAddr::V4(_) => 4,
        SocketAddr::V6(_) => 16,
    };
    let addr_len = IA_BYTES * 2 + ip_len(transport.local_addr()) + ip_len(transport.remote_addr());

    Ok(path
        .mtu()
        .min(MAX_DATAGRAM_LEN)
        .saturating_sub(CMN_HDR_LEN + addr_len + raw.len() + UDP_HDR_LEN))
}

/// 고정된 값을 갖는 경로
pub struct StaticPath {
    fingerprint: PathFingerprint,
    mtu: usize,
    raw: Option<Vec<u8>>,
    transport: Arc<dyn Transport>,
}

impl StaticPath {
    /// 원격 주소와 데이터플레인 바이트로 fingerprint를 만든다
    pub fn new(mtu: usize, raw: Vec<u8>, transport: Arc<dyn Transport>) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(transport.remote_addr().to_string().as_bytes());
        hasher.update(&raw);
        let fingerprint = PathFingerprint(format!("{:08x}", hasher.finalize()));

        Self {
            fingerprint,
            mtu,
            raw: Some(raw),
            transport,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<PathFingerprint>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    /// 원시 데이터플레인 표현이 없는 경로로 바꾼다
    pub fn without_dataplane(mut self) -> Self {
        self.raw = None;
        self
    }
}

impl Path for StaticPath {
    fn fingerprint(&self) -> PathFingerprint {
        self.fingerprint.clone()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn raw_dataplane(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

impl fmt::Debug for StaticPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticPath")
            .field("fingerprint", &self.fingerprint)
            .field("mtu", &self.mtu)
            .field("remote", &self.transport.remote_addr())
            .finish()
    }
}

impl From<String> for PathFingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 한 원격 주소로 보내는 UDP 트랜스포트
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl UdpTransport {
    /// 로컬 주소에 바인딩
    pub async fn bind(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Self::from_socket(Arc::new(socket), remote)
    }

    /// 이미 열린 소켓 공유 (여러 경로가 한 소켓을 쓸 수 있다)
    pub fn from_socket(socket: Arc<UdpSocket>, remote: SocketAddr) -> Result<Self> {
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            remote,
        })
    }
}

impl Transport for UdpTransport {
    fn send<'a>(&'a self, datagram: &'a [u8]) -> SendFuture<'a> {
        Box::pin(self.socket.send_to(datagram, self.remote))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// 메모리 채널로 보내는 트랜스포트 (테스트/데모용)
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl MemoryTransport {
    /// 트랜스포트와, 보낸 데이터그램을 받아볼 수신단
    pub fn new(local: SocketAddr, remote: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, local, remote }, rx)
    }
}

impl Transport for MemoryTransport {
    fn send<'a>(&'a self, datagram: &'a [u8]) -> SendFuture<'a> {
        let result = self
            .tx
            .send(Bytes::copy_from_slice(datagram))
            .map(|_| datagram.len())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "수신단 닫힘"));
        Box::pin(std::future::ready(result))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}
