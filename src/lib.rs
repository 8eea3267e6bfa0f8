//! # SIGMP (Secret-shared Multipath SIG dataplane)
//!
//! IP 패킷을 SIG 프레임으로 묶고, 프레임을 (T, N) 비밀 분산으로 쪼개 N개 경로로 동시 전송
//!
//! ## 핵심 특징
//! - **프레임 인코더**: 프레임 경계를 넘는 패킷 이어붙이기
//! - **Shamir 비밀 분산**: GF(2^8) 상수 시간 연산, T개 미만 share는 정보 없음
//! - **AEAD**: ChaCha20-Poly1305로 프레임 페이로드 암호화
//! - **경로별 송신자**: 경로 하나당 큐 하나 + tokio 태스크 하나, 가득 차면 버림
//! - **재조립**: 순서 뒤바뀜/중복/손실을 견디는 워터마크 기반 재조립
//! - **버퍼 풀**: 프레임/share 버퍼 재사용

pub mod config;
pub mod crypto;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod ingress;
pub mod path;
pub mod pool;
pub mod reassembly;
pub mod sender;
pub mod session;
pub mod shamir;
pub mod stats;

pub use config::Config;
pub use crypto::{CryptoError, FrameCipher};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{Error, Result};
pub use frame::{Frame, FrameHeader, Share};
pub use ingress::Ingress;
pub use path::{MemoryTransport, Path, PathFingerprint, PathStatsPublisher, StaticPath, Transport, UdpTransport};
pub use pool::{BufferPool, PooledBuf};
pub use reassembly::{PacketSink, ReassemblyList};
pub use sender::PathSender;
pub use session::{Session, SessionStatus};
pub use shamir::ShamirError;
pub use stats::{IngressMetrics, IngressStats, SessionMetrics, SessionStats};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 0;

/// SIG 프레임 헤더 크기 (바이트)
pub const HDR_LEN: usize = 16;

/// 프레임 사이 시퀀스 번호 간격 (하위 8비트는 경로 인덱스 자리)
pub const SEQ_STEP: u64 = 256;

/// 이 프레임에서 시작하는 패킷이 없음을 나타내는 index 값
pub const NO_PACKET_START: u16 = 0xFFFF;

/// 스트림 ID 마스크 (20비트)
pub const STREAM_ID_MASK: u32 = 0x000F_FFFF;

/// 프레임에 남은 공간이 이보다 작으면 프레임을 마감
pub const MIN_FRAME_ROOM: usize = 40;

/// 경로가 가져야 할 최소 페이로드 MTU
///
/// 헤더 + share 태그 + nonce/태그 + 최소 IPv4 패킷보다 조금 큰 값
pub const MIN_MTU: usize = HDR_LEN + shamir::SHARE_OVERHEAD + crypto::CIPHER_OVERHEAD + 41;
