//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::shamir::ShamirError;

/// SIGMP 데이터플레인 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("비밀 분산 에러: {0}")]
    Shamir(#[from] ShamirError),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("유효하지 않은 (T, N): threshold={threshold}, parts={parts}")]
    InvalidThreshold { threshold: usize, parts: usize },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("프레임이 너무 짧음: {len} 바이트")]
    FrameTooShort { len: usize },

    #[error("MTU 부족: mtu={mtu}, 최소={min}")]
    InsufficientMtu { mtu: usize, min: usize },

    #[error("share가 경로 MTU보다 큼: share={len}, mtu={mtu}")]
    ShareExceedsMtu { len: usize, mtu: usize },

    #[error("지원하지 않는 경로: {0}")]
    UnsupportedPath(String),

    #[error("경로 부족: 사용 가능 {available}, 필요 {required}")]
    InsufficientPaths { available: usize, required: usize },

    #[error("세션 종료")]
    SessionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
