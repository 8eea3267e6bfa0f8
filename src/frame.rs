//! SIG 프레임/share 와이어 형식
//!
//! ```text
//!  0       1       2               4                               8
//! +-------+-------+---------------+-------------------------------+
//! |version|session|     index     | reserved(12) | stream id(20)  |
//! +-------+-------+---------------+-------------------------------+
//! |                     sequence number (u64)                     |
//! +---------------------------------------------------------------+
//! |                            payload                            |
//! ```
//!
//! 모든 정수는 빅엔디언. share는 같은 헤더를 쓰되 시퀀스 번호 하위 바이트에 경로 인덱스를 싣는다.

use crate::pool::{BufferPool, PooledBuf};
use crate::{Error, Result, HDR_LEN, NO_PACKET_START, PROTOCOL_VERSION, STREAM_ID_MASK};

/// 프레임 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 프로토콜 버전
    pub version: u8,

    /// 세션 ID
    pub session_id: u8,

    /// 이 프레임에서 처음 시작하는 패킷의 페이로드 내 오프셋 (`NO_PACKET_START`면 없음)
    pub index: u16,

    /// 스트림 ID (20비트)
    pub stream_id: u32,

    /// 시퀀스 번호
    pub seq: u64,
}

impl FrameHeader {
    pub fn new(session_id: u8, stream_id: u32, seq: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session_id,
            index: NO_PACKET_START,
            stream_id: stream_id & STREAM_ID_MASK,
            seq,
        }
    }

    /// 바이트에서 파싱
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HDR_LEN {
            return Err(Error::FrameTooShort { len: bytes.len() });
        }
        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let stream_word = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[8..16]);

        Ok(Self {
            version,
            session_id: bytes[1],
            index: u16::from_be_bytes([bytes[2], bytes[3]]),
            stream_id: stream_word & STREAM_ID_MASK,
            seq: u64::from_be_bytes(seq),
        })
    }

    /// `out[..HDR_LEN]`에 기록
    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.version;
        out[1] = self.session_id;
        out[2..4].copy_from_slice(&self.index.to_be_bytes());
        // 상위 12비트는 예약 (0)
        out[4..8].copy_from_slice(&(self.stream_id & STREAM_ID_MASK).to_be_bytes());
        out[8..16].copy_from_slice(&self.seq.to_be_bytes());
    }

    pub fn to_bytes(&self) -> [u8; HDR_LEN] {
        let mut out = [0u8; HDR_LEN];
        self.write_to(&mut out);
        out
    }

    /// 그룹 시퀀스 번호 (share들이 공유하는 상위 비트)
    #[inline]
    pub fn group_seq(&self) -> u64 {
        self.seq >> 8
    }

    /// 경로 인덱스 (시퀀스 번호 하위 바이트)
    #[inline]
    pub fn path_index(&self) -> u8 {
        (self.seq & 0xFF) as u8
    }

    /// 이 프레임에서 시작하는 패킷이 있는지
    #[inline]
    pub fn has_packet_start(&self) -> bool {
        self.index != NO_PACKET_START
    }
}

/// 이미 직렬화된 데이터그램의 경로 인덱스 자리를 덮어쓴다
pub fn set_path_index(datagram: &mut [u8], index: u8) {
    datagram[HDR_LEN - 1] = index;
}

/// 수신한 share 하나
///
/// 버퍼에는 헤더를 포함한 데이터그램 전체가 들어 있다.
#[derive(Debug)]
pub struct Share {
    pub header: FrameHeader,
    buf: PooledBuf,
}

impl Share {
    /// 데이터그램을 풀 버퍼로 복사하며 파싱
    pub fn parse(pool: &BufferPool, datagram: &[u8]) -> Result<Self> {
        // share는 최소 1바이트 비밀 + 1바이트 x 태그
        if datagram.len() < HDR_LEN + 2 {
            return Err(Error::FrameTooShort { len: datagram.len() });
        }
        let header = FrameHeader::parse(datagram)?;

        let mut buf = pool.acquire();
        buf.extend_from_slice(datagram);
        Ok(Self { header, buf })
    }

    /// 헤더를 뺀 share 데이터 (마지막 바이트가 x 태그)
    pub fn payload(&self) -> &[u8] {
        &self.buf[HDR_LEN..]
    }

    pub fn group_seq(&self) -> u64 {
        self.header.group_seq()
    }

    pub fn path_index(&self) -> u8 {
        self.header.path_index()
    }

    /// 버퍼를 풀에 반환
    pub fn release(self) {
        self.buf.release();
    }
}

impl AsRef<[u8]> for Share {
    fn as_ref(&self) -> &[u8] {
        self.payload()
    }
}

/// 복원 + 복호화가 끝난 프레임
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    buf: PooledBuf,
}

impl Frame {
    /// 헤더 + 평문 페이로드가 담긴 버퍼로 프레임 생성
    pub fn from_buf(buf: PooledBuf) -> Result<Self> {
        let header = FrameHeader::parse(&buf)?;
        Ok(Self { header, buf })
    }

    pub fn group_seq(&self) -> u64 {
        self.header.group_seq()
    }

    /// 첫 패킷 시작 오프셋
    pub fn index(&self) -> Option<usize> {
        self.header
            .has_packet_start()
            .then_some(self.header.index as usize)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HDR_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// 버퍼를 풀에 반환
    pub fn release(self) {
        self.buf.release();
    }
}

/// IP 헤더에 적힌 전체 패킷 길이
///
/// 버전이 4/6이 아니거나 길이 필드를 읽을 만큼 바이트가 없으면 `None`.
pub fn ip_packet_len(bytes: &[u8]) -> Option<usize> {
    let first = *bytes.first()?;
    match first >> 4 {
        4 => {
            if bytes.len() < 4 {
                return None;
            }
            let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
            (len >= 20).then_some(len)
        }
        6 => {
            if bytes.len() < 6 {
                return None;
            }
            Some(40 + u16::from_be_bytes([bytes[4], bytes[5]]) as usize)
        }
        _ => None,
    }
}

/// 완결된 IP 패킷인지 (헤더 길이 필드 == 실제 길이)
pub fn is_valid_ip_packet(packet: &[u8]) -> bool {
    let min = match packet.first().map(|b| b >> 4) {
        Some(4) => 20,
        Some(6) => 40,
        _ => return false,
    };
    packet.len() >= min && ip_packet_len(packet) == Some(packet.len())
}
