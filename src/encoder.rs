//! 프레임 인코더
//!
//! 입력 큐에서 IP 패킷을 꺼내 SIG 프레임으로 채운다.
//! - 프레임에 다 들어가지 않는 패킷은 나머지를 다음 프레임 앞에 이어붙임
//! - 프레임이 헤더뿐일 때만 입력을 기다리고, 페이로드가 있으면 큐가 비는 즉시 마감
//! - 잘못된 IP 패킷은 통째로 버린다

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::crypto::{FrameCipher, CIPHER_OVERHEAD};
use crate::frame::{is_valid_ip_packet, FrameHeader};
use crate::shamir::SHARE_OVERHEAD;
use crate::stats::SessionMetrics;
use crate::{Result, HDR_LEN, MIN_FRAME_ROOM, SEQ_STEP, STREAM_ID_MASK};

/// 무작위 스트림 ID 생성 (20비트)
pub fn new_stream_id() -> u32 {
    rand::random::<u32>() & STREAM_ID_MASK
}

/// IP 패킷 → SIG 프레임 인코더
pub struct Encoder {
    session_id: u8,
    stream_id: u32,

    /// 입력 패킷 큐
    rx: mpsc::Receiver<Bytes>,

    /// 다음 프레임 시퀀스 번호
    seq: u64,

    /// 이전 프레임에 다 못 넣은 패킷 나머지
    pkt: Bytes,

    /// `wait_for_packet`으로 미리 받아 둔 패킷
    next: Option<Bytes>,

    /// 재사용하는 프레임 버퍼
    frame: Vec<u8>,

    metrics: Arc<SessionMetrics>,
}

impl Encoder {
    /// 인코더와 입력 큐 송신단 생성
    pub fn new(
        session_id: u8,
        capacity: usize,
        metrics: Arc<SessionMetrics>,
    ) -> (mpsc::Sender<Bytes>, Self) {
        Self::with_stream_id(session_id, new_stream_id(), capacity, metrics)
    }

    /// 스트림 ID를 지정해서 생성
    pub fn with_stream_id(
        session_id: u8,
        stream_id: u32,
        capacity: usize,
        metrics: Arc<SessionMetrics>,
    ) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let encoder = Self {
            session_id,
            stream_id: stream_id & STREAM_ID_MASK,
            rx,
            seq: 0,
            pkt: Bytes::new(),
            next: None,
            frame: Vec::new(),
            metrics,
        };
        (tx, encoder)
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// 다음 프레임에 넣을 데이터가 생길 때까지 대기
    ///
    /// 입력 큐가 닫히고 비었으면 false. 취소돼도 받은 패킷은 잃지 않으므로
    /// 호출자는 데이터가 있을 때 MTU를 정하고 곧바로 프레임을 만들 수 있다.
    pub async fn wait_for_packet(&mut self) -> bool {
        if !self.pkt.is_empty() || self.next.is_some() {
            return true;
        }
        match self.rx.recv().await {
            Some(pkt) => {
                self.next = Some(pkt);
                true
            }
            None => false,
        }
    }

    /// 평문 프레임 하나 읽기
    ///
    /// `mtu`는 share 하나의 최대 크기이므로 프레임은 x 태그 1바이트만큼 작게 만든다.
    /// 입력 큐가 닫히고 다 비면 `None` (이후로도 계속 `None`).
    pub async fn read_frame(&mut self, mtu: usize) -> Option<&[u8]> {
        let limit = mtu.saturating_sub(SHARE_OVERHEAD);
        if self.fill_frame(limit).await {
            Some(&self.frame)
        } else {
            None
        }
    }

    /// 페이로드를 암호화한 프레임 하나 읽기
    ///
    /// 결과: 헤더 + nonce + ciphertext + tag, 전체 길이는 `mtu - 1` 이하
    pub async fn read_encrypted_frame(
        &mut self,
        mtu: usize,
        cipher: &FrameCipher,
    ) -> Result<Option<&[u8]>> {
        let limit = mtu.saturating_sub(SHARE_OVERHEAD + CIPHER_OVERHEAD);
        if !self.fill_frame(limit).await {
            return Ok(None);
        }
        cipher.seal_in_place(&mut self.frame, HDR_LEN)?;
        Ok(Some(&self.frame))
    }

    /// 프레임 버퍼를 `limit` 바이트까지 채운다. 큐가 닫히고 비었으면 false
    async fn fill_frame(&mut self, limit: usize) -> bool {
        // index가 u16에 들어가도록
        let limit = limit.min(HDR_LEN + u16::MAX as usize);
        self.frame.clear();
        let header = FrameHeader::new(self.session_id, self.stream_id, self.seq);
        self.frame.extend_from_slice(&header.to_bytes());
        self.seq = self.seq.wrapping_add(SEQ_STEP);

        // 이전 패킷의 나머지부터
        if !self.pkt.is_empty() {
            self.copy_to_frame(limit);
            if !self.pkt.is_empty() {
                self.metrics.record_frame_built();
                return true;
            }
        }

        let mut index_set = false;
        loop {
            // IPv6 헤더가 들어갈 자리도 없으면 마감
            if limit.saturating_sub(self.frame.len()) < MIN_FRAME_ROOM {
                break;
            }

            let pkt = if let Some(pkt) = self.next.take() {
                pkt
            } else if self.frame.len() == HDR_LEN {
                match self.rx.recv().await {
                    Some(pkt) => pkt,
                    None => return false,
                }
            } else {
                match self.rx.try_recv() {
                    Ok(pkt) => pkt,
                    // 비었거나 닫힘: 있는 것만 보낸다. 닫힌 경우 다음 호출이 None을 준다
                    Err(_) => break,
                }
            };

            if !is_valid_ip_packet(&pkt) {
                trace!("잘못된 IP 패킷 버림: {} 바이트", pkt.len());
                self.metrics.record_invalid_packet();
                continue;
            }

            if !index_set {
                let offset = (self.frame.len() - HDR_LEN) as u16;
                self.frame[2..4].copy_from_slice(&offset.to_be_bytes());
                index_set = true;
            }

            self.pkt = pkt;
            self.copy_to_frame(limit);
            if !self.pkt.is_empty() {
                break;
            }
        }

        self.metrics.record_frame_built();
        true
    }

    fn copy_to_frame(&mut self, limit: usize) {
        let room = limit.saturating_sub(self.frame.len());
        let n = room.min(self.pkt.len());
        let chunk = self.pkt.split_to(n);
        self.frame.extend_from_slice(&chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::ipv4_packet;
    use crate::NO_PACKET_START;

    fn encoder() -> (mpsc::Sender<Bytes>, Encoder) {
        Encoder::with_stream_id(1, 2, 16, Arc::new(SessionMetrics::new()))
    }

    #[tokio::test]
    async fn test_simple_ipv4_packet() {
        let (tx, mut e) = encoder();
        let pkt = ipv4_packet(3, 9);
        tx.send(Bytes::from(pkt.clone())).await.unwrap();
        drop(tx);

        let frame = e.read_frame(1500).await.unwrap().to_vec();
        assert_eq!(frame[..HDR_LEN], [0, 1, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&frame[HDR_LEN..], pkt.as_slice());

        assert!(e.read_frame(1500).await.is_none());
        assert!(e.read_frame(1500).await.is_none());
    }

    #[tokio::test]
    async fn test_two_packets_in_one_frame() {
        let (tx, mut e) = encoder();
        let a = ipv4_packet(3, 4);
        let b = ipv4_packet(2, 7);
        tx.send(Bytes::from(a.clone())).await.unwrap();
        tx.send(Bytes::from(b.clone())).await.unwrap();
        drop(tx);

        let frame = e.read_frame(1500).await.unwrap().to_vec();
        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.index, 0);
        assert_eq!(&frame[HDR_LEN..HDR_LEN + 23], a.as_slice());
        assert_eq!(&frame[HDR_LEN + 23..], b.as_slice());
        assert!(e.read_frame(1500).await.is_none());
    }

    #[tokio::test]
    async fn test_packet_split_across_frames() {
        let (tx, mut e) = encoder();
        let pkt = ipv4_packet(22, 1);
        tx.send(Bytes::from(pkt.clone())).await.unwrap();
        drop(tx);

        // 프레임 한도 56 = 헤더 16 + 40
        let first = e.read_frame(57).await.unwrap().to_vec();
        assert_eq!(first.len(), 56);
        assert_eq!(FrameHeader::parse(&first).unwrap().index, 0);
        assert_eq!(&first[HDR_LEN..], &pkt[..40]);

        let second = e.read_frame(57).await.unwrap().to_vec();
        let header = FrameHeader::parse(&second).unwrap();
        assert_eq!(header.index, NO_PACKET_START);
        assert_eq!(header.seq, SEQ_STEP);
        assert_eq!(&second[HDR_LEN..], &pkt[40..]);

        assert!(e.read_frame(57).await.is_none());
    }

    #[tokio::test]
    async fn test_second_packet_starts_mid_frame() {
        let (tx, mut e) = encoder();
        let a = ipv4_packet(24, 1);
        let b = ipv4_packet(2, 2);
        tx.send(Bytes::from(a.clone())).await.unwrap();
        tx.send(Bytes::from(b.clone())).await.unwrap();
        drop(tx);

        let first = e.read_frame(59).await.unwrap().to_vec();
        assert_eq!(&first[HDR_LEN..], &a[..42]);

        let second = e.read_frame(59).await.unwrap().to_vec();
        assert_eq!(FrameHeader::parse(&second).unwrap().index, 2);
        assert_eq!(&second[HDR_LEN..HDR_LEN + 2], &a[42..]);
        assert_eq!(&second[HDR_LEN + 2..], b.as_slice());
    }

    #[tokio::test]
    async fn test_invalid_packets_discarded() {
        let metrics = Arc::new(SessionMetrics::new());
        let (tx, mut e) = Encoder::with_stream_id(1, 2, 16, metrics.clone());

        let mut bad_len = ipv4_packet(10, 0);
        bad_len.truncate(25);
        tx.send(Bytes::from(bad_len)).await.unwrap();
        tx.send(Bytes::from_static(&[0x50; 30])).await.unwrap();
        tx.send(Bytes::new()).await.unwrap();
        let good = ipv4_packet(1, 3);
        tx.send(Bytes::from(good.clone())).await.unwrap();
        drop(tx);

        let frame = e.read_frame(1500).await.unwrap().to_vec();
        assert_eq!(&frame[HDR_LEN..], good.as_slice());
        assert_eq!(metrics.snapshot().invalid_packets, 3);
    }

    #[tokio::test]
    async fn test_blocks_until_packet_arrives() {
        let (tx, mut e) = encoder();
        let pkt = ipv4_packet(5, 5);
        let expected = pkt.clone();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send(Bytes::from(pkt)).await.unwrap();
            tx
        });

        let frame = e.read_frame(1500).await.unwrap().to_vec();
        assert_eq!(&frame[HDR_LEN..], expected.as_slice());
        drop(writer.await.unwrap());
        assert!(e.read_frame(1500).await.is_none());
    }

    #[tokio::test]
    async fn test_encrypted_frame() {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let (tx, mut e) = encoder();
        let pkt = ipv4_packet(3, 1);
        tx.send(Bytes::from(pkt.clone())).await.unwrap();
        drop(tx);

        let frame = e.read_encrypted_frame(1500, &cipher).await.unwrap().unwrap().to_vec();
        assert_eq!(frame.len(), HDR_LEN + pkt.len() + CIPHER_OVERHEAD);
        assert_eq!(cipher.decrypt(&frame[HDR_LEN..]).unwrap(), pkt);
        assert!(e.read_encrypted_frame(1500, &cipher).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_encrypted_frame_respects_mtu() {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let (tx, mut e) = encoder();
        tx.send(Bytes::from(ipv4_packet(1000, 1))).await.unwrap();
        drop(tx);

        let mtu = 300;
        while let Some(frame) = e.read_encrypted_frame(mtu, &cipher).await.unwrap() {
            assert!(frame.len() + SHARE_OVERHEAD <= mtu);
        }
    }

    #[tokio::test]
    async fn test_mtu_chosen_after_packet_is_ready() {
        let (tx, mut e) = encoder();
        let pkt = ipv4_packet(80, 6);
        tx.send(Bytes::from(pkt.clone())).await.unwrap();
        drop(tx);

        assert!(e.wait_for_packet().await);
        assert!(e.wait_for_packet().await);

        // 미리 받아 둔 패킷도 나중에 정한 MTU로 잘린다
        let first = e.read_frame(57).await.unwrap().to_vec();
        assert_eq!(first.len(), 56);
        assert_eq!(&first[HDR_LEN..], &pkt[..40]);

        assert!(e.wait_for_packet().await);
        let second = e.read_frame(1500).await.unwrap().to_vec();
        assert_eq!(&second[HDR_LEN..], &pkt[40..]);

        assert!(!e.wait_for_packet().await);
        assert!(e.read_frame(1500).await.is_none());
    }

    #[tokio::test]
    async fn test_huge_mtu_keeps_index_in_range() {
        let (tx, mut e) = encoder();
        let a = ipv4_packet(65_515, 1);
        let b = ipv4_packet(65_515, 2);
        tx.send(Bytes::from(a.clone())).await.unwrap();
        tx.send(Bytes::from(b.clone())).await.unwrap();
        drop(tx);

        let first = e.read_frame(usize::MAX).await.unwrap().to_vec();
        assert_eq!(first.len(), HDR_LEN + u16::MAX as usize);
        assert_eq!(FrameHeader::parse(&first).unwrap().index, 0);
        assert_eq!(&first[HDR_LEN..], a.as_slice());

        let second = e.read_frame(usize::MAX).await.unwrap().to_vec();
        assert_eq!(FrameHeader::parse(&second).unwrap().index, 0);
        assert_eq!(&second[HDR_LEN..], b.as_slice());
        assert!(e.read_frame(usize::MAX).await.is_none());
    }
}
