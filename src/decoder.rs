//! 디코더
//!
//! 받은 share를 그룹 시퀀스 번호별 그룹에 모으고, T개가 모이면 복원 + 복호화해서 프레임을 만든다.
//!
//! 그룹 상태: collecting → combined → (sweep에서) 제거. 되돌아가지 않는다.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::crypto::FrameCipher;
use crate::frame::{Frame, FrameHeader, Share};
use crate::pool::BufferPool;
use crate::shamir;
use crate::stats::IngressMetrics;
use crate::{Config, HDR_LEN};

/// 한 프레임의 share 모음
#[derive(Debug)]
struct ShareGroup {
    /// 경로 인덱스별 share
    shares: Vec<Option<Share>>,
    received: usize,
    combined: bool,
    idle_sweeps: u32,
}

impl ShareGroup {
    fn new(parts: usize) -> Self {
        Self {
            shares: (0..parts).map(|_| None).collect(),
            received: 0,
            combined: false,
            idle_sweeps: 0,
        }
    }

    /// share 버퍼를 모두 풀에 반환
    fn release(&mut self) {
        for share in self.shares.iter_mut().filter_map(Option::take) {
            share.release();
        }
        self.received = 0;
    }
}

/// share → 프레임 디코더 (스트림 하나)
pub struct Decoder {
    threshold: usize,
    parts: usize,
    cipher: FrameCipher,
    pool: BufferPool,
    groups: BTreeMap<u64, ShareGroup>,
    max_groups: usize,
    max_idle_sweeps: u32,
    metrics: Arc<IngressMetrics>,
}

impl Decoder {
    pub fn new(
        config: &Config,
        cipher: FrameCipher,
        pool: BufferPool,
        metrics: Arc<IngressMetrics>,
    ) -> Self {
        Self {
            threshold: config.threshold,
            parts: config.parts,
            cipher,
            pool,
            groups: BTreeMap::new(),
            max_groups: config.max_share_groups.max(1),
            max_idle_sweeps: config.max_idle_sweeps,
            metrics,
        }
    }

    /// share 하나 추가. 이 share로 그룹이 복원되면 프레임 반환
    pub fn insert(&mut self, share: Share) -> Option<Frame> {
        let group_seq = share.group_seq();
        let path_index = share.path_index() as usize;

        if path_index >= self.parts {
            trace!("범위 밖 경로 인덱스 {} (N={})", path_index, self.parts);
            self.metrics.record_invalid_share();
            share.release();
            return None;
        }

        if !self.groups.contains_key(&group_seq) && self.groups.len() >= self.max_groups {
            if let Some((evicted_seq, mut evicted)) = self.groups.pop_first() {
                if !evicted.combined {
                    self.metrics.record_group_expired();
                    debug!("share 그룹 {} 용량 초과로 버림", evicted_seq);
                }
                evicted.release();
            }
        }

        let group = self
            .groups
            .entry(group_seq)
            .or_insert_with(|| ShareGroup::new(self.parts));

        if group.combined {
            self.metrics.record_stale_share();
            share.release();
            return None;
        }
        if group.shares[path_index].is_some() {
            self.metrics.record_duplicate_share();
            share.release();
            return None;
        }

        group.shares[path_index] = Some(share);
        group.received += 1;
        if group.received < self.threshold {
            return None;
        }

        let frame = combine_group(group, &self.cipher, &self.pool, &self.metrics)?;
        group.combined = true;
        group.release();
        self.metrics.record_combined();
        Some(frame)
    }

    /// 정리 주기마다 호출
    ///
    /// 복원된 그룹은 제거하고, `max_idle_sweeps`번 넘게 미완성으로 남은 그룹은 버린다.
    pub fn sweep(&mut self) {
        let max_idle = self.max_idle_sweeps;
        let metrics = &self.metrics;
        self.groups.retain(|group_seq, group| {
            if group.combined {
                return false;
            }
            group.idle_sweeps += 1;
            if group.idle_sweeps > max_idle {
                trace!("미완성 share 그룹 {} 만료 ({}개)", group_seq, group.received);
                metrics.record_group_expired();
                group.release();
                return false;
            }
            true
        });
    }

    /// 보관 중인 그룹 수
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// 그룹에 있는 share를 모두 써서 복원 + 복호화
///
/// 실패하면 그룹은 그대로 두고 `None` (다음 share로 다시 시도).
fn combine_group(
    group: &ShareGroup,
    cipher: &FrameCipher,
    pool: &BufferPool,
    metrics: &IngressMetrics,
) -> Option<Frame> {
    let present: Vec<&Share> = group.shares.iter().flatten().collect();
    let first = present.first()?;

    // 프레임 헤더는 share 헤더에서 경로 인덱스만 지운 것
    let header = FrameHeader {
        seq: first.header.seq & !0xFF,
        ..first.header
    };

    let mut buf = pool.acquire();
    buf.extend_from_slice(&header.to_bytes());

    let payloads: Vec<&[u8]> = present.iter().map(|s| s.payload()).collect();
    if let Err(e) = shamir::combine_into(&payloads, &mut buf) {
        debug!("share 그룹 {} 복원 실패: {}", header.group_seq(), e);
        metrics.record_combine_failure();
        return None;
    }

    if let Err(e) = cipher.open_in_place(&mut buf, HDR_LEN) {
        debug!("share 그룹 {} 복호화 실패: {}", header.group_seq(), e);
        metrics.record_decrypt_failure();
        return None;
    }

    Frame::from_buf(buf).ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::set_path_index;
    use crate::SEQ_STEP;

    /// 프레임 하나를 암호화 + 분할한 share 데이터그램들
    pub(crate) fn make_shares(
        cipher: &FrameCipher,
        stream_id: u32,
        group_seq: u64,
        index: u16,
        payload: &[u8],
        parts: usize,
        threshold: usize,
    ) -> Vec<Vec<u8>> {
        let mut header = FrameHeader::new(1, stream_id, group_seq * SEQ_STEP);
        header.index = index;
        let encrypted = cipher.encrypt(payload).unwrap();

        shamir::split(&encrypted, parts, threshold)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, share)| {
                let mut datagram = header.to_bytes().to_vec();
                set_path_index(&mut datagram, i as u8);
                datagram.extend_from_slice(&share);
                datagram
            })
            .collect()
    }

    fn setup(threshold: usize, parts: usize) -> (Decoder, FrameCipher, BufferPool, Arc<IngressMetrics>) {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let pool = BufferPool::new(64, 2048);
        let metrics = Arc::new(IngressMetrics::new());
        let config = Config {
            max_share_groups: 4,
            ..Config::with_threshold(threshold, parts)
        };
        let decoder = Decoder::new(&config, cipher.clone(), pool.clone(), metrics.clone());
        (decoder, cipher, pool, metrics)
    }

    #[test]
    fn test_threshold_combines() {
        let (mut decoder, cipher, pool, metrics) = setup(2, 3);
        let shares = make_shares(&cipher, 5, 7, 0, b"frame payload", 3, 2);

        assert!(decoder.insert(Share::parse(&pool, &shares[2]).unwrap()).is_none());
        let frame = decoder.insert(Share::parse(&pool, &shares[0]).unwrap()).unwrap();

        assert_eq!(frame.payload(), b"frame payload");
        assert_eq!(frame.group_seq(), 7);
        assert_eq!(frame.header.stream_id, 5);
        assert_eq!(frame.index(), Some(0));
        assert_eq!(frame.header.path_index(), 0);
        assert_eq!(metrics.snapshot().groups_combined, 1);

        // 복원 뒤 늦게 온 share
        assert!(decoder.insert(Share::parse(&pool, &shares[1]).unwrap()).is_none());
        assert_eq!(metrics.snapshot().stale_shares, 1);
    }

    #[test]
    fn test_duplicate_share_only_counts() {
        let (mut decoder, cipher, pool, metrics) = setup(3, 5);
        let shares = make_shares(&cipher, 5, 1, 0xFFFF, b"abc", 5, 3);

        assert!(decoder.insert(Share::parse(&pool, &shares[4]).unwrap()).is_none());
        assert!(decoder.insert(Share::parse(&pool, &shares[4]).unwrap()).is_none());
        assert!(decoder.insert(Share::parse(&pool, &shares[1]).unwrap()).is_none());
        assert_eq!(metrics.snapshot().duplicate_shares, 1);

        let frame = decoder.insert(Share::parse(&pool, &shares[3]).unwrap()).unwrap();
        assert_eq!(frame.payload(), b"abc");
        assert_eq!(frame.index(), None);
    }

    #[test]
    fn test_out_of_range_path_index() {
        let (mut decoder, cipher, pool, metrics) = setup(2, 3);
        let shares = make_shares(&cipher, 5, 1, 0, b"abc", 4, 2);

        assert!(decoder.insert(Share::parse(&pool, &shares[3]).unwrap()).is_none());
        assert_eq!(metrics.snapshot().invalid_shares, 1);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decrypt_failure_keeps_collecting() {
        let (mut decoder, _cipher, pool, metrics) = setup(2, 3);
        let other = FrameCipher::new(&FrameCipher::generate_key());
        let shares = make_shares(&other, 5, 1, 0, b"abc", 3, 2);

        assert!(decoder.insert(Share::parse(&pool, &shares[0]).unwrap()).is_none());
        assert!(decoder.insert(Share::parse(&pool, &shares[1]).unwrap()).is_none());
        assert!(decoder.insert(Share::parse(&pool, &shares[2]).unwrap()).is_none());

        let stats = metrics.snapshot();
        assert_eq!(stats.decrypt_failures, 2);
        assert_eq!(stats.groups_combined, 0);
        assert_eq!(decoder.len(), 1);
    }

    #[test]
    fn test_sweep_expires_incomplete_groups() {
        let (mut decoder, cipher, pool, metrics) = setup(2, 3);
        let incomplete = make_shares(&cipher, 5, 1, 0, b"abc", 3, 2);
        let complete = make_shares(&cipher, 5, 2, 0, b"def", 3, 2);

        decoder.insert(Share::parse(&pool, &incomplete[0]).unwrap());
        decoder.insert(Share::parse(&pool, &complete[0]).unwrap());
        decoder.insert(Share::parse(&pool, &complete[1]).unwrap()).unwrap();
        assert_eq!(decoder.len(), 2);

        // 첫 sweep: 복원된 그룹 제거, 미완성 그룹은 한 번 봐줌
        decoder.sweep();
        assert_eq!(decoder.len(), 1);
        decoder.sweep();
        assert!(decoder.is_empty());
        assert_eq!(metrics.snapshot().groups_expired, 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_group() {
        let (mut decoder, cipher, pool, metrics) = setup(2, 3);
        let groups: Vec<Vec<Vec<u8>>> = (10..15u64)
            .map(|seq| make_shares(&cipher, 5, seq, 0, &[seq as u8; 4], 3, 2))
            .collect();
        for shares in &groups {
            decoder.insert(Share::parse(&pool, &shares[0]).unwrap());
        }
        assert_eq!(decoder.len(), 4);
        assert_eq!(metrics.snapshot().groups_expired, 1);

        // 남아 있는 그룹은 정상 복원
        let frame = decoder.insert(Share::parse(&pool, &groups[4][1]).unwrap()).unwrap();
        assert_eq!(frame.payload(), &[14u8; 4]);
    }
}
