//! 재조립 리스트
//!
//! 스트림 하나의 복원된 프레임을 그룹 시퀀스 순으로 모아 원래 IP 패킷을 순서대로 내보낸다.
//!
//! - 워터마크: 아직 다 내보내지 못한 가장 오래된 그룹 시퀀스. 절대 줄어들지 않는다
//! - 워터마크보다 오래된 프레임은 도착 즉시 버림
//! - 프레임 경계를 넘는 패킷은 이어지는 프레임들이 모두 도착하면 합쳐서 내보냄
//! - 중간 프레임이 빠지면 멈춰서 기다리고, `sweep`이 오래 멈춘 것을 건너뛴다

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::frame::{ip_packet_len, Frame};
use crate::stats::IngressMetrics;

/// 재조립된 IP 패킷을 받는 쪽
pub trait PacketSink: Send + Sync {
    fn send(&self, packet: Bytes) -> io::Result<()>;
}

impl PacketSink for mpsc::Sender<Bytes> {
    fn send(&self, packet: Bytes) -> io::Result<()> {
        self.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "패킷 싱크 가득 참")
            }
            mpsc::error::TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "패킷 싱크 닫힘")
            }
        })
    }
}

impl PacketSink for mpsc::UnboundedSender<Bytes> {
    fn send(&self, packet: Bytes) -> io::Result<()> {
        mpsc::UnboundedSender::send(self, packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "패킷 싱크 닫힘"))
    }
}

/// 경계를 넘는 패킷을 다 모을 수 있는지 검사한 결과
enum Span {
    /// 다음 프레임이 아직 없음
    Waiting,

    /// `last`에서 `missing` 바이트를 더 읽으면 패킷 완성
    Complete { last: u64, missing: usize },

    /// `bad` 프레임이 이어붙이기 규칙을 어김
    FramingError { bad: u64 },
}

/// head 프레임 처리 결과
enum Step {
    /// 빠진 프레임을 기다림
    Stall,

    /// head 프레임을 다 씀
    Consumed,

    /// 패킷 시작이 없는 프레임이 head에 옴
    Orphan,

    /// head에서 시작한 패킷이 `last` 프레임의 `missing` 바이트에서 끝남
    Spanned { start: usize, last: u64, missing: usize },

    /// `bad` 이전 프레임들을 버려야 함
    FramingError { bad: u64 },
}

/// 스트림 하나의 재조립 리스트
pub struct ReassemblyList {
    capacity: usize,

    /// 그룹 시퀀스 → 프레임
    frames: BTreeMap<u64, Frame>,

    /// 첫 프레임이 도착하면 정해진다
    watermark: Option<u64>,

    /// head 프레임에서 이어서 처리할 페이로드 오프셋
    resume_at: Option<usize>,

    /// 마지막 sweep 때의 워터마크
    swept_watermark: Option<u64>,
    stalled_sweeps: u32,
    max_stall_sweeps: u32,

    /// 경계를 넘는 패킷 조립 버퍼
    buf: BytesMut,

    metrics: Arc<IngressMetrics>,
}

impl ReassemblyList {
    pub fn new(capacity: usize, max_stall_sweeps: u32, metrics: Arc<IngressMetrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: BTreeMap::new(),
            watermark: None,
            resume_at: None,
            swept_watermark: None,
            stalled_sweeps: 0,
            max_stall_sweeps,
            buf: BytesMut::new(),
            metrics,
        }
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// 이전에 쓰던 워터마크에서 다시 시작 (첫 프레임 도착 전에만)
    pub fn restore_watermark(&mut self, watermark: u64) {
        if self.watermark.is_none() && self.frames.is_empty() {
            self.watermark = Some(watermark);
            self.swept_watermark = Some(watermark);
        }
    }

    /// 보관 중인 프레임 수
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 프레임 하나 추가 후 내보낼 수 있는 패킷을 모두 싱크로 보낸다
    pub fn insert(&mut self, frame: Frame, sink: &dyn PacketSink) {
        let seq = frame.group_seq();
        match self.watermark {
            None => self.watermark = Some(seq),
            Some(w) if seq < w => {
                trace!("오래된 프레임 {} 버림 (워터마크 {})", seq, w);
                self.metrics.record_frame_too_old();
                frame.release();
                return;
            }
            Some(_) => {}
        }

        if self.frames.contains_key(&seq) {
            trace!("중복 프레임 {} 버림", seq);
            self.metrics.record_frame_duplicate();
            frame.release();
            return;
        }
        self.frames.insert(seq, frame);

        while self.frames.len() > self.capacity {
            let Some((evicted, frame)) = self.frames.pop_first() else {
                break;
            };
            frame.release();
            self.metrics.record_frames_evicted(1);
            self.watermark = self.frames.keys().next().copied().or(Some(evicted + 1));
            self.resume_at = None;
            debug!("재조립 리스트 가득 참, 프레임 {} 버림", evicted);
        }

        self.try_reassemble(sink);
    }

    /// 정리 주기마다 호출
    ///
    /// 프레임이 남아 있는데 워터마크가 `max_stall_sweeps`번 넘게 그대로면
    /// head를 버리고 다음으로 보관 중인 프레임으로 건너뛴다.
    pub fn sweep(&mut self, sink: &dyn PacketSink) {
        if self.frames.is_empty() || self.watermark != self.swept_watermark {
            self.swept_watermark = self.watermark;
            self.stalled_sweeps = 0;
            return;
        }

        self.stalled_sweeps += 1;
        if self.stalled_sweeps <= self.max_stall_sweeps {
            return;
        }

        let Some(w) = self.watermark else {
            return;
        };
        if let Some(head) = self.frames.remove(&w) {
            head.release();
            self.metrics.record_frames_evicted(1);
        }
        let next = self.frames.keys().next().copied().unwrap_or(w + 1);
        debug!("재조립 정체: 워터마크 {} → {}", w, next);
        self.advance_to(next);

        self.try_reassemble(sink);
        self.swept_watermark = self.watermark;
    }

    fn advance_to(&mut self, seq: u64) {
        self.watermark = Some(seq);
        self.resume_at = None;
        self.stalled_sweeps = 0;
    }

    /// `[watermark, bad)` 프레임을 버리고 `bad`부터 다시 시작
    fn evict_before(&mut self, bad: u64) {
        let keep = self.frames.split_off(&bad);
        let dropped = std::mem::replace(&mut self.frames, keep);
        self.metrics.record_frames_invalid(dropped.len());
        for (_, frame) in dropped {
            frame.release();
        }
        self.advance_to(bad);
    }

    fn try_reassemble(&mut self, sink: &dyn PacketSink) {
        loop {
            let Some(w) = self.watermark else {
                return;
            };

            match self.process_head(w, sink) {
                Step::Stall => return,
                Step::Consumed => {
                    if let Some(head) = self.frames.remove(&w) {
                        head.release();
                    }
                    self.advance_to(w + 1);
                }
                Step::Orphan => {
                    trace!("패킷 시작이 없는 프레임 {} 버림", w);
                    if let Some(head) = self.frames.remove(&w) {
                        head.release();
                    }
                    self.metrics.record_frames_invalid(1);
                    self.advance_to(w + 1);
                }
                Step::FramingError { bad } => {
                    warn!("프레이밍 오류: 프레임 {}..{} 버림", w, bad);
                    self.evict_before(bad);
                }
                Step::Spanned { start, last, missing } => {
                    self.collect_span(w, start, last, missing, sink);
                }
            }
        }
    }

    /// head 프레임의 완결된 패킷을 내보내고 다음 할 일을 정한다
    fn process_head(&mut self, w: u64, sink: &dyn PacketSink) -> Step {
        let Some(head) = self.frames.get(&w) else {
            return Step::Stall;
        };
        let Some(mut pos) = self.resume_at.or_else(|| head.index()) else {
            return Step::Orphan;
        };

        let payload = head.payload();
        while pos < payload.len() {
            let rest = &payload[pos..];
            let Some(pkt_len) = ip_packet_len(rest) else {
                debug!("프레임 {} 오프셋 {}에 잘못된 IP 헤더, 나머지 버림", w, pos);
                self.metrics.record_frames_invalid(1);
                return Step::Consumed;
            };

            if pkt_len > rest.len() {
                return match self.find_span(w, pkt_len - rest.len()) {
                    Span::Waiting => {
                        self.resume_at = Some(pos);
                        Step::Stall
                    }
                    Span::Complete { last, missing } => Step::Spanned {
                        start: pos,
                        last,
                        missing,
                    },
                    Span::FramingError { bad } => Step::FramingError { bad },
                };
            }

            deliver(sink, &self.metrics, Bytes::copy_from_slice(&rest[..pkt_len]));
            pos += pkt_len;
        }

        Step::Consumed
    }

    /// head 다음 프레임부터 `missing` 바이트를 채울 수 있는지 검사
    fn find_span(&self, head: u64, mut missing: usize) -> Span {
        let mut seq = head + 1;
        loop {
            let Some(frame) = self.frames.get(&seq) else {
                return Span::Waiting;
            };
            let len = frame.payload().len();

            if missing > len {
                // 중간 프레임은 전부 이어붙이는 데이터여야 함
                if frame.index().is_some() {
                    return Span::FramingError { bad: seq };
                }
                missing -= len;
                seq += 1;
                continue;
            }

            return match frame.index() {
                Some(index) if index == missing => Span::Complete { last: seq, missing },
                None if missing == len => Span::Complete { last: seq, missing },
                _ => Span::FramingError { bad: seq },
            };
        }
    }

    /// `[head, last]` 프레임에 걸친 패킷을 합쳐서 내보낸다
    fn collect_span(&mut self, head: u64, start: usize, last: u64, missing: usize, sink: &dyn PacketSink) {
        self.buf.clear();
        for (&seq, frame) in self.frames.range(head..=last) {
            let payload = frame.payload();
            let part = if seq == head {
                &payload[start..]
            } else if seq == last {
                &payload[..missing]
            } else {
                payload
            };
            self.buf.extend_from_slice(part);
        }
        let packet = self.buf.split().freeze();
        deliver(sink, &self.metrics, packet);

        let tail = self.frames.split_off(&last);
        let consumed = std::mem::replace(&mut self.frames, tail);
        for (_, frame) in consumed {
            frame.release();
        }

        let last_len = self.frames.get(&last).map(|f| f.payload().len()).unwrap_or(0);
        if missing >= last_len {
            if let Some(frame) = self.frames.remove(&last) {
                frame.release();
            }
            self.advance_to(last + 1);
        } else {
            self.advance_to(last);
            self.resume_at = Some(missing);
        }
    }
}

fn deliver(sink: &dyn PacketSink, metrics: &IngressMetrics, packet: Bytes) {
    let len = packet.len();
    match sink.send(packet) {
        Ok(()) => metrics.record_delivered(len),
        Err(e) => {
            metrics.record_delivery_error();
            debug!("패킷 전달 실패: {}", e);
        }
    }
}
