//! 전송/수신 통계
//!
//! 카운터는 전부 `AtomicU64`이고 여러 태스크가 락 없이 올린다.
//! `snapshot()`으로 직렬화 가능한 사본을 얻는다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// 송신측(세션) 카운터
#[derive(Debug)]
pub struct SessionMetrics {
    start_time: Instant,

    /// 세션에 들어온 IP 패킷
    pub ip_pkts_sent: AtomicU64,
    pub ip_pkt_bytes_sent: AtomicU64,

    /// 입력 큐가 가득 차서 버린 IP 패킷
    pub ip_pkts_dropped: AtomicU64,

    /// 인코더가 버린 잘못된 IP 패킷
    pub invalid_packets: AtomicU64,

    /// 만든 프레임
    pub frames_built: AtomicU64,

    /// 경로로 나간 share
    pub frames_sent: AtomicU64,
    pub frame_bytes_sent: AtomicU64,

    /// 트랜스포트 쓰기 실패
    pub send_errors: AtomicU64,

    /// 송신 큐가 가득 차서 버린 share
    pub share_queue_drops: AtomicU64,

    /// 분할/암호화 실패로 버린 프레임
    pub split_errors: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ip_pkts_sent: AtomicU64::new(0),
            ip_pkt_bytes_sent: AtomicU64::new(0),
            ip_pkts_dropped: AtomicU64::new(0),
            invalid_packets: AtomicU64::new(0),
            frames_built: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frame_bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            share_queue_drops: AtomicU64::new(0),
            split_errors: AtomicU64::new(0),
        }
    }

    pub fn record_packet(&self, len: usize) {
        bump(&self.ip_pkts_sent);
        add(&self.ip_pkt_bytes_sent, len);
    }

    pub fn record_packet_dropped(&self) {
        bump(&self.ip_pkts_dropped);
    }

    pub fn record_invalid_packet(&self) {
        bump(&self.invalid_packets);
    }

    pub fn record_frame_built(&self) {
        bump(&self.frames_built);
    }

    pub fn record_share_sent(&self, len: usize) {
        bump(&self.frames_sent);
        add(&self.frame_bytes_sent, len);
    }

    pub fn record_send_error(&self) {
        bump(&self.send_errors);
    }

    pub fn record_queue_drop(&self) {
        bump(&self.share_queue_drops);
    }

    pub fn record_split_error(&self) {
        bump(&self.split_errors);
    }

    /// 현재 값 사본
    pub fn snapshot(&self) -> SessionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            ip_pkts_sent: load(&self.ip_pkts_sent),
            ip_pkt_bytes_sent: load(&self.ip_pkt_bytes_sent),
            ip_pkts_dropped: load(&self.ip_pkts_dropped),
            invalid_packets: load(&self.invalid_packets),
            frames_built: load(&self.frames_built),
            frames_sent: load(&self.frames_sent),
            frame_bytes_sent: load(&self.frame_bytes_sent),
            send_errors: load(&self.send_errors),
            share_queue_drops: load(&self.share_queue_drops),
            split_errors: load(&self.split_errors),
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 세션 통계 사본
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub elapsed_secs: f64,
    pub ip_pkts_sent: u64,
    pub ip_pkt_bytes_sent: u64,
    pub ip_pkts_dropped: u64,
    pub invalid_packets: u64,
    pub frames_built: u64,
    pub frames_sent: u64,
    pub frame_bytes_sent: u64,
    pub send_errors: u64,
    pub share_queue_drops: u64,
    pub split_errors: u64,
}

impl SessionStats {
    /// 전송 처리율 (bytes/sec, share 기준)
    pub fn throughput(&self) -> f64 {
        if self.elapsed_secs == 0.0 {
            return 0.0;
        }
        self.frame_bytes_sent as f64 / self.elapsed_secs
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Packets: {} ({} B) | Dropped: {} | Invalid: {} | Frames: {} | Shares: {} ({} B) | Throughput: {:.2} MB/s | Send errors: {} | Queue drops: {}",
            self.elapsed_secs,
            self.ip_pkts_sent,
            self.ip_pkt_bytes_sent,
            self.ip_pkts_dropped,
            self.invalid_packets,
            self.frames_built,
            self.frames_sent,
            self.frame_bytes_sent,
            self.throughput() / 1_000_000.0,
            self.send_errors,
            self.share_queue_drops,
        )
    }
}

/// 수신측 카운터
#[derive(Debug)]
pub struct IngressMetrics {
    start_time: Instant,

    /// 받은 share
    pub shares_received: AtomicU64,

    /// 파싱 실패/범위 밖 경로 인덱스
    pub invalid_shares: AtomicU64,

    /// 같은 경로 인덱스로 두 번 온 share
    pub duplicate_shares: AtomicU64,

    /// 이미 복원된 그룹에 늦게 온 share
    pub stale_shares: AtomicU64,

    pub groups_combined: AtomicU64,
    pub combine_failures: AtomicU64,
    pub decrypt_failures: AtomicU64,

    /// 미완성으로 버린 그룹
    pub groups_expired: AtomicU64,

    /// 워터마크보다 오래된 프레임
    pub frames_too_old: AtomicU64,
    pub frames_duplicate: AtomicU64,

    /// 용량 초과/정체로 버린 프레임
    pub frames_evicted: AtomicU64,

    /// 프레이밍 오류로 버린 프레임
    pub frames_invalid: AtomicU64,

    pub packets_delivered: AtomicU64,
    pub packet_bytes_delivered: AtomicU64,

    /// 싱크 전달 실패
    pub delivery_errors: AtomicU64,
}

impl IngressMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            shares_received: AtomicU64::new(0),
            invalid_shares: AtomicU64::new(0),
            duplicate_shares: AtomicU64::new(0),
            stale_shares: AtomicU64::new(0),
            groups_combined: AtomicU64::new(0),
            combine_failures: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            groups_expired: AtomicU64::new(0),
            frames_too_old: AtomicU64::new(0),
            frames_duplicate: AtomicU64::new(0),
            frames_evicted: AtomicU64::new(0),
            frames_invalid: AtomicU64::new(0),
            packets_delivered: AtomicU64::new(0),
            packet_bytes_delivered: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
        }
    }

    pub fn record_share(&self) {
        bump(&self.shares_received);
    }

    pub fn record_invalid_share(&self) {
        bump(&self.invalid_shares);
    }

    pub fn record_duplicate_share(&self) {
        bump(&self.duplicate_shares);
    }

    pub fn record_stale_share(&self) {
        bump(&self.stale_shares);
    }

    pub fn record_combined(&self) {
        bump(&self.groups_combined);
    }

    pub fn record_combine_failure(&self) {
        bump(&self.combine_failures);
    }

    pub fn record_decrypt_failure(&self) {
        bump(&self.decrypt_failures);
    }

    pub fn record_group_expired(&self) {
        bump(&self.groups_expired);
    }

    pub fn record_frame_too_old(&self) {
        bump(&self.frames_too_old);
    }

    pub fn record_frame_duplicate(&self) {
        bump(&self.frames_duplicate);
    }

    pub fn record_frames_evicted(&self, n: usize) {
        add(&self.frames_evicted, n);
    }

    pub fn record_frames_invalid(&self, n: usize) {
        add(&self.frames_invalid, n);
    }

    pub fn record_delivered(&self, len: usize) {
        bump(&self.packets_delivered);
        add(&self.packet_bytes_delivered, len);
    }

    pub fn record_delivery_error(&self) {
        bump(&self.delivery_errors);
    }

    /// 현재 값 사본
    pub fn snapshot(&self) -> IngressStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngressStats {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            shares_received: load(&self.shares_received),
            invalid_shares: load(&self.invalid_shares),
            duplicate_shares: load(&self.duplicate_shares),
            stale_shares: load(&self.stale_shares),
            groups_combined: load(&self.groups_combined),
            combine_failures: load(&self.combine_failures),
            decrypt_failures: load(&self.decrypt_failures),
            groups_expired: load(&self.groups_expired),
            frames_too_old: load(&self.frames_too_old),
            frames_duplicate: load(&self.frames_duplicate),
            frames_evicted: load(&self.frames_evicted),
            frames_invalid: load(&self.frames_invalid),
            packets_delivered: load(&self.packets_delivered),
            packet_bytes_delivered: load(&self.packet_bytes_delivered),
            delivery_errors: load(&self.delivery_errors),
        }
    }
}

impl Default for IngressMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 수신 통계 사본
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressStats {
    pub elapsed_secs: f64,
    pub shares_received: u64,
    pub invalid_shares: u64,
    pub duplicate_shares: u64,
    pub stale_shares: u64,
    pub groups_combined: u64,
    pub combine_failures: u64,
    pub decrypt_failures: u64,
    pub groups_expired: u64,
    pub frames_too_old: u64,
    pub frames_duplicate: u64,
    pub frames_evicted: u64,
    pub frames_invalid: u64,
    pub packets_delivered: u64,
    pub packet_bytes_delivered: u64,
    pub delivery_errors: u64,
}

impl IngressStats {
    /// 버려진 프레임 합계
    pub fn frames_dropped(&self) -> u64 {
        self.frames_too_old + self.frames_duplicate + self.frames_evicted + self.frames_invalid
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Shares: {} (invalid {}, dup {}, stale {}) | Groups: {} combined, {} expired | Failures: combine {}, decrypt {} | Frames dropped: {} | Packets: {} ({} B)",
            self.elapsed_secs,
            self.shares_received,
            self.invalid_shares,
            self.duplicate_shares,
            self.stale_shares,
            self.groups_combined,
            self.groups_expired,
            self.combine_failures,
            self.decrypt_failures,
            self.frames_dropped(),
            self.packets_delivered,
            self.packet_bytes_delivered,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_snapshot() {
        let metrics = SessionMetrics::new();
        metrics.record_packet(100);
        metrics.record_packet(50);
        metrics.record_share_sent(200);
        metrics.record_queue_drop();

        let stats = metrics.snapshot();
        assert_eq!(stats.ip_pkts_sent, 2);
        assert_eq!(stats.ip_pkt_bytes_sent, 150);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.share_queue_drops, 1);
        assert!(stats.summary().contains("Packets: 2"));
    }

    #[test]
    fn test_ingress_snapshot() {
        let metrics = IngressMetrics::new();
        metrics.record_frames_evicted(3);
        metrics.record_frames_invalid(2);
        metrics.record_frame_too_old();
        metrics.record_delivered(40);

        let stats = metrics.snapshot();
        assert_eq!(stats.frames_dropped(), 6);
        assert_eq!(stats.packets_delivered, 1);
        assert_eq!(stats.packet_bytes_delivered, 40);
    }
}
