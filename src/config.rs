//! 데이터플레인 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// SIGMP 데이터플레인 설정
///
/// (T, N) 임계값과 큐/풀/재조립 한도를 담는다. 키는 외부에서 주입하므로 여기 없다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 복원에 필요한 share 수 (T)
    pub threshold: usize,

    /// 프레임당 생성하는 share 수 (N), 즉 동시에 쓰는 경로 수
    pub parts: usize,

    /// 인코더 입력 패킷 큐 크기
    pub packet_queue_capacity: usize,

    /// 경로별 송신 큐 크기 (share 단위)
    pub send_queue_capacity: usize,

    /// 버퍼 풀이 보관하는 최대 버퍼 수
    pub pool_capacity: usize,

    /// 풀 버퍼 하나의 크기 (바이트)
    ///
    /// share와 프레임이 이 안에 들어가도록 세션 MTU도 이 값으로 제한된다.
    pub buffer_size: usize,

    /// 스트림당 재조립 리스트에 보관할 최대 프레임 수
    pub reassembly_capacity: usize,

    /// 스트림당 디코더가 보관할 최대 share 그룹 수
    pub max_share_groups: usize,

    /// 백그라운드 정리 주기 (밀리초)
    pub sweep_interval_ms: u64,

    /// 미완성 그룹/정체된 워터마크를 몇 번의 정리 주기까지 봐줄지
    pub max_idle_sweeps: u32,

    /// N개 경로를 기다리는 최대 시간 (밀리초), 넘으면 WaitingForPaths 상태로 전환
    pub path_wait_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 2,
            parts: 3,
            packet_queue_capacity: 1024,
            send_queue_capacity: 1024,
            pool_capacity: 1024,
            buffer_size: 9216,
            reassembly_capacity: 64,
            max_share_groups: 1024,
            sweep_interval_ms: 3000,
            max_idle_sweeps: 1,
            path_wait_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 지정한 (T, N)으로 설정 생성
    pub fn with_threshold(threshold: usize, parts: usize) -> Self {
        Self {
            threshold,
            parts,
            ..Self::default()
        }
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            packet_queue_capacity: 256,
            send_queue_capacity: 256,
            pool_capacity: 256,
            buffer_size: 2048,
            reassembly_capacity: 16,
            max_share_groups: 256,
            ..Self::default()
        }
    }

    /// 경로 다양성이 높은 환경용 설정 (3-of-5)
    pub fn high_redundancy() -> Self {
        Self {
            threshold: 3,
            parts: 5,
            send_queue_capacity: 2048,
            pool_capacity: 4096,
            max_share_groups: 2048,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    ///
    /// 늦게 도착하는 share를 더 오래 기다린다.
    pub fn unstable_network() -> Self {
        Self {
            reassembly_capacity: 256,
            max_share_groups: 4096,
            sweep_interval_ms: 1000,
            max_idle_sweeps: 4,
            path_wait_timeout_ms: 15000,
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.threshold < 2 || self.threshold > self.parts || self.parts > 255 {
            return Err(Error::InvalidThreshold {
                threshold: self.threshold,
                parts: self.parts,
            });
        }
        let capacities = [
            ("packet_queue_capacity", self.packet_queue_capacity),
            ("send_queue_capacity", self.send_queue_capacity),
            ("pool_capacity", self.pool_capacity),
            ("reassembly_capacity", self.reassembly_capacity),
            ("max_share_groups", self.max_share_groups),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name}은(는) 0일 수 없음")));
            }
        }
        if self.buffer_size < crate::MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {}가 최소 MTU {}보다 작음",
                self.buffer_size,
                crate::MIN_MTU
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::InvalidConfig("sweep_interval_ms는 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 정리 주기
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// 경로 대기 시간
    pub fn path_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.path_wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            Config::default(),
            Config::low_spec(),
            Config::high_redundancy(),
            Config::unstable_network(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(matches!(
            Config::with_threshold(1, 3).validate(),
            Err(Error::InvalidThreshold { threshold: 1, parts: 3 })
        ));
        assert!(Config::with_threshold(4, 3).validate().is_err());
        assert!(Config::with_threshold(2, 256).validate().is_err());
        assert!(Config::with_threshold(255, 255).validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = Config {
            reassembly_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_buffers_are_datagram_sized() {
        for config in [
            Config::default(),
            Config::low_spec(),
            Config::high_redundancy(),
            Config::unstable_network(),
        ] {
            assert!(config.buffer_size >= 1500);
            assert!(config.buffer_size <= 9216);

            let pool = crate::BufferPool::new(1, config.buffer_size);
            assert!(pool.acquire().capacity() <= 9216);
        }
    }
}
