//! SIGMP 루프백 데모
//!
//! 127.0.0.1 위에 N개 UDP 경로를 열고 세션 → 수신기로 합성 IPv4 패킷을 흘려 보낸다.
//! `--drop-path`로 경로 하나를 블랙홀로 만들어 (T, N) 손실 내성을 확인할 수 있다.
//!
//! 사용법:
//!   cargo run --release --bin sig-loopback -- [OPTIONS]
//!
//! 예시:
//!   # 2-of-3, 패킷 10000개
//!   cargo run --release --bin sig-loopback -- --packets 10000
//!
//!   # 3-of-5, 경로 4번 손실
//!   cargo run --release --bin sig-loopback -- -t 3 -n 5 --drop-path 4

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sigmp::ingress::bind_and_serve;
use sigmp::{Config, FrameCipher, Ingress, Path, Session, StaticPath, UdpTransport};

/// 데모 설정
struct LoopbackConfig {
    packets: usize,
    payload_size: usize,
    path_mtu: usize,
    drop_path: Option<usize>,
    config: Config,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            packets: 1000,
            payload_size: 1200,
            path_mtu: 1472,
            drop_path: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> LoopbackConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = LoopbackConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--threshold" | "-t" => {
                if i + 1 < args.len() {
                    config.config.threshold = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--parts" | "-n" => {
                if i + 1 < args.len() {
                    config.config.parts = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--packets" | "-p" => {
                if i + 1 < args.len() {
                    config.packets = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--size" => {
                if i + 1 < args.len() {
                    config.payload_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.path_mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--drop-path" => {
                if i + 1 < args.len() {
                    config.drop_path = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"SIGMP Loopback - 비밀 분산 멀티패스 데이터플레인 데모

사용법:
  cargo run --release --bin sig-loopback -- [OPTIONS]

옵션:
  -t, --threshold <T>    복원에 필요한 share 수 (기본: 2)
  -n, --parts <N>        경로 수 (기본: 3)
  -p, --packets <COUNT>  보낼 IP 패킷 수 (기본: 1000)
  --size <BYTES>         패킷 페이로드 크기 (기본: 1200)
  --mtu <BYTES>          경로 MTU (기본: 1472)
  --drop-path <INDEX>    이 경로로 보낸 share는 버려짐
  -h, --help             이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 순번을 페이로드에 새긴 IPv4 패킷
fn synthetic_packet(seq: u32, payload_size: usize) -> Bytes {
    let total = 20 + payload_size.max(4);
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
    pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
    pkt[20..24].copy_from_slice(&seq.to_be_bytes());
    Bytes::from(pkt)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let demo = parse_args();
    demo.config.validate()?;
    let parts = demo.config.parts;

    info!(
        "SIGMP Loopback starting: T={}, N={}, packets={}, size={}",
        demo.config.threshold, parts, demo.packets, demo.payload_size
    );

    let key = FrameCipher::generate_key();

    // === 수신 측 ===
    let (packet_tx, mut packet_rx) = mpsc::channel::<Bytes>(demo.packets.max(1));
    let ingress = Arc::new(Ingress::new(
        demo.config.clone(),
        FrameCipher::new(&key),
        Arc::new(packet_tx),
    )?);
    let (ingress_addr, serve_task) =
        bind_and_serve(ingress.clone(), SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    info!("Ingress bound to {}", ingress_addr);

    // 손실 경로용: 받기만 하고 읽지 않는 소켓
    let black_hole = UdpSocket::bind("127.0.0.1:0").await?;
    let black_hole_addr = black_hole.local_addr()?;

    // === 송신 측 ===
    let mut paths: Vec<Arc<dyn Path>> = Vec::with_capacity(parts);
    for i in 0..parts {
        let remote = if demo.drop_path == Some(i) {
            warn!("경로 {}는 손실 경로", i);
            black_hole_addr
        } else {
            ingress_addr
        };
        let transport = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)), remote).await?;
        let path = StaticPath::new(demo.path_mtu, vec![0u8; 16], Arc::new(transport))
            .with_fingerprint(format!("loopback-{i:02}"));
        paths.push(Arc::new(path));
    }

    let session = Session::new(1, demo.config.clone(), FrameCipher::new(&key), None)?;
    session.set_paths(&paths)?;
    info!("Session mtu: {:?}", session.mtu());

    let start = Instant::now();
    for seq in 0..demo.packets {
        session.write(synthetic_packet(seq as u32, demo.payload_size))?;
        if seq % 64 == 63 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // === 수신 확인 ===
    let mut received = 0usize;
    let mut in_order = true;
    let mut expected_seq = 0u32;
    while received < demo.packets {
        match tokio::time::timeout(Duration::from_secs(2), packet_rx.recv()).await {
            Ok(Some(pkt)) => {
                let seq = u32::from_be_bytes([pkt[20], pkt[21], pkt[22], pkt[23]]);
                if seq < expected_seq {
                    in_order = false;
                }
                expected_seq = seq + 1;
                received += 1;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("2초 동안 패킷 없음, 수신 종료");
                break;
            }
        }
    }
    let elapsed = start.elapsed();

    session.close();
    session.join().await;
    ingress.stop();
    serve_task.await??;

    info!(
        "Received {}/{} packets in {:.2}ms (in order: {})",
        received,
        demo.packets,
        elapsed.as_secs_f64() * 1000.0,
        in_order
    );
    info!("Session: {}", session.metrics().snapshot().summary());
    info!("Ingress: {}", ingress.metrics().snapshot().summary());

    Ok(())
}
