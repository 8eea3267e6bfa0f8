//! Shamir 비밀 분산 - GF(2^8)
//!
//! - 체: Rijndael 다항식 (x^8 + x^4 + x^3 + x + 1)
//! - 비밀의 각 바이트마다 차수 T-1의 무작위 다항식을 만들고 N개의 x 좌표에서 평가
//! - x 좌표는 share의 마지막 바이트에 한 번만 기록
//!
//! 체 연산(곱셈/역원/나눗셈)은 피연산자 값에 따라 분기하지 않는다.
//! 분기는 share 개수/길이 같은 구조 검사에서만 일어난다.

use rand::seq::SliceRandom;
use rand::RngCore;

/// share 하나가 비밀보다 길어지는 바이트 수 (x 좌표 태그)
pub const SHARE_OVERHEAD: usize = 1;

/// 최대 share 수 (0이 아닌 x 좌표 수)
pub const MAX_PARTS: usize = 255;

/// 비밀 분산 오류
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShamirError {
    #[error("parts({parts})가 threshold({threshold})보다 작음")]
    PartsBelowThreshold { parts: usize, threshold: usize },
    #[error("parts는 255를 넘을 수 없음: {0}")]
    TooManyParts(usize),
    #[error("threshold는 2 이상이어야 함: {0}")]
    ThresholdTooSmall(usize),
    #[error("빈 비밀은 분할할 수 없음")]
    EmptySecret,
    #[error("share가 2개 미만: {0}")]
    TooFewShares(usize),
    #[error("share는 2바이트 이상이어야 함")]
    ShareTooShort,
    #[error("share 길이 불일치: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("중복된 x 좌표: {0}")]
    DuplicateCoordinate(u8),
}

/// GF(2^8) 덧셈 (뺄셈과 동일)
#[inline]
fn gf_add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// GF(2^8) 곱셈
///
/// 8번 고정 반복, 조건은 전부 마스크로 처리.
#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    let mut a = a;
    let mut b = b;
    let mut product = 0u8;
    for _ in 0..8 {
        product ^= a & 0u8.wrapping_sub(b & 1);
        let carry = 0u8.wrapping_sub(a >> 7);
        a = (a << 1) ^ (0x1b & carry);
        b >>= 1;
    }
    product
}

/// GF(2^8) 역원: a^254
///
/// 0의 역원은 0으로 나온다. 호출하는 쪽에서 0이 들어오지 않도록 보장한다.
#[inline]
fn gf_inv(a: u8) -> u8 {
    let a2 = gf_mul(a, a);
    let a4 = gf_mul(a2, a2);
    let a8 = gf_mul(a4, a4);
    let a16 = gf_mul(a8, a8);
    let a32 = gf_mul(a16, a16);
    let a64 = gf_mul(a32, a32);
    let a128 = gf_mul(a64, a64);
    // 254 = 128 + 64 + 32 + 16 + 8 + 4 + 2
    let mut out = gf_mul(a128, a64);
    out = gf_mul(out, a32);
    out = gf_mul(out, a16);
    out = gf_mul(out, a8);
    out = gf_mul(out, a4);
    gf_mul(out, a2)
}

/// GF(2^8) 나눗셈
#[inline]
fn gf_div(a: u8, b: u8) -> u8 {
    gf_mul(a, gf_inv(b))
}

/// 절편이 고정된 무작위 다항식
struct Polynomial {
    coefficients: Vec<u8>,
}

impl Polynomial {
    fn new(degree: usize) -> Self {
        Self {
            coefficients: vec![0u8; degree + 1],
        }
    }

    /// 계수를 새로 뽑는다 (버퍼 재사용)
    fn randomize<R: RngCore>(&mut self, intercept: u8, rng: &mut R) {
        self.coefficients[0] = intercept;
        rng.fill_bytes(&mut self.coefficients[1..]);
    }

    /// 호너 방식 평가
    fn evaluate(&self, x: u8) -> u8 {
        let mut iter = self.coefficients.iter().rev();
        let mut out = iter.next().copied().unwrap_or(0);
        for &coeff in iter {
            out = gf_add(gf_mul(out, x), coeff);
        }
        out
    }
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        self.coefficients.iter_mut().for_each(|c| *c = 0);
    }
}

/// 비밀을 `parts`개의 share로 분할
///
/// 그 중 `threshold`개가 있으면 복원할 수 있다.
/// 각 share는 `{y1, y2, .., yN, x}` 형태로 비밀보다 1바이트 길다.
pub fn split(secret: &[u8], parts: usize, threshold: usize) -> Result<Vec<Vec<u8>>, ShamirError> {
    if parts < threshold {
        return Err(ShamirError::PartsBelowThreshold { parts, threshold });
    }
    if parts > MAX_PARTS {
        return Err(ShamirError::TooManyParts(parts));
    }
    if threshold < 2 {
        return Err(ShamirError::ThresholdTooSmall(threshold));
    }
    if secret.is_empty() {
        return Err(ShamirError::EmptySecret);
    }

    let mut rng = rand::thread_rng();

    // 0을 제외한 x 좌표를 섞어서 앞에서부터 사용
    let mut x_coordinates: Vec<u8> = (1..=255).collect();
    x_coordinates.shuffle(&mut rng);
    let x_coordinates = &x_coordinates[..parts];

    let mut out: Vec<Vec<u8>> = x_coordinates
        .iter()
        .map(|&x| {
            let mut share = vec![0u8; secret.len() + SHARE_OVERHEAD];
            share[secret.len()] = x;
            share
        })
        .collect();

    // 체 크기가 256이라 다항식 하나에 한 바이트만 실을 수 있다
    let mut polynomial = Polynomial::new(threshold - 1);
    for (idx, &value) in secret.iter().enumerate() {
        polynomial.randomize(value, &mut rng);
        for (share, &x) in out.iter_mut().zip(x_coordinates) {
            share[idx] = polynomial.evaluate(x);
        }
    }

    Ok(out)
}

/// share들로 비밀 복원
pub fn combine<S: AsRef<[u8]>>(shares: &[S]) -> Result<Vec<u8>, ShamirError> {
    let mut secret = Vec::new();
    combine_into(shares, &mut secret)?;
    Ok(secret)
}

/// share들로 비밀을 복원해서 `out` 뒤에 붙인다
///
/// 실패하면 `out`은 건드리지 않는다.
pub fn combine_into<S: AsRef<[u8]>>(shares: &[S], out: &mut Vec<u8>) -> Result<(), ShamirError> {
    if shares.len() < 2 {
        return Err(ShamirError::TooFewShares(shares.len()));
    }

    let share_len = shares[0].as_ref().len();
    if share_len < 2 {
        return Err(ShamirError::ShareTooShort);
    }
    for share in &shares[1..] {
        let got = share.as_ref().len();
        if got != share_len {
            return Err(ShamirError::LengthMismatch {
                expected: share_len,
                got,
            });
        }
    }

    // x 좌표 수집 및 중복 검사 (중복이 있으면 나눗셈 분모가 0이 됨)
    let mut seen = [false; 256];
    let mut x_samples = Vec::with_capacity(shares.len());
    for share in shares {
        let x = share.as_ref()[share_len - 1];
        if seen[x as usize] {
            return Err(ShamirError::DuplicateCoordinate(x));
        }
        seen[x as usize] = true;
        x_samples.push(x);
    }

    // x = 0에서의 라그랑주 기저는 바이트마다 같으므로 한 번만 계산
    let basis: Vec<u8> = (0..x_samples.len())
        .map(|i| {
            x_samples
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .fold(1u8, |acc, (_, &xj)| {
                    gf_mul(acc, gf_div(xj, gf_add(x_samples[i], xj)))
                })
        })
        .collect();

    let secret_len = share_len - SHARE_OVERHEAD;
    out.reserve(secret_len);
    for idx in 0..secret_len {
        let value = shares
            .iter()
            .zip(&basis)
            .fold(0u8, |acc, (share, &b)| gf_add(acc, gf_mul(share.as_ref()[idx], b)));
        out.push(value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_secret(len: usize) -> Vec<u8> {
        let mut secret = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    }

    #[test]
    fn test_field_arithmetic() {
        // AES 표준 예제: {57} * {83} = {c1}
        assert_eq!(gf_mul(0x57, 0x83), 0xc1);
        assert_eq!(gf_mul(0x57, 0x13), 0xfe);
        assert_eq!(gf_mul(0, 0x83), 0);
        assert_eq!(gf_mul(0x83, 0), 0);

        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a={a}");
            assert_eq!(gf_div(a, a), 1);
            assert_eq!(gf_div(0, a), 0);
        }
    }

    #[test]
    fn test_split_shape() {
        let secret = b"frame payload";
        let shares = split(secret, 5, 3).unwrap();

        assert_eq!(shares.len(), 5);
        let mut tags: Vec<u8> = shares.iter().map(|s| s[secret.len()]).collect();
        for share in &shares {
            assert_eq!(share.len(), secret.len() + SHARE_OVERHEAD);
        }
        assert!(tags.iter().all(|&x| x != 0));
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 5);
    }

    #[test]
    fn test_every_subset_reconstructs() {
        let (parts, threshold) = (5usize, 3usize);
        for len in [1usize, 16, 1400] {
            let secret = random_secret(len);
            let shares = split(&secret, parts, threshold).unwrap();

            for mask in 0u32..(1 << parts) {
                if (mask.count_ones() as usize) < threshold {
                    continue;
                }
                let subset: Vec<&[u8]> = (0..parts)
                    .filter(|i| mask & (1 << i) != 0)
                    .map(|i| shares[i].as_slice())
                    .collect();
                assert_eq!(combine(&subset).unwrap(), secret, "len={len} mask={mask:05b}");
            }
        }
    }

    #[test]
    fn test_two_of_three() {
        let secret = random_secret(64);
        let shares = split(&secret, 3, 2).unwrap();

        assert_eq!(combine(&[&shares[0], &shares[2]]).unwrap(), secret);
        assert_eq!(combine(&[&shares[2], &shares[1]]).unwrap(), secret);
    }

    #[test]
    fn test_below_threshold_does_not_reveal() {
        let secret = vec![0x42u8; 32];
        let shares = split(&secret, 5, 3).unwrap();

        // 2개로도 복원 "연산"은 되지만 비밀과는 무관한 값이 나와야 함
        let guess = combine(&[&shares[0], &shares[1]]).unwrap();
        assert_ne!(guess, secret);
    }

    #[test]
    fn test_split_rejects_bad_parameters() {
        assert_eq!(
            split(b"x", 2, 3),
            Err(ShamirError::PartsBelowThreshold { parts: 2, threshold: 3 })
        );
        assert_eq!(split(b"x", 256, 2), Err(ShamirError::TooManyParts(256)));
        assert_eq!(split(b"x", 3, 1), Err(ShamirError::ThresholdTooSmall(1)));
        assert_eq!(split(b"", 3, 2), Err(ShamirError::EmptySecret));
        assert!(split(b"x", 255, 255).is_ok());
    }

    #[test]
    fn test_combine_rejects_bad_shares() {
        let shares = split(b"secret", 3, 2).unwrap();

        assert_eq!(combine(&shares[..1]), Err(ShamirError::TooFewShares(1)));

        let short = vec![shares[0][..3].to_vec(), shares[1].clone()];
        assert!(matches!(
            combine(&short),
            Err(ShamirError::LengthMismatch { .. })
        ));

        let dup = vec![shares[1].clone(), shares[1].clone()];
        assert!(matches!(
            combine(&dup),
            Err(ShamirError::DuplicateCoordinate(_))
        ));

        let tiny: Vec<Vec<u8>> = vec![vec![1], vec![2]];
        assert_eq!(combine(&tiny), Err(ShamirError::ShareTooShort));
    }

    #[test]
    fn test_combine_into_leaves_output_on_error() {
        let shares = split(b"secret", 3, 2).unwrap();
        let mut out = b"header".to_vec();

        assert!(combine_into(&shares[..1], &mut out).is_err());
        assert_eq!(out, b"header");

        combine_into(&shares[1..], &mut out).unwrap();
        assert_eq!(out, b"headersecret");
    }
}
