//! 암호화 모듈 - ChaCha20-Poly1305 프레임 암호화
//!
//! 흐름:
//! 1. 외부에서 주입한 32바이트 사전 공유 키로 `FrameCipher` 생성
//! 2. 프레임마다 OS 난수로 새 nonce 생성
//! 3. 출력 형식: nonce(12) + ciphertext + tag(16)
//!
//! 인코더/디코더는 헤더 뒤쪽을 그 자리에서 암복호화하는 `seal_in_place`/`open_in_place`를 쓴다.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand_core::{OsRng, RngCore};

/// 키 크기 (32 bytes)
pub const KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 암호화로 늘어나는 바이트 수
pub const CIPHER_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// 암호화 오류
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("잘못된 키 크기: {0}")]
    InvalidKeySize(usize),
    #[error("암호화 실패")]
    EncryptionFailed,
    #[error("복호화 실패")]
    DecryptionFailed,
    #[error("데이터가 너무 짧음: {len} 바이트")]
    Truncated { len: usize },
}

/// 프레임 암호화기
#[derive(Clone)]
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl FrameCipher {
    /// 사전 공유 키로 암호화기 생성
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// 길이를 모르는 키 바이트로 생성
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize(key.len()))?;
        Ok(Self { cipher })
    }

    /// 무작위 키 생성
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn random_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// 암호화
    /// 반환: nonce(12) + ciphertext(원본 + 16바이트 태그)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = Self::random_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 복호화
    /// 입력: nonce(12) + ciphertext
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < CIPHER_OVERHEAD {
            return Err(CryptoError::Truncated { len: encrypted.len() });
        }

        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// `buf[offset..]`을 그 자리에서 암호화
    ///
    /// 결과: `buf[..offset]` + nonce + ciphertext + tag
    pub fn seal_in_place(&self, buf: &mut Vec<u8>, offset: usize) -> Result<(), CryptoError> {
        if buf.len() < offset {
            return Err(CryptoError::Truncated { len: buf.len() });
        }

        let nonce_bytes = Self::random_nonce();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buf[offset..])
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // nonce를 헤더 바로 뒤로
        buf.extend_from_slice(&nonce_bytes);
        buf[offset..].rotate_right(NONCE_SIZE);
        buf.extend_from_slice(&tag);
        Ok(())
    }

    /// `buf[offset..]`(nonce + ciphertext + tag)을 그 자리에서 복호화
    ///
    /// 실패하면 평문 일부도 남기지 않도록 `buf`를 `offset`까지 잘라낸다.
    pub fn open_in_place(&self, buf: &mut Vec<u8>, offset: usize) -> Result<(), CryptoError> {
        if buf.len() < offset + CIPHER_OVERHEAD {
            return Err(CryptoError::Truncated { len: buf.len().saturating_sub(offset) });
        }

        let tag_start = buf.len() - TAG_SIZE;
        let tag = Tag::clone_from_slice(&buf[tag_start..]);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(&buf[offset..offset + NONCE_SIZE]);

        let result = self.cipher.decrypt_in_place_detached(
            Nonce::from_slice(&nonce_bytes),
            b"",
            &mut buf[offset + NONCE_SIZE..tag_start],
            &tag,
        );
        if result.is_err() {
            buf.truncate(offset);
            return Err(CryptoError::DecryptionFailed);
        }

        buf.truncate(tag_start);
        buf.drain(offset..offset + NONCE_SIZE);
        Ok(())
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCipher { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let plaintext = b"Hello, SIG dataplane! This is encrypted data.";

        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_eq!(encrypted.len(), plaintext.len() + CIPHER_OVERHEAD);

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_nonce_is_fresh() {
        let cipher = FrameCipher::new(&[7u8; KEY_SIZE]);
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampering_fails_closed() {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let mut encrypted = cipher.encrypt(b"payload").unwrap();
        encrypted[NONCE_SIZE] ^= 0x01;

        assert_eq!(cipher.decrypt(&encrypted), Err(CryptoError::DecryptionFailed));
        assert_eq!(
            cipher.decrypt(&encrypted[..10]),
            Err(CryptoError::Truncated { len: 10 })
        );

        let other = FrameCipher::new(&FrameCipher::generate_key());
        let encrypted = cipher.encrypt(b"payload").unwrap();
        assert_eq!(other.decrypt(&encrypted), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_in_place_keeps_prefix() {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let mut buf = b"HEADER".to_vec();
        buf.extend_from_slice(b"frame payload bytes");

        cipher.seal_in_place(&mut buf, 6).unwrap();
        assert_eq!(&buf[..6], b"HEADER");
        assert_eq!(buf.len(), 6 + 19 + CIPHER_OVERHEAD);

        // 일반 decrypt와 호환
        assert_eq!(cipher.decrypt(&buf[6..]).unwrap(), b"frame payload bytes");

        cipher.open_in_place(&mut buf, 6).unwrap();
        assert_eq!(buf, b"HEADERframe payload bytes");
    }

    #[test]
    fn test_open_in_place_failure_leaves_no_plaintext() {
        let cipher = FrameCipher::new(&FrameCipher::generate_key());
        let mut buf = b"HDR".to_vec();
        buf.extend(cipher.encrypt(b"secret").unwrap());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        assert_eq!(cipher.open_in_place(&mut buf, 3), Err(CryptoError::DecryptionFailed));
        assert_eq!(buf, b"HDR");
    }

    #[test]
    fn test_invalid_key_size() {
        assert_eq!(
            FrameCipher::from_slice(&[0u8; 16]).unwrap_err(),
            CryptoError::InvalidKeySize(16)
        );
        assert!(FrameCipher::from_slice(&[0u8; 32]).is_ok());
    }
}
