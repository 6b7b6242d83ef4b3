/// 按隧道加密负载
///
/// 使用隧道 token 作为 AES-GCM 密钥（16/24/32 字节分别对应 AES-128/192/256），
/// 每次加密生成新的 12 字节随机 nonce，输出格式为 `nonce || ciphertext || tag`。
use crate::error::{Result, TunnelError};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::RngCore;

/// nonce 长度
pub const NONCE_SIZE: usize = 12;

/// 认证标签长度
pub const TAG_SIZE: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// 根据密钥长度选择的 AEAD 实例
enum TunnelCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl TunnelCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| TunnelError::InvalidKeySize(key.len());
        match key.len() {
            16 => Ok(Self::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?)),
            24 => Ok(Self::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?)),
            32 => Ok(Self::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?)),
            other => Err(TunnelError::InvalidKeySize(other)),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let sealed = match self {
            Self::Aes128(cipher) => cipher.encrypt(nonce, plaintext),
            Self::Aes192(cipher) => cipher.encrypt(nonce, plaintext),
            Self::Aes256(cipher) => cipher.encrypt(nonce, plaintext),
        };
        sealed.map_err(|_| TunnelError::Other(anyhow::anyhow!("AES-GCM encryption failed")))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let opened = match self {
            Self::Aes128(cipher) => cipher.decrypt(nonce, ciphertext),
            Self::Aes192(cipher) => cipher.decrypt(nonce, ciphertext),
            Self::Aes256(cipher) => cipher.decrypt(nonce, ciphertext),
        };
        opened.map_err(|_| TunnelError::Auth)
    }
}

/// 检查密钥长度是否可用
pub fn validate_key(key: &[u8]) -> Result<()> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(TunnelError::InvalidKeySize(other)),
    }
}

/// 加密负载
pub fn encrypt(payload: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = TunnelCipher::new(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let sealed = cipher.seal(&nonce, payload)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// 解密负载，标签校验失败时返回 `Auth`，不会返回部分明文
pub fn decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = TunnelCipher::new(key)?;

    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(TunnelError::Auth);
    }

    let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
    cipher.open(nonce, sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&[u8]; 3] = [
        b"0123456789abcdef",
        b"0123456789abcdef01234567",
        b"0123456789abcdef0123456789abcdef",
    ];

    #[test]
    fn test_round_trip_all_key_sizes() {
        let payloads: [&[u8]; 3] = [b"", b"hello", &[0xffu8; 4096]];
        for key in KEYS {
            for payload in payloads {
                let sealed = encrypt(payload, key).unwrap();
                assert_eq!(sealed.len(), NONCE_SIZE + payload.len() + TAG_SIZE);
                assert_eq!(decrypt(&sealed, key).unwrap(), payload);
            }
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let a = encrypt(b"same", KEYS[0]).unwrap();
        let b = encrypt(b"same", KEYS[0]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_key_size() {
        for len in [0usize, 1, 15, 17, 23, 31, 33, 64] {
            let key = vec![7u8; len];
            assert!(matches!(encrypt(b"x", &key), Err(TunnelError::InvalidKeySize(n)) if n == len));
            assert!(matches!(decrypt(&[0u8; 64], &key), Err(TunnelError::InvalidKeySize(n)) if n == len));
        }
    }

    #[test]
    fn test_tampering_fails_closed() {
        let key = KEYS[2];
        let sealed = encrypt(b"GET / HTTP/1.1\r\n\r\n", key).unwrap();
        for i in 0..sealed.len() {
            let mut altered = sealed.clone();
            altered[i] ^= 0x01;
            assert!(decrypt(&altered, key).unwrap_err().is_auth());
        }
    }

    #[test]
    fn test_wrong_key_and_short_input() {
        let sealed = encrypt(b"secret", KEYS[0]).unwrap();
        assert!(decrypt(&sealed, b"fedcba9876543210").unwrap_err().is_auth());
        assert!(decrypt(&sealed[..NONCE_SIZE + 3], KEYS[0]).unwrap_err().is_auth());
    }
}
