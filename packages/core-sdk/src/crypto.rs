use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const IV_LEN: usize = 12;

/**
 * \brief AI 密钥静态加密器。
 * \details 以服务端密钥的 SHA-256 摘要直接作为 AES-256-GCM 密钥；
 * 密文格式为 `base64(iv).base64(ciphertext||tag)`。
 */
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(..)")
    }
}

impl SecretCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /**
     * \brief 使用新生成的 12 字节随机 IV 加密明文。
     */
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| anyhow!("encryption failed: {}", e))?;
        Ok(format!("{}.{}", STANDARD.encode(iv), STANDARD.encode(ciphertext)))
    }

    /**
     * \brief 解密 `iv.ciphertext` 字符串；格式错误、密钥不符或内容被篡改时返回错误。
     */
    pub fn decrypt(&self, payload: &str) -> Result<String> {
        let (iv_part, data_part) = payload
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow!("malformed payload: missing separator"))?;
        let iv = STANDARD.decode(iv_part)?;
        if iv.len() != IV_LEN {
            bail!("malformed payload: iv is {} bytes", iv.len());
        }
        let data = STANDARD.decode(data_part)?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let plain = cipher
            .decrypt(GenericArray::from_slice(&iv), data.as_slice())
            .map_err(|_| anyhow!("decryption failed"))?;
        Ok(String::from_utf8(plain)?)
    }
}

/**
 * \brief 生成密钥预览：前 4 位 + … + 后 4 位；过短的密钥只显示掩码。
 */
pub fn key_preview(plaintext: &str) -> String {
    let chars: Vec<char> = plaintext.chars().collect();
    if chars.len() <= 8 {
        return "••••".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}
