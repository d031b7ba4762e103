use crate::error::{Error, Result};
use cipher::{KeyIvInit, StreamCipher};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type BlowfishCtr = ctr::Ctr64BE<blowfish::Blowfish>;
type TwofishCtr = ctr::Ctr128BE<twofish::Twofish>;

/// Block cipher selection for KCP datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCipherKind {
    Aes256,
    Aes192,
    Aes128,
    Salsa20,
    Blowfish,
    Twofish,
    Tea,
    Xtea,
    None,
}

impl BlockCipherKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes" | "aes-256" => Some(Self::Aes256),
            "aes-192" => Some(Self::Aes192),
            "aes-128" => Some(Self::Aes128),
            "salsa20" => Some(Self::Salsa20),
            "blowfish" => Some(Self::Blowfish),
            "twofish" => Some(Self::Twofish),
            "tea" => Some(Self::Tea),
            "xtea" => Some(Self::Xtea),
            "none" | "" => Some(Self::None),
            _ => None,
        }
    }

    fn key_len(&self) -> usize {
        match self {
            Self::Aes256 | Self::Salsa20 | Self::Twofish => 32,
            Self::Aes192 => 24,
            Self::Aes128 | Self::Blowfish | Self::Tea | Self::Xtea => 16,
            Self::None => 0,
        }
    }

    fn iv_len(&self) -> usize {
        match self {
            Self::Aes256 | Self::Aes192 | Self::Aes128 | Self::Twofish => 16,
            Self::Salsa20 | Self::Blowfish | Self::Tea | Self::Xtea => 8,
            Self::None => 0,
        }
    }
}

/// Per-datagram encryption with a random IV prefix. Stream-cipher
/// symmetric: `open` is `seal` with the transmitted IV.
#[derive(Debug, Clone)]
pub struct DatagramCipher {
    kind: BlockCipherKind,
    key: Vec<u8>,
}

impl DatagramCipher {
    pub fn new(kind: BlockCipherKind, secret: &str) -> Result<Self> {
        if kind != BlockCipherKind::None {
            crate::config::validate_secret(secret)?;
        }
        Ok(Self {
            kind,
            key: derive_key(secret, kind.key_len()),
        })
    }

    pub fn from_config(block: &str, secret: &str) -> Result<Self> {
        let kind = BlockCipherKind::parse(block)
            .ok_or_else(|| Error::config(format!("unknown block cipher '{}'", block)))?;
        Self::new(kind, secret)
    }

    pub fn is_plaintext(&self) -> bool {
        self.kind == BlockCipherKind::None
    }

    pub fn overhead(&self) -> usize {
        self.kind.iv_len()
    }

    pub fn seal(&self, data: &[u8]) -> Vec<u8> {
        if self.kind == BlockCipherKind::None {
            return data.to_vec();
        }
        let iv_len = self.kind.iv_len();
        let mut out = vec![0u8; iv_len + data.len()];
        rand::thread_rng().fill_bytes(&mut out[..iv_len]);
        out[iv_len..].copy_from_slice(data);
        let (iv, body) = out.split_at_mut(iv_len);
        self.apply(iv, body);
        out
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.kind == BlockCipherKind::None {
            return Ok(data.to_vec());
        }
        let iv_len = self.kind.iv_len();
        if data.len() < iv_len {
            return Err(Error::protocol("datagram shorter than cipher IV"));
        }
        let (iv, body) = data.split_at(iv_len);
        let mut out = body.to_vec();
        self.apply(iv, &mut out);
        Ok(out)
    }

    fn apply(&self, iv: &[u8], data: &mut [u8]) {
        match self.kind {
            BlockCipherKind::Aes256 => {
                let mut c = Aes256Ctr::new_from_slices(&self.key, iv).expect("aes-256 key/iv");
                c.apply_keystream(data);
            }
            BlockCipherKind::Aes192 => {
                let mut c = Aes192Ctr::new_from_slices(&self.key, iv).expect("aes-192 key/iv");
                c.apply_keystream(data);
            }
            BlockCipherKind::Aes128 => {
                let mut c = Aes128Ctr::new_from_slices(&self.key, iv).expect("aes-128 key/iv");
                c.apply_keystream(data);
            }
            BlockCipherKind::Salsa20 => {
                let mut c = salsa20::Salsa20::new_from_slices(&self.key, iv).expect("salsa20 key/iv");
                c.apply_keystream(data);
            }
            BlockCipherKind::Blowfish => {
                let mut c = BlowfishCtr::new_from_slices(&self.key, iv).expect("blowfish key/iv");
                c.apply_keystream(data);
            }
            BlockCipherKind::Twofish => {
                let mut c = TwofishCtr::new_from_slices(&self.key, iv).expect("twofish key/iv");
                c.apply_keystream(data);
            }
            BlockCipherKind::Tea => tiny_ctr(iv, data, |block| tea_encrypt(&self.key, block)),
            BlockCipherKind::Xtea => tiny_ctr(iv, data, |block| xtea_encrypt(&self.key, block)),
            BlockCipherKind::None => {}
        }
    }
}

fn derive_key(secret: &str, len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len.max(1)];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), b"paqet-kcp", 4096, &mut key);
    key.truncate(len);
    key
}

/// CTR mode over a 64-bit block primitive: keystream block i is
/// E(iv XOR counter_i).
fn tiny_ctr(iv: &[u8], data: &mut [u8], encrypt: impl Fn([u8; 8]) -> [u8; 8]) {
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(iv);
    let base = u64::from_be_bytes(nonce);
    for (i, chunk) in data.chunks_mut(8).enumerate() {
        let counter = base.wrapping_add(i as u64);
        let keystream = encrypt(counter.to_be_bytes());
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
    }
}

const TEA_DELTA: u32 = 0x9E37_79B9;

fn tea_encrypt(key: &[u8], block: [u8; 8]) -> [u8; 8] {
    let k = key_words(key);
    let mut v0 = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let mut v1 = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum: u32 = 0;
    for _ in 0..32 {
        sum = sum.wrapping_add(TEA_DELTA);
        v0 = v0.wrapping_add(
            (v1 << 4).wrapping_add(k[0]) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(k[1]),
        );
        v1 = v1.wrapping_add(
            (v0 << 4).wrapping_add(k[2]) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(k[3]),
        );
    }
    out_words(v0, v1)
}

fn xtea_encrypt(key: &[u8], block: [u8; 8]) -> [u8; 8] {
    let k = key_words(key);
    let mut v0 = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let mut v1 = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let mut sum: u32 = 0;
    for _ in 0..32 {
        v0 = v0.wrapping_add(
            ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1) ^ sum.wrapping_add(k[(sum & 3) as usize]),
        );
        sum = sum.wrapping_add(TEA_DELTA);
        v1 = v1.wrapping_add(
            ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                ^ sum.wrapping_add(k[((sum >> 11) & 3) as usize]),
        );
    }
    out_words(v0, v1)
}

fn key_words(key: &[u8]) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, word) in k.iter_mut().enumerate() {
        *word = u32::from_be_bytes([
            key[i * 4],
            key[i * 4 + 1],
            key[i * 4 + 2],
            key[i * 4 + 3],
        ]);
    }
    k
}

fn out_words(v0: u32, v1: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&v0.to_be_bytes());
    out[4..].copy_from_slice(&v1.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_kinds() {
        assert_eq!(BlockCipherKind::parse("aes"), Some(BlockCipherKind::Aes256));
        assert_eq!(BlockCipherKind::parse("aes-128"), Some(BlockCipherKind::Aes128));
        assert_eq!(BlockCipherKind::parse("aes-192"), Some(BlockCipherKind::Aes192));
        assert_eq!(BlockCipherKind::parse("salsa20"), Some(BlockCipherKind::Salsa20));
        assert_eq!(BlockCipherKind::parse("blowfish"), Some(BlockCipherKind::Blowfish));
        assert_eq!(BlockCipherKind::parse("twofish"), Some(BlockCipherKind::Twofish));
        assert_eq!(BlockCipherKind::parse("tea"), Some(BlockCipherKind::Tea));
        assert_eq!(BlockCipherKind::parse("xtea"), Some(BlockCipherKind::Xtea));
        assert_eq!(BlockCipherKind::parse("none"), Some(BlockCipherKind::None));
        assert_eq!(BlockCipherKind::parse("rot13"), None);
    }

    #[test]
    fn test_all_ciphers_round_trip() {
        let kinds = [
            BlockCipherKind::Aes256,
            BlockCipherKind::Aes192,
            BlockCipherKind::Aes128,
            BlockCipherKind::Salsa20,
            BlockCipherKind::Blowfish,
            BlockCipherKind::Twofish,
            BlockCipherKind::Tea,
            BlockCipherKind::Xtea,
        ];
        let payload = b"kcp segment bytes, arbitrary length 12345";
        for kind in kinds {
            let c = DatagramCipher::new(kind, SECRET).unwrap();
            let sealed = c.seal(payload);
            assert_eq!(sealed.len(), payload.len() + c.overhead());
            assert_ne!(&sealed[c.overhead()..], payload.as_slice());
            assert_eq!(c.open(&sealed).unwrap(), payload, "{:?}", kind);
        }
    }

    #[test]
    fn test_none_round_trip() {
        let c = DatagramCipher::new(BlockCipherKind::None, "").unwrap();
        let sealed = c.seal(b"plain");
        assert_eq!(sealed, b"plain");
        assert_eq!(c.open(&sealed).unwrap(), b"plain");
    }

    #[test]
    fn test_ivs_differ_between_seals() {
        let c = DatagramCipher::new(BlockCipherKind::Aes256, SECRET).unwrap();
        let a = c.seal(b"same payload");
        let b = c.seal(b"same payload");
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_rejects_short_input() {
        let c = DatagramCipher::new(BlockCipherKind::Aes256, SECRET).unwrap();
        assert!(c.open(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_bad_secret_rejected() {
        assert!(DatagramCipher::new(BlockCipherKind::Aes256, "short").is_err());
        assert!(DatagramCipher::from_config("rot13", SECRET).is_err());
    }

    #[test]
    fn test_wrong_key_garbles() {
        let c1 = DatagramCipher::new(BlockCipherKind::Aes256, SECRET).unwrap();
        let other = "f".repeat(64);
        let c2 = DatagramCipher::new(BlockCipherKind::Aes256, &other).unwrap();
        let sealed = c1.seal(b"secret datagram");
        assert_ne!(c2.open(&sealed).unwrap(), b"secret datagram");
    }
}
