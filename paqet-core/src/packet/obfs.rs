use crate::config::{ObfsConfig, ObfsMode, PaddingConfig};
use crate::error::{Error, Result};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const TLS_RECORD_TYPE_APPLICATION_DATA: u8 = 0x17;
const TLS_VERSION: u16 = 0x0303;
const TLS_RECORD_HEADER_SIZE: usize = 5;
const TLS_MAX_RECORD_SIZE: usize = 16384;

/// Wraps and unwraps tunnel datagrams with an obfuscation layer so their
/// lengths and leading bytes do not fingerprint the embedded transport.
#[derive(Debug, Clone)]
pub enum Obfuscator {
    None,
    Padding { key: [u8; 2], cfg: PaddingConfig },
    TlsRecord { key: [u8; 2] },
}

impl Obfuscator {
    pub fn from_config(cfg: &ObfsConfig, secret: &str) -> Result<Self> {
        match cfg.mode {
            ObfsMode::None => Ok(Self::None),
            ObfsMode::Padding => Ok(Self::Padding {
                key: derive_obfs_key(secret),
                cfg: cfg.padding.clone(),
            }),
            ObfsMode::Tls => Ok(Self::TlsRecord {
                key: derive_obfs_key(secret),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Padding { .. } => "padding",
            Self::TlsRecord { .. } => "tls",
        }
    }

    /// Maximum bytes added by `wrap`.
    pub fn overhead(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Padding { cfg, .. } => 2 + cfg.max_pad,
            Self::TlsRecord { .. } => TLS_RECORD_HEADER_SIZE + 2 + 15,
        }
    }

    pub fn wrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Padding { key, cfg } => wrap_padding(data, *key, cfg),
            Self::TlsRecord { key } => wrap_tls(data, *key),
        }
    }

    pub fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Padding { key, .. } => unwrap_padding(data, *key),
            Self::TlsRecord { key } => unwrap_tls(data, *key),
        }
    }
}

/// First two bytes of PBKDF2-HMAC-SHA256(secret, "paqet-obfs") mask the
/// length fields.
fn derive_obfs_key(secret: &str) -> [u8; 2] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), b"paqet-obfs", 100_000, &mut out);
    [out[0], out[1]]
}

fn wrap_padding(data: &[u8], key: [u8; 2], cfg: &PaddingConfig) -> Result<Vec<u8>> {
    if data.len() > u16::MAX as usize {
        return Err(Error::protocol("datagram too large for padding obfuscation"));
    }
    let mut rng = rand::thread_rng();
    let pad_len = if cfg.max_pad > cfg.min_pad {
        cfg.min_pad + (rng.next_u32() as usize) % (cfg.max_pad - cfg.min_pad + 1)
    } else {
        cfg.min_pad
    };

    let mut out = vec![0u8; 2 + data.len() + pad_len];
    let len = data.len() as u16;
    out[0] = (len >> 8) as u8 ^ key[0];
    out[1] = len as u8 ^ key[1];
    out[2..2 + data.len()].copy_from_slice(data);
    rng.fill_bytes(&mut out[2 + data.len()..]);
    Ok(out)
}

fn unwrap_padding(data: &[u8], key: [u8; 2]) -> Result<Vec<u8>> {
    if data.len() < 2 {
        return Err(Error::protocol("obfuscated datagram too short"));
    }
    let len = (((data[0] ^ key[0]) as usize) << 8) | (data[1] ^ key[1]) as usize;
    if 2 + len > data.len() {
        return Err(Error::protocol("invalid obfuscated length"));
    }
    Ok(data[2..2 + len].to_vec())
}

fn wrap_tls(data: &[u8], key: [u8; 2]) -> Result<Vec<u8>> {
    if data.len() + 2 > TLS_MAX_RECORD_SIZE {
        return Err(Error::protocol("datagram too large for a TLS record"));
    }
    let mut rng = rand::thread_rng();
    let mut pad_len = (rng.next_u32() as usize) % 16;
    if data.len() + 2 + pad_len > TLS_MAX_RECORD_SIZE {
        pad_len = TLS_MAX_RECORD_SIZE - data.len() - 2;
    }

    let record_len = 2 + data.len() + pad_len;
    let mut out = vec![0u8; TLS_RECORD_HEADER_SIZE + record_len];
    out[0] = TLS_RECORD_TYPE_APPLICATION_DATA;
    out[1..3].copy_from_slice(&TLS_VERSION.to_be_bytes());
    out[3..5].copy_from_slice(&(record_len as u16).to_be_bytes());

    let masked = (data.len() as u16) ^ u16::from_be_bytes(key);
    out[5..7].copy_from_slice(&masked.to_be_bytes());
    out[7..7 + data.len()].copy_from_slice(data);
    rng.fill_bytes(&mut out[7 + data.len()..]);
    Ok(out)
}

fn unwrap_tls(data: &[u8], key: [u8; 2]) -> Result<Vec<u8>> {
    if data.len() < TLS_RECORD_HEADER_SIZE + 2 {
        return Err(Error::protocol("TLS record too short"));
    }
    if data[0] != TLS_RECORD_TYPE_APPLICATION_DATA {
        return Err(Error::protocol("not a TLS application data record"));
    }
    if u16::from_be_bytes([data[1], data[2]]) != TLS_VERSION {
        return Err(Error::protocol("unexpected TLS record version"));
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len > data.len() - TLS_RECORD_HEADER_SIZE {
        return Err(Error::protocol("truncated TLS record"));
    }
    let payload = &data[TLS_RECORD_HEADER_SIZE..TLS_RECORD_HEADER_SIZE + record_len];
    if payload.len() < 2 {
        return Err(Error::protocol("TLS record payload too short"));
    }
    let len = (u16::from_be_bytes([payload[0], payload[1]]) ^ u16::from_be_bytes(key)) as usize;
    if len > payload.len() - 2 {
        return Err(Error::protocol("invalid TLS record inner length"));
    }
    Ok(payload[2..2 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn cfg(mode: ObfsMode) -> ObfsConfig {
        ObfsConfig {
            mode,
            padding: PaddingConfig::default(),
        }
    }

    #[test]
    fn test_none_is_identity() {
        let o = Obfuscator::from_config(&cfg(ObfsMode::None), SECRET).unwrap();
        let data = b"datagram".to_vec();
        assert_eq!(o.wrap(&data).unwrap(), data);
        assert_eq!(o.unwrap(&data).unwrap(), data);
        assert_eq!(o.overhead(), 0);
    }

    #[test]
    fn test_padding_round_trip() {
        let o = Obfuscator::from_config(&cfg(ObfsMode::Padding), SECRET).unwrap();
        for payload in [&b""[..], b"x", &[0u8; 1400]] {
            let wrapped = o.wrap(payload).unwrap();
            assert!(wrapped.len() >= payload.len() + 2 + 16);
            assert!(wrapped.len() <= payload.len() + o.overhead());
            assert_eq!(o.unwrap(&wrapped).unwrap(), payload);
        }
    }

    #[test]
    fn test_tls_record_shape() {
        let o = Obfuscator::from_config(&cfg(ObfsMode::Tls), SECRET).unwrap();
        let wrapped = o.wrap(b"quic initial").unwrap();
        assert_eq!(wrapped[0], 0x17);
        assert_eq!(&wrapped[1..3], &[0x03, 0x03]);
        let record_len = u16::from_be_bytes([wrapped[3], wrapped[4]]) as usize;
        assert_eq!(wrapped.len(), 5 + record_len);
        assert_eq!(o.unwrap(&wrapped).unwrap(), b"quic initial");
    }

    #[test]
    fn test_unwrap_rejects_garbage() {
        let o = Obfuscator::from_config(&cfg(ObfsMode::Tls), SECRET).unwrap();
        assert!(o.unwrap(&[0x16, 0x03, 0x03, 0, 0, 0, 0]).is_err());
        assert!(o.unwrap(&[]).is_err());

        let o = Obfuscator::from_config(&cfg(ObfsMode::Padding), SECRET).unwrap();
        assert!(o.unwrap(&[1]).is_err());
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = derive_obfs_key(SECRET);
        let b = derive_obfs_key(SECRET);
        assert_eq!(a, b);
        let c = derive_obfs_key("another secret");
        assert_ne!(a, c);
    }

    #[test]
    fn test_wrong_key_fails_or_corrupts() {
        let o1 = Obfuscator::from_config(&cfg(ObfsMode::Padding), SECRET).unwrap();
        let o2 = Obfuscator::Padding {
            key: [0xFF, 0xFF],
            cfg: PaddingConfig::default(),
        };
        let wrapped = o1.wrap(b"hello").unwrap();
        match o2.unwrap(&wrapped) {
            Ok(data) => assert_ne!(data, b"hello"),
            Err(_) => {}
        }
    }
}
