use std::sync::Arc;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::api::*;
use crate::backend::engine::{authenc_pack_key, AeadKind, ChainMode, SectorCipher};
use crate::backend::mapping::{CipherKind, CryptCore};

/// HMAC-SHA256 sub-key width inside an authenc composite key.
pub(crate) const AUTHENC_MAC_KEY_SIZE: usize = 32;
/// Engine fan-out is bounded; a mapping never holds more than this many.
const MAX_TFMS: usize = 64;

/// A parsed cipher specification. `original` keeps the exact spelling for
/// status output; `api_name` is what would go to a crypto-API lookup.
#[derive(Debug, Clone)]
pub(crate) struct CipherSpec {
    pub original: String,
    pub api_name: String,
    pub cipher: String,
    pub chainmode: String,
    pub ivmode: Option<String>,
    pub ivopts: Option<String>,
    pub keycount: usize,
    pub kind: CipherKind,
    pub block_mode: Option<ChainMode>,
    pub aead: Option<AeadKind>,
}

/// Accepts both grammars:
///
/// * legacy `cipher[:keycount]-chainmode-ivmode[:ivopts]`, with the bare
///   `cipher` compatibility shim meaning `cipher-cbc-plain`, and the
///   `disk`/`fmp` chainmodes selecting the hardware-offload path;
/// * new `capi:<crypto-api-spec>-<ivmode>[:ivopts]`, which admits AEAD
///   compositions.
pub(crate) fn parse_cipher_spec(spec: &str) -> Result<CipherSpec, ConfigError> {
    if spec.is_empty() {
        return Err(ConfigError::CipherSpec("empty".into()));
    }
    if let Some(capi) = spec.strip_prefix("capi:") {
        return parse_capi_spec(spec, capi);
    }

    // legacy grammar
    let mut parts = spec.splitn(3, '-');
    let head = parts.next().unwrap();
    let chainmode = parts.next();
    let ivspec = parts.next();

    let (cipher, keycount) = match head.split_once(':') {
        Some((cipher, count)) => {
            let count: usize = count
                .parse()
                .map_err(|_| ConfigError::CipherSpec(format!("bad keycount in {}", spec)))?;
            (cipher, count)
        }
        None => (head, 1),
    };
    if cipher.is_empty() {
        return Err(ConfigError::CipherSpec(spec.into()));
    }
    if !keycount.is_power_of_two() || keycount == 0 || keycount > MAX_TFMS {
        return Err(ConfigError::CipherSpec(format!(
            "keycount {} must be a power of two in 1..={}",
            keycount, MAX_TFMS
        )));
    }

    // bare cipher: compatibility shim for cipher-cbc-plain
    let (chainmode, ivspec) = match chainmode {
        Some(mode) => (mode, ivspec),
        None => ("cbc", Some("plain")),
    };
    let (ivmode, ivopts) = split_ivspec(ivspec);

    let (kind, block_mode) = match chainmode {
        "ecb" => (CipherKind::Block, Some(ChainMode::Ecb)),
        "cbc" => (CipherKind::Block, Some(ChainMode::Cbc)),
        "ctr" => (CipherKind::Block, Some(ChainMode::Ctr)),
        "xts" => (CipherKind::Block, Some(ChainMode::Xts)),
        // device-side crypto engines
        "disk" | "fmp" => (CipherKind::Offload, None),
        other => return Err(ConfigError::UnsupportedCipher(format!("{}({})", other, cipher))),
    };
    if kind == CipherKind::Block && cipher != "aes" {
        return Err(ConfigError::UnsupportedCipher(cipher.into()));
    }
    if kind == CipherKind::Block && ivmode.is_none() && block_mode != Some(ChainMode::Ecb) {
        return Err(ConfigError::CipherSpec(format!("{} needs an IV mode", spec)));
    }

    Ok(CipherSpec {
        original: spec.to_string(),
        api_name: format!("{}({})", chainmode, cipher),
        cipher: cipher.to_string(),
        chainmode: chainmode.to_string(),
        ivmode,
        ivopts,
        keycount,
        kind,
        block_mode,
        aead: None,
    })
}

fn parse_capi_spec(original: &str, capi: &str) -> Result<CipherSpec, ConfigError> {
    // the IV mode hangs off the last dash so that api specs carrying dashes
    // of their own stay intact
    let (api_name, ivspec) = match capi.rfind('-') {
        Some(pos) => (&capi[..pos], Some(&capi[pos + 1..])),
        None => (capi, None),
    };
    if api_name.is_empty() {
        return Err(ConfigError::CipherSpec(original.into()));
    }
    let (ivmode, ivopts) = split_ivspec(ivspec);

    let (kind, block_mode, aead) = match api_name {
        "ecb(aes)" => (CipherKind::Block, Some(ChainMode::Ecb), None),
        "cbc(aes)" => (CipherKind::Block, Some(ChainMode::Cbc), None),
        "ctr(aes)" => (CipherKind::Block, Some(ChainMode::Ctr), None),
        "xts(aes)" => (CipherKind::Block, Some(ChainMode::Xts), None),
        "gcm-siv(aes)" => (CipherKind::Aead, None, Some(AeadKind::GcmSiv)),
        "authenc(hmac(sha256),cbc(aes))" => {
            (CipherKind::Aead, None, Some(AeadKind::AuthencHmacSha256CbcAes))
        }
        other => return Err(ConfigError::UnsupportedCipher(other.into())),
    };
    if ivmode.is_none() && block_mode != Some(ChainMode::Ecb) {
        return Err(ConfigError::CipherSpec(format!("{} needs an IV mode", original)));
    }

    Ok(CipherSpec {
        original: original.to_string(),
        api_name: api_name.to_string(),
        cipher: "aes".to_string(),
        chainmode: String::new(),
        ivmode,
        ivopts,
        keycount: 1,
        kind,
        block_mode,
        aead,
    })
}

fn split_ivspec(ivspec: Option<&str>) -> (Option<String>, Option<String>) {
    match ivspec {
        Some(iv) => match iv.split_once(':') {
            Some((mode, opts)) => (Some(mode.to_string()), Some(opts.to_string())),
            None => (Some(iv.to_string()), None),
        },
        None => (None, None),
    }
}

/// Where key material comes from.
pub(crate) enum KeySource {
    /// Decoded inline hex.
    Hex(Zeroizing<Vec<u8>>),
    /// A keyring reference resolved at install time.
    Keyring { ktype: KeyType, description: String, size: usize },
    /// `-`: no key.
    None,
}

impl KeySource {
    pub fn size(&self) -> usize {
        match self {
            KeySource::Hex(bytes) => bytes.len(),
            KeySource::Keyring { size, .. } => *size,
            KeySource::None => 0,
        }
    }
}

/// Parses the key table argument: inline hex, `-`, or
/// `:<size>:{user|logon}:<description>`. Returns the source and the string
/// status reporting must echo.
pub(crate) fn parse_key_arg(arg: &str) -> Result<(KeySource, String), KeyError> {
    if arg == "-" {
        return Ok((KeySource::None, "-".to_string()));
    }
    if let Some(rest) = arg.strip_prefix(':') {
        if arg.contains(char::is_whitespace) {
            return Err(KeyError::KeyringRef("whitespace in reference".into()));
        }
        let mut fields = rest.splitn(3, ':');
        let size: usize = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KeyError::KeyringRef(arg.into()))?;
        if size == 0 {
            return Err(KeyError::Size(0));
        }
        let ktype = match fields.next() {
            Some("user") => KeyType::User,
            Some("logon") => KeyType::Logon,
            _ => return Err(KeyError::KeyringRef(arg.into())),
        };
        let description = fields
            .next()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| KeyError::KeyringRef(arg.into()))?
            .to_string();
        return Ok((KeySource::Keyring { ktype, description, size }, arg.to_string()));
    }
    let bytes = hex::decode(arg).map_err(|_| KeyError::Hex)?;
    Ok((KeySource::Hex(Zeroizing::new(bytes)), arg.to_string()))
}

/// Resolves a key source to raw bytes, consulting the keyring service for
/// references. The payload must match the declared size exactly.
pub(crate) fn resolve_key(
    source: &KeySource,
    keyring: Option<&Arc<dyn KeyringService>>,
) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    match source {
        KeySource::Hex(bytes) => Ok(Zeroizing::new(bytes.to_vec())),
        KeySource::None => Ok(Zeroizing::new(Vec::new())),
        KeySource::Keyring { ktype, description, size } => {
            let service = keyring.ok_or(KeyError::NoKeyring)?;
            let payload = service.lookup(*ktype, description)?;
            if payload.len() != *size {
                return Err(KeyError::PayloadLength { got: payload.len(), want: *size });
            }
            Ok(payload)
        }
    }
}

/// Fans the key across the engine vector: each engine receives
/// `(key_size - key_extra_size) / tfms_count` bytes at its offset, with the
/// authenc composite framing applied (and wiped) around each setkey. On
/// success the mapping's key buffer and IV generator state are refreshed and
/// `KEY_VALID` is set; on any failure `KEY_VALID` is left clear and the old
/// engine state is whatever the failed setkey left, exactly as reported.
pub(crate) fn crypt_set_key(core: &CryptCore, key: &[u8]) -> Result<(), KeyError> {
    core.clear_key_valid();
    if key.len() != core.key_size {
        return Err(KeyError::Size(key.len()));
    }
    let usable = core.key_size - core.key_extra_size;
    if core.tfms_count == 0 || usable % core.tfms_count != 0 {
        return Err(KeyError::Size(key.len()));
    }
    let subkey_size = usable / core.tfms_count;

    for i in 0..core.tfms_count {
        let subkey = &key[i * subkey_size..(i + 1) * subkey_size];
        if core.key_mac_size > 0 {
            if subkey.len() <= core.key_mac_size {
                return Err(KeyError::Size(subkey.len()));
            }
            let framed = authenc_pack_key(
                &subkey[..core.key_mac_size],
                &subkey[core.key_mac_size..],
            );
            core.engine(i).set_key(&framed)?;
            // framed drops here; Zeroizing wipes the composite scratch
        } else {
            core.engine(i).set_key(subkey)?;
        }
    }

    core.store_key(key);
    core.ivgen.init(key, core.iv_size)?;
    core.set_key_valid();
    Ok(())
}

/// Wipes the key: the buffer is overwritten with random bytes, the garbage
/// is pushed through setkey to invalidate engine schedules, and every
/// derived state is dropped. The mapping refuses key-consuming work until
/// the next successful install.
pub(crate) fn crypt_wipe_key(core: &CryptCore) {
    core.clear_key_valid();
    let mut garbage = Zeroizing::new(vec![0u8; core.key_size]);
    rand::thread_rng().fill_bytes(&mut garbage);
    let usable = core.key_size.saturating_sub(core.key_extra_size);
    if core.tfms_count > 0 && usable > 0 && usable % core.tfms_count == 0 {
        let subkey_size = usable / core.tfms_count;
        for i in 0..core.tfms_count {
            let _ = core.engine(i).set_key(&garbage[i * subkey_size..(i + 1) * subkey_size]);
        }
    }
    for i in 0..core.tfms_count {
        core.engine(i).clear_key();
    }
    core.ivgen.wipe();
    core.store_key(&garbage);
    core.wipe_key_buffer();
}
