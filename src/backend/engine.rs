use std::sync::{Arc, RwLock};

use aes::cipher::{
    block_padding::NoPadding, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    generic_array::GenericArray, KeyInit, KeyIvInit, StreamCipher,
};
use aes::{Aes128, Aes256};
use aes_gcm_siv::aead::{AeadInPlace, Nonce, Tag};
use aes_gcm_siv::{Aes128GcmSiv, Aes256GcmSiv};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use xts_mode::Xts128;
use zeroize::Zeroizing;

use crate::api::*;
use crate::backend::bio::InlineCryptTag;
use crate::backend::iv::CryptDir;
use crate::backend::request::CryptRequest;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of handing one request to an engine.
///
/// Software engines complete inline and return `Ok`/`Error`. An engine that
/// queues work returns `Async`, or `Busy` when its input queue was full, and
/// later delivers a [`CryptEvent`] (twice for a busy request: a `Restart`
/// once the queue drains, then the final event) through the request's
/// completion handle.
#[derive(Debug)]
pub(crate) enum EngineStatus {
    Ok,
    Async,
    Busy,
    Error(EngineError),
}

/// Events from an engine's asynchronous completion path.
#[derive(Debug, Clone)]
pub(crate) enum CryptEvent {
    /// A previously backlogged request has started processing.
    Restart,
    Finished(Result<(), EngineError>),
}

/// Handle an asynchronous engine calls back through. The request rides along
/// so the finisher can post-process it. A backlogged request sees two calls:
/// `Restart` first, then `Finished`.
pub(crate) type CompletionHandle = Arc<dyn Fn(CryptEvent, &mut CryptRequest) + Send + Sync>;

/// The surface every cipher engine presents to the converter: the standard
/// setkey/process pair plus an asynchronous completion channel. The software
/// engines in this module always finish inline; hardware-backed ones may
/// queue and answer later through the handle.
pub(crate) trait SectorCipher: Send + Sync {
    fn set_key(&self, key: &[u8]) -> Result<(), KeyError>;
    fn clear_key(&self);
    fn iv_size(&self) -> usize;
    fn block_size(&self) -> usize;
    fn tag_size(&self) -> usize;
    fn process(&self, req: &mut CryptRequest, done: &CompletionHandle) -> EngineStatus;
    /// For device-offloaded engines: the handle descriptors get tagged with
    /// so the lower device can run the cipher itself.
    fn offload_tag(&self, iv_offset: u64) -> Option<Arc<InlineCryptTag>> {
        let _ = iv_offset;
        None
    }
}

impl SectorCipher for Engine {
    fn set_key(&self, key: &[u8]) -> Result<(), KeyError> { Engine::set_key(self, key) }

    fn clear_key(&self) { Engine::clear_key(self) }

    fn iv_size(&self) -> usize { Engine::iv_size(self) }

    fn block_size(&self) -> usize { Engine::block_size(self) }

    fn tag_size(&self) -> usize { Engine::tag_size(self) }

    fn process(&self, req: &mut CryptRequest, _done: &CompletionHandle) -> EngineStatus {
        Engine::process(self, req)
    }

    fn offload_tag(&self, iv_offset: u64) -> Option<Arc<InlineCryptTag>> {
        match self {
            Engine::Offload(eng) => eng.key.read().unwrap().as_ref().map(|key| {
                Arc::new(InlineCryptTag { cipher: eng.cipher.clone(), key: key.clone(), iv_offset })
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainMode {
    Ecb,
    Cbc,
    Ctr,
    Xts,
}

#[derive(Clone, Copy, PartialEq)]
enum AesFlavor {
    Aes128,
    Aes256,
}

struct BlockKeys {
    flavor: AesFlavor,
    key: Zeroizing<Vec<u8>>,
}

/// An ordinary block-cipher engine: AES under one chaining mode, keyed
/// through interior mutability so a shared engine can be re-keyed while
/// suspended.
pub(crate) struct BlockEngine {
    mode: ChainMode,
    keys: RwLock<Option<BlockKeys>>,
}

impl BlockEngine {
    pub fn new(mode: ChainMode) -> BlockEngine { BlockEngine { mode, keys: RwLock::new(None) } }

    fn flavor_for(&self, key_len: usize) -> Result<AesFlavor, KeyError> {
        let unit = match self.mode {
            // XTS splits its key into two independent cipher keys.
            ChainMode::Xts => key_len / 2,
            _ => key_len,
        };
        if self.mode == ChainMode::Xts && key_len % 2 != 0 {
            return Err(KeyError::Size(key_len));
        }
        match unit {
            16 => Ok(AesFlavor::Aes128),
            32 => Ok(AesFlavor::Aes256),
            _ => Err(KeyError::Size(key_len)),
        }
    }
}

/// AEAD composition. `GcmSiv` is the native AEAD; `Authenc` is the
/// encrypt-then-MAC composite (CBC under HMAC-SHA256) keyed by the framed
/// composite format from the key installer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum AeadKind {
    GcmSiv,
    AuthencHmacSha256CbcAes,
}

enum AeadKeys {
    GcmSiv128(Box<Aes128GcmSiv>),
    GcmSiv256(Box<Aes256GcmSiv>),
    Authenc { mac_key: Zeroizing<Vec<u8>>, enc_key: Zeroizing<Vec<u8>>, flavor: AesFlavor },
}

pub(crate) struct AeadEngine {
    kind: AeadKind,
    tag_size: usize,
    keys: RwLock<Option<AeadKeys>>,
}

/// Composite-key attribute type, as the framed authenc key format names it.
const AUTHENC_KEY_PARAM: u16 = 1;

/// Frames (mac_key, enc_key) into the composite setkey format the authenc
/// engine expects: a length-framed attribute header carrying the encryption
/// sub-key length, then the auth sub-key, then the encryption sub-key.
/// Callers zeroize the result as soon as setkey returns.
pub(crate) fn authenc_pack_key(mac_key: &[u8], enc_key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut framed = Zeroizing::new(Vec::with_capacity(8 + mac_key.len() + enc_key.len()));
    framed.extend_from_slice(&8u16.to_le_bytes());
    framed.extend_from_slice(&AUTHENC_KEY_PARAM.to_le_bytes());
    framed.extend_from_slice(&(enc_key.len() as u32).to_be_bytes());
    framed.extend_from_slice(mac_key);
    framed.extend_from_slice(enc_key);
    framed
}

fn authenc_unpack_key(framed: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>), KeyError> {
    if framed.len() < 8 {
        return Err(KeyError::Rejected("short composite key".into()));
    }
    let rta_len = u16::from_le_bytes([framed[0], framed[1]]) as usize;
    let rta_type = u16::from_le_bytes([framed[2], framed[3]]);
    if rta_len != 8 || rta_type != AUTHENC_KEY_PARAM {
        return Err(KeyError::Rejected("bad composite key header".into()));
    }
    let enc_len = u32::from_be_bytes([framed[4], framed[5], framed[6], framed[7]]) as usize;
    let body = &framed[8..];
    if enc_len > body.len() {
        return Err(KeyError::Rejected("composite key truncated".into()));
    }
    let (mac, enc) = body.split_at(body.len() - enc_len);
    Ok((Zeroizing::new(mac.to_vec()), Zeroizing::new(enc.to_vec())))
}

impl AeadEngine {
    pub fn new(kind: AeadKind, tag_size: usize) -> Result<AeadEngine, ConfigError> {
        match kind {
            AeadKind::GcmSiv => {
                if tag_size != 16 {
                    return Err(ConfigError::IntegritySpace(format!(
                        "gcm-siv produces a 16-byte tag, {} requested",
                        tag_size
                    )));
                }
            }
            AeadKind::AuthencHmacSha256CbcAes => {
                if tag_size == 0 || tag_size > 32 {
                    return Err(ConfigError::IntegritySpace(format!(
                        "authenc hmac(sha256) tag must be 1..=32 bytes, {} requested",
                        tag_size
                    )));
                }
            }
        }
        Ok(AeadEngine { kind, tag_size, keys: RwLock::new(None) })
    }
}

/// Device-offloaded crypto: the engine only holds the key and the crypto-API
/// name; the lower device does the work on descriptors tagged with them.
pub(crate) struct OffloadEngine {
    cipher: String,
    key: RwLock<Option<Zeroizing<Vec<u8>>>>,
}

impl OffloadEngine {
    pub fn new(cipher: &str) -> OffloadEngine {
        OffloadEngine { cipher: cipher.to_string(), key: RwLock::new(None) }
    }
}

pub(crate) enum Engine {
    Block(BlockEngine),
    Aead(AeadEngine),
    Offload(OffloadEngine),
}

impl Engine {
    /// (Re)installs key material. Every engine accepts the key through
    /// interior mutability so the mapping can fan one setkey across its
    /// engine vector.
    pub fn set_key(&self, key: &[u8]) -> Result<(), KeyError> {
        match self {
            Engine::Block(eng) => {
                let flavor = eng.flavor_for(key.len())?;
                *eng.keys.write().unwrap() =
                    Some(BlockKeys { flavor, key: Zeroizing::new(key.to_vec()) });
                Ok(())
            }
            Engine::Aead(eng) => {
                let keys = match eng.kind {
                    AeadKind::GcmSiv => match key.len() {
                        16 => AeadKeys::GcmSiv128(Box::new(Aes128GcmSiv::new(
                            GenericArray::from_slice(key),
                        ))),
                        32 => AeadKeys::GcmSiv256(Box::new(Aes256GcmSiv::new(
                            GenericArray::from_slice(key),
                        ))),
                        n => return Err(KeyError::Size(n)),
                    },
                    AeadKind::AuthencHmacSha256CbcAes => {
                        let (mac_key, enc_key) = authenc_unpack_key(key)?;
                        let flavor = match enc_key.len() {
                            16 => AesFlavor::Aes128,
                            32 => AesFlavor::Aes256,
                            n => return Err(KeyError::Size(n)),
                        };
                        AeadKeys::Authenc { mac_key, enc_key, flavor }
                    }
                };
                *eng.keys.write().unwrap() = Some(keys);
                Ok(())
            }
            Engine::Offload(eng) => {
                *eng.key.write().unwrap() = Some(Zeroizing::new(key.to_vec()));
                Ok(())
            }
        }
    }

    pub fn clear_key(&self) {
        match self {
            Engine::Block(eng) => drop(eng.keys.write().unwrap().take()),
            Engine::Aead(eng) => drop(eng.keys.write().unwrap().take()),
            Engine::Offload(eng) => drop(eng.key.write().unwrap().take()),
        }
    }

    /// IV width the IV generator must fill for this engine.
    pub fn iv_size(&self) -> usize {
        match self {
            Engine::Block(_) => 16,
            Engine::Aead(eng) => match eng.kind {
                AeadKind::GcmSiv => 12,
                AeadKind::AuthencHmacSha256CbcAes => 16,
            },
            Engine::Offload(_) => 16,
        }
    }

    /// Cipher block granularity, as the benbi IV mode counts it.
    pub fn block_size(&self) -> usize {
        match self {
            Engine::Block(eng) => match eng.mode {
                ChainMode::Ctr => 1,
                _ => 16,
            },
            Engine::Aead(_) => 1,
            Engine::Offload(_) => 16,
        }
    }

    pub fn tag_size(&self) -> usize {
        match self {
            Engine::Aead(eng) => eng.tag_size,
            _ => 0,
        }
    }

    /// Drives one sector through the cipher. The software engines here
    /// always complete inline; the [`EngineStatus`] contract still carries
    /// the asynchronous statuses for engines that queue.
    pub fn process(&self, req: &mut CryptRequest) -> EngineStatus {
        let result = match self {
            Engine::Block(eng) => self.process_block(eng, req),
            Engine::Aead(eng) => self.process_aead(eng, req),
            Engine::Offload(_) => Err(EngineError::Failed("offload engine cannot convert")),
        };
        match result {
            Ok(()) => EngineStatus::Ok,
            Err(e) => EngineStatus::Error(e),
        }
    }

    fn process_block(&self, eng: &BlockEngine, req: &mut CryptRequest) -> Result<(), EngineError> {
        let guard = eng.keys.read().unwrap();
        let keys = guard.as_ref().ok_or(EngineError::NoKey)?;
        let mut data = req.data_scratch();
        let iv = &req.iv[..16];
        let n = data.len();
        match (eng.mode, keys.flavor, req.dir) {
            (ChainMode::Ecb, AesFlavor::Aes128, dir) => {
                ecb_blocks(&Aes128::new(GenericArray::from_slice(&keys.key)), dir, &mut data)
            }
            (ChainMode::Ecb, AesFlavor::Aes256, dir) => {
                ecb_blocks(&Aes256::new(GenericArray::from_slice(&keys.key)), dir, &mut data)
            }
            (ChainMode::Cbc, AesFlavor::Aes128, CryptDir::Write) => {
                cbc::Encryptor::<Aes128>::new_from_slices(&keys.key, iv)
                    .map_err(|_| EngineError::Failed("cbc key/iv sizing"))?
                    .encrypt_padded_mut::<NoPadding>(&mut data, n)
                    .map_err(|_| EngineError::Failed("cbc pad"))
                    .map(|_| ())?
            }
            (ChainMode::Cbc, AesFlavor::Aes128, CryptDir::Read) => {
                cbc::Decryptor::<Aes128>::new_from_slices(&keys.key, iv)
                    .map_err(|_| EngineError::Failed("cbc key/iv sizing"))?
                    .decrypt_padded_mut::<NoPadding>(&mut data)
                    .map_err(|_| EngineError::Failed("cbc unpad"))
                    .map(|_| ())?
            }
            (ChainMode::Cbc, AesFlavor::Aes256, CryptDir::Write) => {
                cbc::Encryptor::<Aes256>::new_from_slices(&keys.key, iv)
                    .map_err(|_| EngineError::Failed("cbc key/iv sizing"))?
                    .encrypt_padded_mut::<NoPadding>(&mut data, n)
                    .map_err(|_| EngineError::Failed("cbc pad"))
                    .map(|_| ())?
            }
            (ChainMode::Cbc, AesFlavor::Aes256, CryptDir::Read) => {
                cbc::Decryptor::<Aes256>::new_from_slices(&keys.key, iv)
                    .map_err(|_| EngineError::Failed("cbc key/iv sizing"))?
                    .decrypt_padded_mut::<NoPadding>(&mut data)
                    .map_err(|_| EngineError::Failed("cbc unpad"))
                    .map(|_| ())?
            }
            (ChainMode::Ctr, AesFlavor::Aes128, _) => {
                ctr::Ctr128BE::<Aes128>::new_from_slices(&keys.key, iv)
                    .map_err(|_| EngineError::Failed("ctr key/iv sizing"))?
                    .apply_keystream(&mut data)
            }
            (ChainMode::Ctr, AesFlavor::Aes256, _) => {
                ctr::Ctr128BE::<Aes256>::new_from_slices(&keys.key, iv)
                    .map_err(|_| EngineError::Failed("ctr key/iv sizing"))?
                    .apply_keystream(&mut data)
            }
            (ChainMode::Xts, AesFlavor::Aes128, dir) => {
                let (k1, k2) = keys.key.split_at(16);
                let xts = Xts128::new(
                    Aes128::new(GenericArray::from_slice(k1)),
                    Aes128::new(GenericArray::from_slice(k2)),
                );
                let mut tweak = [0u8; 16];
                tweak.copy_from_slice(iv);
                match dir {
                    CryptDir::Write => xts.encrypt_sector(&mut data, tweak),
                    CryptDir::Read => xts.decrypt_sector(&mut data, tweak),
                }
            }
            (ChainMode::Xts, AesFlavor::Aes256, dir) => {
                let (k1, k2) = keys.key.split_at(32);
                let xts = Xts128::new(
                    Aes256::new(GenericArray::from_slice(k1)),
                    Aes256::new(GenericArray::from_slice(k2)),
                );
                let mut tweak = [0u8; 16];
                tweak.copy_from_slice(iv);
                match dir {
                    CryptDir::Write => xts.encrypt_sector(&mut data, tweak),
                    CryptDir::Read => xts.decrypt_sector(&mut data, tweak),
                }
            }
        }
        req.store_data(&data);
        Ok(())
    }

    fn process_aead(&self, eng: &AeadEngine, req: &mut CryptRequest) -> Result<(), EngineError> {
        let guard = eng.keys.read().unwrap();
        let keys = guard.as_ref().ok_or(EngineError::NoKey)?;
        // AAD covers the little-endian sector word and the original IV; the
        // working IV may have been mutated by the engine on a prior pass.
        let mut aad = Vec::with_capacity(8 + req.iv_len);
        aad.extend_from_slice(&req.sector_le);
        aad.extend_from_slice(&req.org_iv[..req.iv_len]);
        let mut data = req.data_scratch();
        let result = match keys {
            AeadKeys::GcmSiv128(cipher) => {
                gcm_siv_one(cipher.as_ref(), req, &aad, &mut data)
            }
            AeadKeys::GcmSiv256(cipher) => {
                gcm_siv_one(cipher.as_ref(), req, &aad, &mut data)
            }
            AeadKeys::Authenc { mac_key, enc_key, flavor } => {
                authenc_one(eng, mac_key, enc_key, *flavor, req, &aad, &mut data)
            }
        };
        if result.is_ok() {
            req.store_data(&data);
        }
        result
    }
}

fn ecb_blocks<C: BlockEncrypt + BlockDecrypt>(cipher: &C, dir: CryptDir, data: &mut [u8]) {
    for block in data.chunks_mut(16) {
        let block = GenericArray::from_mut_slice(block);
        match dir {
            CryptDir::Write => cipher.encrypt_block(block),
            CryptDir::Read => cipher.decrypt_block(block),
        }
    }
}

fn gcm_siv_one<C: AeadInPlace>(
    cipher: &C,
    req: &mut CryptRequest,
    aad: &[u8],
    data: &mut [u8],
) -> Result<(), EngineError> {
    let nonce = Nonce::<C>::from_slice(&req.iv[..12]);
    match req.dir {
        CryptDir::Write => {
            let tag = cipher
                .encrypt_in_place_detached(nonce, aad, data)
                .map_err(|_| EngineError::Failed("aead encrypt"))?;
            req.store_tag(tag.as_slice());
            Ok(())
        }
        CryptDir::Read => {
            let stored = req.load_tag();
            cipher
                .decrypt_in_place_detached(nonce, aad, data, Tag::<C>::from_slice(&stored))
                .map_err(|_| EngineError::BadTag)
        }
    }
}

fn authenc_one(
    eng: &AeadEngine,
    mac_key: &[u8],
    enc_key: &[u8],
    flavor: AesFlavor,
    req: &mut CryptRequest,
    aad: &[u8],
    data: &mut [u8],
) -> Result<(), EngineError> {
    let iv = &req.iv[..16];
    let n = data.len();
    match req.dir {
        CryptDir::Write => {
            match flavor {
                AesFlavor::Aes128 => cbc::Encryptor::<Aes128>::new_from_slices(enc_key, iv)
                    .map_err(|_| EngineError::Failed("authenc key/iv sizing"))?
                    .encrypt_padded_mut::<NoPadding>(data, n)
                    .map_err(|_| EngineError::Failed("authenc pad"))
                    .map(|_| ())?,
                AesFlavor::Aes256 => cbc::Encryptor::<Aes256>::new_from_slices(enc_key, iv)
                    .map_err(|_| EngineError::Failed("authenc key/iv sizing"))?
                    .encrypt_padded_mut::<NoPadding>(data, n)
                    .map_err(|_| EngineError::Failed("authenc pad"))
                    .map(|_| ())?,
            }
            let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
                .map_err(|_| EngineError::Failed("hmac key"))?;
            mac.update(aad);
            mac.update(data);
            let digest = mac.finalize().into_bytes();
            req.store_tag(&digest[..eng.tag_size]);
            Ok(())
        }
        CryptDir::Read => {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
                .map_err(|_| EngineError::Failed("hmac key"))?;
            mac.update(aad);
            mac.update(data);
            let digest = mac.finalize().into_bytes();
            let stored = req.load_tag();
            if digest[..eng.tag_size].ct_eq(&stored[..]).unwrap_u8() == 0 {
                return Err(EngineError::BadTag);
            }
            match flavor {
                AesFlavor::Aes128 => cbc::Decryptor::<Aes128>::new_from_slices(enc_key, iv)
                    .map_err(|_| EngineError::Failed("authenc key/iv sizing"))?
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|_| EngineError::Failed("authenc unpad"))
                    .map(|_| ())?,
                AesFlavor::Aes256 => cbc::Decryptor::<Aes256>::new_from_slices(enc_key, iv)
                    .map_err(|_| EngineError::Failed("authenc key/iv sizing"))?
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|_| EngineError::Failed("authenc unpad"))
                    .map(|_| ())?,
            }
            Ok(())
        }
    }
}
