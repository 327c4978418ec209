use std::sync::RwLock;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use digest::Digest;
use md5::Md5;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::api::*;

/// Whitening mask width for the TrueCrypt-compatible mode.
pub(crate) const TCW_WHITENING_SIZE: usize = 16;
/// The Loop-AES and TrueCrypt modes bake in the 512-byte sector.
const COMPAT_SECTOR_SIZE: usize = 512;

/// Which way the enclosing request travels. Several IV modes behave
/// differently per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptDir {
    Read,
    Write,
}

/// ESSIV keys the salt cipher with the digest of the data key, so the salt
/// cipher's flavor follows the digest width.
enum EssivTfm {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

#[derive(Clone, Copy, PartialEq)]
enum EssivHash {
    Sha256,
    Md5,
}

pub(crate) struct EssivState {
    hash: EssivHash,
    salt_tfm: RwLock<Option<EssivTfm>>,
}

pub(crate) struct LmkState {
    /// Seed bytes carved off the key tail; present only when the key carries
    /// an extra part.
    seed: RwLock<Option<Zeroizing<Vec<u8>>>>,
    seed_size: usize,
}

struct TcwKeys {
    iv_seed: Zeroizing<Vec<u8>>,
    whitening: Zeroizing<[u8; TCW_WHITENING_SIZE]>,
}

pub(crate) struct TcwState {
    keys: RwLock<Option<TcwKeys>>,
}

/// The IV-generation family. Capability methods that a variant does not need
/// are no-ops, mirroring an optional-operations table.
pub(crate) enum IvGenerator {
    Plain,
    Plain64,
    Plain64Be,
    Null,
    Essiv(EssivState),
    Benbi { shift: u32 },
    Lmk(LmkState),
    Tcw(TcwState),
    Random,
}

impl IvGenerator {
    /// Builds the generator and reports how many trailing key bytes it
    /// claims (`key_extra_size`). `key_parts` may be bumped by one for modes
    /// that carve their state from an extra key part.
    pub fn construct(
        mode: &str,
        opts: Option<&str>,
        cipher_block_size: usize,
        iv_size: usize,
        sector_size: usize,
        key_size: usize,
        key_parts: &mut usize,
    ) -> Result<(IvGenerator, usize), ConfigError> {
        match mode {
            "plain" => Ok((IvGenerator::Plain, 0)),
            "plain64" => Ok((IvGenerator::Plain64, 0)),
            "plain64be" => Ok((IvGenerator::Plain64Be, 0)),
            "null" => Ok((IvGenerator::Null, 0)),
            "random" => Ok((IvGenerator::Random, 0)),
            "essiv" => {
                if cipher_block_size != iv_size {
                    return Err(ConfigError::UnsupportedIvMode(format!(
                        "essiv requires cipher block size {} == IV size {}",
                        cipher_block_size, iv_size
                    )));
                }
                let hash = match opts {
                    Some("sha256") => EssivHash::Sha256,
                    Some("md5") => EssivHash::Md5,
                    Some(other) => {
                        return Err(ConfigError::UnsupportedIvMode(format!("essiv:{}", other)));
                    }
                    None => {
                        return Err(ConfigError::UnsupportedIvMode(
                            "essiv needs a digest algorithm".into(),
                        ));
                    }
                };
                Ok((IvGenerator::Essiv(EssivState { hash, salt_tfm: RwLock::new(None) }), 0))
            }
            "benbi" => {
                if !cipher_block_size.is_power_of_two() || cipher_block_size > 512 {
                    return Err(ConfigError::UnsupportedIvMode(format!(
                        "benbi cannot narrow a {}-byte block",
                        cipher_block_size
                    )));
                }
                let shift = 9 - cipher_block_size.trailing_zeros();
                Ok((IvGenerator::Benbi { shift }, 0))
            }
            "lmk" => {
                if sector_size != COMPAT_SECTOR_SIZE {
                    return Err(ConfigError::IvSectorSize {
                        mode: "lmk",
                        required: COMPAT_SECTOR_SIZE,
                        got: sector_size,
                    });
                }
                // A key that is not an even multiple of its parts carries one
                // extra part: the IV seed.
                let mut seed_size = 0;
                if key_size % *key_parts != 0 {
                    *key_parts += 1;
                    seed_size = key_size / *key_parts;
                }
                Ok((
                    IvGenerator::Lmk(LmkState { seed: RwLock::new(None), seed_size }),
                    seed_size,
                ))
            }
            "tcw" => {
                if sector_size != COMPAT_SECTOR_SIZE {
                    return Err(ConfigError::IvSectorSize {
                        mode: "tcw",
                        required: COMPAT_SECTOR_SIZE,
                        got: sector_size,
                    });
                }
                let extra = iv_size + TCW_WHITENING_SIZE;
                if key_size <= extra {
                    return Err(ConfigError::UnsupportedIvMode(format!(
                        "tcw needs more than {} key bytes, got {}",
                        extra, key_size
                    )));
                }
                Ok((IvGenerator::Tcw(TcwState { keys: RwLock::new(None) }), extra))
            }
            other => Err(ConfigError::UnsupportedIvMode(other.to_string())),
        }
    }

    /// Post-setkey initialization. Runs only while the mapping is suspended
    /// (or during construction), so the write locks never contend with
    /// generation.
    pub fn init(&self, key: &[u8], iv_size: usize) -> Result<(), KeyError> {
        match self {
            IvGenerator::Essiv(state) => {
                let salt: Zeroizing<Vec<u8>> = match state.hash {
                    EssivHash::Sha256 => Zeroizing::new(Sha256::digest(key).to_vec()),
                    EssivHash::Md5 => Zeroizing::new(Md5::digest(key).to_vec()),
                };
                let tfm = match salt.len() {
                    16 => EssivTfm::Aes128(Box::new(Aes128::new(GenericArray::from_slice(&salt)))),
                    32 => EssivTfm::Aes256(Box::new(Aes256::new(GenericArray::from_slice(&salt)))),
                    n => return Err(KeyError::Rejected(format!("essiv salt size {}", n))),
                };
                *state.salt_tfm.write().unwrap() = Some(tfm);
                Ok(())
            }
            IvGenerator::Lmk(state) => {
                if state.seed_size > 0 {
                    let tail = &key[key.len() - state.seed_size..];
                    *state.seed.write().unwrap() = Some(Zeroizing::new(tail.to_vec()));
                }
                Ok(())
            }
            IvGenerator::Tcw(state) => {
                let seed_start = key.len() - iv_size;
                let whitening_start = seed_start - TCW_WHITENING_SIZE;
                let mut whitening = [0u8; TCW_WHITENING_SIZE];
                whitening.copy_from_slice(&key[whitening_start..seed_start]);
                *state.keys.write().unwrap() = Some(TcwKeys {
                    iv_seed: Zeroizing::new(key[seed_start..].to_vec()),
                    whitening: Zeroizing::new(whitening),
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drops key-derived state. The generator refuses work until the next
    /// `init`.
    pub fn wipe(&self) {
        match self {
            IvGenerator::Essiv(state) => drop(state.salt_tfm.write().unwrap().take()),
            IvGenerator::Lmk(state) => drop(state.seed.write().unwrap().take()),
            IvGenerator::Tcw(state) => drop(state.keys.write().unwrap().take()),
            _ => {}
        }
    }

    /// Fills `iv` for one sector. `data` is the sector's payload: plaintext
    /// on writes, ciphertext (pre-decrypt) on reads. Only the Loop-AES and
    /// TrueCrypt modes look at it; tcw additionally strips whitening from
    /// ciphertext on reads.
    pub fn generate(
        &self,
        iv: &mut [u8],
        sector: u64,
        dir: CryptDir,
        data: &mut [u8],
    ) -> Result<(), EngineError> {
        match self {
            IvGenerator::Plain => {
                iv.fill(0);
                iv[..4].copy_from_slice(&(sector as u32).to_le_bytes());
            }
            IvGenerator::Plain64 => {
                iv.fill(0);
                iv[..8].copy_from_slice(&sector.to_le_bytes());
            }
            IvGenerator::Plain64Be => {
                iv.fill(0);
                let n = iv.len();
                iv[n - 8..].copy_from_slice(&sector.to_be_bytes());
            }
            IvGenerator::Null => iv.fill(0),
            IvGenerator::Essiv(state) => {
                iv.fill(0);
                iv[..8].copy_from_slice(&sector.to_le_bytes());
                let guard = state.salt_tfm.read().unwrap();
                let tfm = guard.as_ref().ok_or(EngineError::NoKey)?;
                let block = GenericArray::from_mut_slice(iv);
                match tfm {
                    EssivTfm::Aes128(c) => c.encrypt_block(block),
                    EssivTfm::Aes256(c) => c.encrypt_block(block),
                }
            }
            IvGenerator::Benbi { shift } => {
                iv.fill(0);
                let val = (sector << shift).wrapping_add(1);
                let n = iv.len();
                iv[n - 8..].copy_from_slice(&val.to_be_bytes());
            }
            IvGenerator::Lmk(state) => match dir {
                CryptDir::Write => lmk_one(state, iv, sector, data),
                CryptDir::Read => iv.fill(0),
            },
            IvGenerator::Tcw(state) => {
                let guard = state.keys.read().unwrap();
                let keys = guard.as_ref().ok_or(EngineError::NoKey)?;
                if dir == CryptDir::Read {
                    tcw_whiten(&keys.whitening, sector, data);
                }
                let sec = sector.to_le_bytes();
                for (i, b) in iv.iter_mut().enumerate() {
                    *b = keys.iv_seed[i] ^ sec[i % 8];
                }
            }
            IvGenerator::Random => {
                use rand::RngCore;
                if dir == CryptDir::Read {
                    // Reads recover the IV from the integrity sideband; the
                    // assembler never asks us for one.
                    return Err(EngineError::Failed("random IV has no read path"));
                }
                rand::thread_rng().fill_bytes(iv);
            }
        }
        Ok(())
    }

    /// Payload tweak after the cipher ran. `data` is the recovered plaintext
    /// on reads and the fresh ciphertext on writes.
    pub fn post(
        &self,
        iv: &mut [u8],
        sector: u64,
        dir: CryptDir,
        data: &mut [u8],
    ) -> Result<(), EngineError> {
        match self {
            IvGenerator::Lmk(state) => {
                if dir == CryptDir::Read {
                    // The read ran with a zero IV, so the first block came
                    // out XORed with the true IV. Recompute it from the
                    // recovered tail and fold it back in.
                    lmk_one(state, iv, sector, data);
                    for (b, m) in data.iter_mut().zip(iv.iter()) {
                        *b ^= m;
                    }
                }
                Ok(())
            }
            IvGenerator::Tcw(state) => {
                if dir == CryptDir::Write {
                    let guard = state.keys.read().unwrap();
                    let keys = guard.as_ref().ok_or(EngineError::NoKey)?;
                    tcw_whiten(&keys.whitening, sector, data);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// True when writes must stash the generated IV in the integrity
    /// sideband for the matching read to find.
    pub fn needs_stored_iv(&self) -> bool { matches!(self, IvGenerator::Random) }
}

/// Loop-AES IV: MD5 over (seed ‖ sector bytes 16..512 ‖ packed sector word).
/// The first 16 payload bytes are deliberately excluded; they are the part
/// the IV protects.
fn lmk_one(state: &LmkState, iv: &mut [u8], sector: u64, data: &[u8]) {
    let mut md5 = Md5::new();
    if let Some(seed) = state.seed.read().unwrap().as_ref() {
        md5.update(seed.as_slice());
    }
    md5.update(&data[16..COMPAT_SECTOR_SIZE]);
    let mut buf = [0u8; 16];
    buf[..4].copy_from_slice(&((sector & 0xFFFF_FFFF) as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&(((sector >> 32) as u32) | 0x8000_0000).to_le_bytes());
    buf[8..12].copy_from_slice(&4024u32.to_le_bytes());
    md5.update(&buf);
    let digest = md5.finalize();
    let n = iv.len();
    iv.copy_from_slice(&digest[..n]);
    buf.zeroize();
}

/// TrueCrypt whitening: an 8-byte mask derived from the whitening key and
/// the sector number, XORed across every 8-byte lane. Involutive, so the
/// same routine both applies and strips it.
fn tcw_whiten(whitening: &[u8; TCW_WHITENING_SIZE], sector: u64, data: &mut [u8]) {
    let sec = sector.to_le_bytes();
    let mut buf = [0u8; TCW_WHITENING_SIZE];
    for i in 0..8 {
        buf[i] = whitening[i] ^ sec[i];
        buf[8 + i] = whitening[8 + i] ^ sec[i];
    }
    // CRC32 (seed 0, no final inversion) of each 4-byte quarter, in place.
    for i in 0..4 {
        let c = crc::crc32::update(0, &crc::crc32::IEEE_TABLE, &buf[i * 4..i * 4 + 4]);
        buf[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
    }
    // Fold the four CRCs into one 8-byte mask.
    for i in 0..4 {
        buf[i] ^= buf[12 + i];
    }
    for i in 0..4 {
        buf[4 + i] ^= buf[8 + i];
    }
    for lane in data.chunks_mut(8) {
        for (b, m) in lane.iter_mut().zip(buf.iter()) {
            *b ^= m;
        }
    }
    buf.zeroize();
}
