use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use zeroize::{Zeroize, Zeroizing};

use crate::api::*;
use crate::backend::bio::{Bio, InlineCryptTag};
use crate::backend::engine::{AeadEngine, AeadKind, BlockEngine, Engine, OffloadEngine, SectorCipher};
use crate::backend::iv::IvGenerator;
use crate::backend::keys::{
    self, crypt_set_key, crypt_wipe_key, parse_cipher_spec, parse_key_arg, resolve_key, CipherSpec,
    KeySource,
};
use crate::backend::pool::{pool_pages_for, PagePool};
use crate::backend::queue::WorkPool;
use crate::backend::sequencer::WriteSequencer;
use crate::backend::stage;

/// Which pipeline a mapping runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CipherKind {
    Block,
    Aead,
    Offload,
}

/// Mappings alive in this process; each takes a fair share of the pool
/// budget.
static MAPPING_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Pre-sized integrity-metadata buffers kept per mapping.
const TAG_POOL_BUFFERS: usize = 8;
/// Minimum interval between logged integrity failures.
const INTEGRITY_LOG_INTERVAL: Duration = Duration::from_secs(1);

struct IntegrityLogState {
    last: Option<Instant>,
    suppressed: u64,
}

/// The shared heart of one mapping. Immutable after construction except for
/// the flag word and key material, both of which change only while
/// suspended.
pub(crate) struct CryptCore {
    pub device: DeviceHandle,
    pub device_path: String,
    pub start: u64,
    pub iv_offset: u64,
    pub sector_size: usize,
    /// log2(sector_size / 512)
    pub sector_shift: u32,
    pub tfms_count: usize,
    /// Sub-key count; at least `tfms_count`, one more when the IV mode
    /// carves its state from an extra key part.
    pub key_parts: usize,
    pub key_size: usize,
    pub key_extra_size: usize,
    pub key_mac_size: usize,
    pub iv_size: usize,
    pub on_disk_tag_size: usize,
    pub integrity_tag_size: usize,
    pub integrity_iv_size: usize,
    pub kind: CipherKind,
    pub ivgen: IvGenerator,
    spec: CipherSpec,
    key_display: Mutex<String>,
    flags: RwLock<CryptFlags>,
    engines: RwLock<Vec<Arc<dyn SectorCipher>>>,
    key: Mutex<Zeroizing<Vec<u8>>>,
    inline_tag: RwLock<Option<Arc<InlineCryptTag>>>,
    pub pool: PagePool,
    pub io_queue: WorkPool,
    pub crypt_queue: WorkPool,
    pub sequencer: WriteSequencer,
    tag_pool: Mutex<Vec<Vec<u8>>>,
    tag_buf_size: usize,
    in_flight: Mutex<usize>,
    quiesced: Condvar,
    integrity_log: Mutex<IntegrityLogState>,
}

impl CryptCore {
    pub fn flags(&self) -> CryptFlags { *self.flags.read().unwrap() }

    fn set_flag(&self, flag: CryptFlags) { self.flags.write().unwrap().insert(flag); }

    fn clear_flag(&self, flag: CryptFlags) { self.flags.write().unwrap().remove(flag); }

    pub fn set_key_valid(&self) { self.set_flag(CryptFlags::KEY_VALID); }

    pub fn clear_key_valid(&self) { self.clear_flag(CryptFlags::KEY_VALID); }

    pub fn engine(&self, index: usize) -> Arc<dyn SectorCipher> {
        self.engines.read().unwrap()[index].clone()
    }

    #[cfg(test)]
    pub fn swap_engines_for_test(&self, engines: Vec<Arc<dyn SectorCipher>>) {
        *self.engines.write().unwrap() = engines;
    }

    pub fn store_key(&self, key: &[u8]) {
        let mut held = self.key.lock().unwrap();
        held.zeroize();
        *held = Zeroizing::new(key.to_vec());
        drop(held);
        if self.kind == CipherKind::Offload {
            *self.inline_tag.write().unwrap() = self.engine(0).offload_tag(self.iv_offset);
        }
    }

    pub fn wipe_key_buffer(&self) {
        self.key.lock().unwrap().zeroize();
        *self.inline_tag.write().unwrap() = None;
    }

    pub fn inline_tag(&self) -> Option<Arc<InlineCryptTag>> {
        self.inline_tag.read().unwrap().clone()
    }

    /// One integrity-metadata buffer of at least `want` bytes: pooled when
    /// it fits the pre-sized buffers, heap otherwise (flagged by the bool).
    pub fn tag_buf_acquire(&self, want: usize) -> (Arc<Mutex<Vec<u8>>>, bool) {
        if want <= self.tag_buf_size {
            if let Some(mut buf) = self.tag_pool.lock().unwrap().pop() {
                buf.iter_mut().for_each(|b| *b = 0);
                return (Arc::new(Mutex::new(buf)), true);
            }
        }
        (Arc::new(Mutex::new(vec![0u8; want])), false)
    }

    pub fn tag_buf_release(&self, buf: Arc<Mutex<Vec<u8>>>) {
        if let Ok(lock) = Arc::try_unwrap(buf) {
            let buf = lock.into_inner().unwrap();
            let mut pool = self.tag_pool.lock().unwrap();
            if pool.len() < TAG_POOL_BUFFERS {
                pool.push(buf);
            }
        }
    }

    pub fn io_started(&self) { *self.in_flight.lock().unwrap() += 1; }

    pub fn io_finished(&self) {
        let mut count = self.in_flight.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.quiesced.notify_all();
        }
    }

    fn wait_quiesce(&self) {
        let mut count = self.in_flight.lock().unwrap();
        while *count > 0 {
            count = self.quiesced.wait(count).unwrap();
        }
    }

    /// Rate-limited complaint about a failed tag, naming the sector.
    pub fn log_integrity_failure(&self, sector: u64) {
        let mut state = self.integrity_log.lock().unwrap();
        let now = Instant::now();
        let due = match state.last {
            Some(last) => now.duration_since(last) >= INTEGRITY_LOG_INTERVAL,
            None => true,
        };
        if due {
            if state.suppressed > 0 {
                log::warn!(
                    "integrity tag mismatch at sector {} ({} earlier failures suppressed)",
                    sector,
                    state.suppressed
                );
            } else {
                log::warn!("integrity tag mismatch at sector {}", sector);
            }
            state.last = Some(now);
            state.suppressed = 0;
        } else {
            state.suppressed += 1;
        }
    }
}

/// A virtual encrypted device over a region of a lower one.
pub struct CryptMapping {
    core: Arc<CryptCore>,
    keyring: Option<Arc<dyn KeyringService>>,
}

fn iv_size_for(spec: &CipherSpec) -> usize {
    match spec.aead {
        Some(AeadKind::GcmSiv) => 12,
        _ => 16,
    }
}

fn cipher_block_size_for(spec: &CipherSpec) -> usize {
    match spec.kind {
        CipherKind::Aead => 1,
        _ => match spec.block_mode {
            Some(crate::backend::engine::ChainMode::Ctr) => 1,
            _ => 16,
        },
    }
}

#[derive(Default)]
struct FeatureArgs {
    allow_discards: bool,
    same_cpu_crypt: bool,
    submit_from_crypt_cpus: bool,
    iv_large_sectors: bool,
    sector_size: Option<usize>,
    integrity: Option<(usize, String)>,
}

fn parse_feature_args(tokens: &[&str]) -> Result<FeatureArgs, ConfigError> {
    let mut args = FeatureArgs::default();
    if tokens.is_empty() {
        return Ok(args);
    }
    let count: usize = tokens[0]
        .parse()
        .map_err(|_| ConfigError::Feature(format!("bad option count {}", tokens[0])))?;
    if count != tokens.len() - 1 || count > 6 {
        return Err(ConfigError::Feature("option count mismatch".into()));
    }
    for token in &tokens[1..] {
        match *token {
            "allow_discards" => args.allow_discards = true,
            "same_cpu_crypt" => args.same_cpu_crypt = true,
            "submit_from_crypt_cpus" => args.submit_from_crypt_cpus = true,
            "iv_large_sectors" => args.iv_large_sectors = true,
            other => {
                if let Some(rest) = other.strip_prefix("sector_size:") {
                    let size: usize = rest
                        .parse()
                        .map_err(|_| ConfigError::Feature(other.to_string()))?;
                    args.sector_size = Some(size);
                } else if let Some(rest) = other.strip_prefix("integrity:") {
                    let (bytes, profile) = rest
                        .split_once(':')
                        .ok_or_else(|| ConfigError::Feature(other.to_string()))?;
                    let bytes: usize = bytes
                        .parse()
                        .map_err(|_| ConfigError::Feature(other.to_string()))?;
                    match profile {
                        "aead" | "none" => {}
                        p if p.starts_with("hmac(") && p.ends_with(')') => {}
                        _ => return Err(ConfigError::Feature(other.to_string())),
                    }
                    args.integrity = Some((bytes, profile.to_string()));
                } else {
                    return Err(ConfigError::Feature(other.to_string()));
                }
            }
        }
    }
    Ok(args)
}

fn total_system_pages() -> usize {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                if let Some(kb) =
                    rest.trim().split_whitespace().next().and_then(|v| v.parse::<usize>().ok())
                {
                    return (kb * 1024) / PAGE_SIZE;
                }
            }
        }
    }
    // notional 1 GiB when the platform won't say
    1 << 18
}

impl CryptMapping {
    /// Builds a mapping from a positional table line:
    ///
    /// ```text
    /// <cipher_spec> <key> <iv_offset> <device_path> <start>
    ///     [<#opt_args> allow_discards same_cpu_crypt submit_from_crypt_cpus
    ///      integrity:<bytes>:<profile> sector_size:<n> iv_large_sectors]
    /// ```
    ///
    /// The lower device arrives as an object; the path token is carried for
    /// status reporting. Construction installs the key: a bad key fails here
    /// and no partial mapping is left behind.
    pub fn new(
        table: &str,
        device: DeviceHandle,
        keyring: Option<Arc<dyn KeyringService>>,
    ) -> Result<CryptMapping, ConfigError> {
        CryptMapping::with_pool_limit(table, device, keyring, None)
    }

    /// As [`CryptMapping::new`], with the page-pool limit pinned instead of
    /// derived from system memory.
    pub fn with_pool_limit(
        table: &str,
        device: DeviceHandle,
        keyring: Option<Arc<dyn KeyringService>>,
        pool_pages: Option<usize>,
    ) -> Result<CryptMapping, ConfigError> {
        let tokens: Vec<&str> = table.split_whitespace().collect();
        if tokens.len() < 5 {
            return Err(ConfigError::ArgCount);
        }
        let spec = parse_cipher_spec(tokens[0])?;
        let (key_source, key_display) = parse_key_arg(tokens[1])?;
        let iv_offset: u64 = tokens[2]
            .parse()
            .map_err(|_| ConfigError::Geometry(format!("bad iv_offset {}", tokens[2])))?;
        let device_path = tokens[3].to_string();
        let start: u64 = tokens[4]
            .parse()
            .map_err(|_| ConfigError::Geometry(format!("bad start sector {}", tokens[4])))?;
        let features = parse_feature_args(&tokens[5..])?;

        let sector_size = features.sector_size.unwrap_or(MIN_SECTOR_SIZE);
        if !sector_size.is_power_of_two()
            || sector_size < MIN_SECTOR_SIZE
            || sector_size > MAX_SECTOR_SIZE
        {
            return Err(ConfigError::SectorSize(sector_size));
        }
        let sector_shift = (sector_size >> SECTOR_SHIFT).trailing_zeros();
        let step = (sector_size >> SECTOR_SHIFT) as u64;
        if start % step != 0 {
            return Err(ConfigError::Geometry(format!(
                "start {} not aligned to sector size {}",
                start, sector_size
            )));
        }
        if start >= device.sectors() {
            return Err(ConfigError::Geometry(format!(
                "start {} beyond device ({} sectors)",
                start,
                device.sectors()
            )));
        }

        if spec.kind == CipherKind::Aead && spec.keycount != 1 {
            return Err(ConfigError::CipherSpec("AEAD takes a single key".into()));
        }
        let tfms_count = spec.keycount;

        let iv_size = iv_size_for(&spec);
        let ivmode = spec.ivmode.as_deref().unwrap_or("null");
        let key_size = key_source.size();
        let mut key_parts = tfms_count;
        let (ivgen, key_extra_size) = IvGenerator::construct(
            ivmode,
            spec.ivopts.as_deref(),
            cipher_block_size_for(&spec),
            iv_size,
            sector_size,
            key_size,
            &mut key_parts,
        )?;
        let integrity_iv_size = if ivgen.needs_stored_iv() { iv_size } else { 0 };
        let (on_disk_tag_size, _integrity_profile) = match &features.integrity {
            Some((bytes, profile)) => (*bytes, profile.clone()),
            None => (0, String::new()),
        };
        if integrity_iv_size > 0 && on_disk_tag_size < integrity_iv_size {
            // The original left an undersized sideband undefined; refusing
            // outright is the only answer that cannot lose plaintext.
            return Err(ConfigError::IntegritySpace(format!(
                "random IV needs {} metadata bytes, {} configured",
                integrity_iv_size, on_disk_tag_size
            )));
        }
        let integrity_tag_size = on_disk_tag_size - integrity_iv_size;
        if spec.kind == CipherKind::Aead && integrity_tag_size == 0 {
            return Err(ConfigError::IntegritySpace(
                "AEAD requires integrity tag space".into(),
            ));
        }
        if on_disk_tag_size > 0 {
            let available = device.integrity_bytes_per_sector() * step as usize;
            if available < on_disk_tag_size {
                return Err(ConfigError::IntegritySpace(format!(
                    "device offers {} metadata bytes per sector, {} needed",
                    available, on_disk_tag_size
                )));
            }
        }

        let mut engines: Vec<Arc<dyn SectorCipher>> = Vec::with_capacity(tfms_count);
        for _ in 0..tfms_count {
            let engine = match spec.kind {
                CipherKind::Block => Engine::Block(BlockEngine::new(
                    spec.block_mode.expect("block kind carries a mode"),
                )),
                CipherKind::Aead => Engine::Aead(AeadEngine::new(
                    spec.aead.expect("aead kind carries a flavor"),
                    integrity_tag_size,
                )?),
                CipherKind::Offload => Engine::Offload(OffloadEngine::new(&spec.api_name)),
            };
            engines.push(Arc::new(engine));
        }

        let key_mac_size = match spec.aead {
            Some(AeadKind::AuthencHmacSha256CbcAes) => keys::AUTHENC_MAC_KEY_SIZE,
            _ => 0,
        };
        if matches!(key_source, KeySource::None) && spec.kind != CipherKind::Offload {
            return Err(ConfigError::Key(KeyError::Size(0)));
        }
        let key_bytes = resolve_key(&key_source, keyring.as_ref())?;

        let n_mappings = MAPPING_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        let pool_limit =
            pool_pages.unwrap_or_else(|| pool_pages_for(total_system_pages(), n_mappings));
        let pool = PagePool::new(pool_limit);
        let max_run_sectors = pool.max_run_pages() * PAGE_SIZE / sector_size;
        let tag_buf_size = max_run_sectors * on_disk_tag_size;
        let tag_pool = if on_disk_tag_size > 0 {
            (0..TAG_POOL_BUFFERS).map(|_| vec![0u8; tag_buf_size]).collect()
        } else {
            Vec::new()
        };

        let crypt_threads = if features.same_cpu_crypt {
            1
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        };

        let mut flags = CryptFlags::empty();
        if features.allow_discards {
            flags |= CryptFlags::ALLOW_DISCARDS;
        }
        if features.same_cpu_crypt {
            flags |= CryptFlags::SAME_CPU;
        }
        if features.submit_from_crypt_cpus {
            flags |= CryptFlags::NO_OFFLOAD;
        }
        if features.iv_large_sectors {
            flags |= CryptFlags::IV_LARGE_SECTORS;
        }
        if spec.kind == CipherKind::Aead {
            flags |= CryptFlags::INTEGRITY_AEAD;
        }

        let core = Arc::new(CryptCore {
            sequencer: WriteSequencer::start(device.clone()),
            device,
            device_path,
            start,
            iv_offset,
            sector_size,
            sector_shift,
            tfms_count,
            key_parts,
            key_size,
            key_extra_size,
            key_mac_size,
            iv_size,
            on_disk_tag_size,
            integrity_tag_size,
            integrity_iv_size,
            kind: spec.kind,
            ivgen,
            spec,
            key_display: Mutex::new(key_display),
            flags: RwLock::new(flags),
            engines: RwLock::new(engines),
            key: Mutex::new(Zeroizing::new(Vec::new())),
            inline_tag: RwLock::new(None),
            pool,
            io_queue: WorkPool::new("crypt-io", 1),
            crypt_queue: WorkPool::new("crypt-work", crypt_threads),
            tag_pool: Mutex::new(tag_pool),
            tag_buf_size,
            in_flight: Mutex::new(0),
            quiesced: Condvar::new(),
            integrity_log: Mutex::new(IntegrityLogState { last: None, suppressed: 0 }),
        });

        if let Err(e) = crypt_set_key(&core, &key_bytes) {
            MAPPING_COUNT.fetch_sub(1, Ordering::SeqCst);
            core.sequencer.stop();
            return Err(ConfigError::Key(e));
        }

        log::info!(
            "mapping on {}: {} start {} iv_offset {} sector_size {}",
            core.device_path,
            core.spec.original,
            core.start,
            core.iv_offset,
            core.sector_size
        );
        Ok(CryptMapping { core, keyring })
    }

    /// Capacity of the virtual device, in 512-byte sectors.
    pub fn sectors(&self) -> u64 {
        let step = (self.core.sector_size >> SECTOR_SHIFT) as u64;
        let raw = self.core.device.sectors() - self.core.start;
        raw - raw % step
    }

    /// Routes one descriptor through the pipeline. Sector numbers address
    /// the virtual device.
    pub fn submit(&self, bio: Bio) { stage::map_bio(&self.core, bio); }

    /// Refuses new I/O and waits out everything in flight.
    pub fn suspend(&self) {
        self.core.set_flag(CryptFlags::SUSPENDED);
        self.core.wait_quiesce();
        self.core.sequencer.pause();
    }

    /// Lifts suspension. Fails while the key is invalid (after a wipe), so a
    /// wiped mapping cannot silently resume.
    pub fn resume(&self) -> Result<(), KeyError> {
        if !self.core.flags().contains(CryptFlags::KEY_VALID) {
            return Err(KeyError::NotValid);
        }
        self.core.sequencer.resume();
        self.core.clear_flag(CryptFlags::SUSPENDED);
        Ok(())
    }

    /// The message interface: `key set <key>` and `key wipe`, both only
    /// while suspended.
    pub fn message(&self, message: &str) -> Result<(), KeyError> {
        let words: Vec<&str> = message.split_whitespace().collect();
        match words.as_slice() {
            ["key", "set", arg] => {
                if !self.core.flags().contains(CryptFlags::SUSPENDED) {
                    return Err(KeyError::NotSuspended);
                }
                // Any failure from here on leaves KEY_VALID clear; the old
                // key bytes stay (in-flight I/O is unaffected) but the
                // mapping refuses to resume until a set succeeds.
                self.core.clear_key_valid();
                let (source, display) = parse_key_arg(arg)?;
                let key_bytes = resolve_key(&source, self.keyring.as_ref())?;
                crypt_set_key(&self.core, &key_bytes)?;
                *self.core.key_display.lock().unwrap() = display;
                Ok(())
            }
            ["key", "wipe"] => {
                if !self.core.flags().contains(CryptFlags::SUSPENDED) {
                    return Err(KeyError::NotSuspended);
                }
                crypt_wipe_key(&self.core);
                Ok(())
            }
            _ => Err(KeyError::Rejected(format!("unknown message: {}", message))),
        }
    }

    /// Table-form status: the construction line, reconstructed.
    pub fn status(&self) -> String {
        let core = &self.core;
        let mut features: Vec<String> = Vec::new();
        let flags = core.flags();
        if flags.contains(CryptFlags::ALLOW_DISCARDS) {
            features.push("allow_discards".into());
        }
        if flags.contains(CryptFlags::SAME_CPU) {
            features.push("same_cpu_crypt".into());
        }
        if flags.contains(CryptFlags::NO_OFFLOAD) {
            features.push("submit_from_crypt_cpus".into());
        }
        if let Some((bytes, profile)) = core.integrity_feature() {
            features.push(format!("integrity:{}:{}", bytes, profile));
        }
        if core.sector_size != MIN_SECTOR_SIZE {
            features.push(format!("sector_size:{}", core.sector_size));
        }
        if flags.contains(CryptFlags::IV_LARGE_SECTORS) {
            features.push("iv_large_sectors".into());
        }

        let mut out = format!(
            "{} {} {} {} {}",
            core.spec.original,
            core.key_display.lock().unwrap(),
            core.iv_offset,
            core.device_path,
            core.start
        );
        if !features.is_empty() {
            out.push_str(&format!(" {}", features.len()));
            for f in features {
                out.push(' ');
                out.push_str(&f);
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<CryptCore> { &self.core }
}

impl CryptCore {
    fn integrity_feature(&self) -> Option<(usize, String)> {
        if self.on_disk_tag_size == 0 {
            return None;
        }
        let profile = if self.kind == CipherKind::Aead { "aead" } else { "none" };
        Some((self.on_disk_tag_size, profile.to_string()))
    }
}

impl Drop for CryptMapping {
    fn drop(&mut self) {
        // Quiesce before teardown: no new I/O is accepted once the upper
        // layer dropped its handle, and everything in flight must land.
        self.core.wait_quiesce();
        self.core.sequencer.stop();
        crypt_wipe_key(&self.core);
        MAPPING_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}
