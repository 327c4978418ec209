//! End-to-end exercises of the whole pipeline over an in-memory lower
//! device: round-trips for every IV discipline, ordering, integrity, and
//! memory-pressure behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use crate::api::*;
use crate::backend::bio::{Bio, BioOp};
use crate::backend::engine::{CompletionHandle, CryptEvent, EngineStatus, SectorCipher};
use crate::backend::hosted::MemDevice;
use crate::backend::mapping::CryptMapping;
use crate::backend::request::{assemble, CryptRequest, SgSpan};
use crate::backend::iv::CryptDir;

const KEY32: &str = "0000000000000000000000000000000000000000000000000000000000000000";

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_sync(map: &CryptMapping, sector: u64, data: &[u8]) -> IoStatus {
    let (tx, rx) = channel();
    map.submit(
        Bio::with_data(BioOp::Write, sector, data)
            .with_completion(Box::new(move |s| { let _ = tx.send(s); })),
    );
    rx.recv_timeout(Duration::from_secs(10)).expect("write stalled")
}

fn read_sync(map: &CryptMapping, sector: u64, len: usize) -> (IoStatus, Vec<u8>) {
    let bio = Bio::with_data(BioOp::Read, sector, &vec![0u8; len]);
    let probe = bio.clone_shallow();
    let (tx, rx) = channel();
    map.submit(bio.with_completion(Box::new(move |s| { let _ = tx.send(s); })));
    let status = rx.recv_timeout(Duration::from_secs(10)).expect("read stalled");
    (status, probe.copy_to_vec())
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Scenario: aes-cbc with plain64 on 512-byte sectors. The all-zero sector
/// round-trips, and the bytes at rest are not the plaintext.
#[test]
fn zero_sector_roundtrips_and_rests_encrypted() {
    init_log();
    let dev = Arc::new(MemDevice::new(64));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32), dev.clone(), None)
            .unwrap();
    assert_eq!(write_sync(&map, 0, &[0u8; 512]), IoStatus::Ok);
    let raw = dev.read_raw(0, 512);
    assert!(raw.iter().any(|&b| b != 0), "ciphertext cannot be all zero");
    let (status, data) = read_sync(&map, 0, 512);
    assert_eq!(status, IoStatus::Ok);
    assert_eq!(data, vec![0u8; 512]);
}

/// Every stateless IV discipline round-trips, and the same plaintext lands
/// as different ciphertext at different sectors.
#[test]
fn iv_disciplines_roundtrip() {
    init_log();
    let key64 = format!("{}{}", KEY32, KEY32);
    let tables = [
        format!("aes-cbc-plain {} 0 /dev/lower 0", KEY32),
        format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32),
        format!("aes-cbc-plain64be {} 0 /dev/lower 0", KEY32),
        format!("aes-cbc-essiv:sha256 {} 0 /dev/lower 0", KEY32),
        format!("aes-cbc-benbi {} 0 /dev/lower 0", KEY32),
        format!("aes-cbc-null {} 0 /dev/lower 0", KEY32),
        format!("aes-xts-plain64 {} 0 /dev/lower 0", key64),
        format!("aes-ctr-plain64 {} 0 /dev/lower 0", KEY32),
        format!("aes-ecb {} 0 /dev/lower 0", KEY32),
        format!("capi:xts(aes)-essiv:sha256 {} 0 /dev/lower 0", key64),
    ];
    for table in &tables {
        let dev = Arc::new(MemDevice::new(64));
        let map = CryptMapping::new(table, dev.clone(), None).unwrap();
        let data = patterned(512, 7);
        assert_eq!(write_sync(&map, 3, &data), IoStatus::Ok, "{}", table);
        assert_eq!(write_sync(&map, 9, &data), IoStatus::Ok, "{}", table);
        let (s, back) = read_sync(&map, 3, 512);
        assert_eq!(s, IoStatus::Ok);
        assert_eq!(back, data, "{}", table);
        if !table.contains("null") && !table.contains("ecb") {
            assert_ne!(
                dev.read_raw(3, 512),
                dev.read_raw(9, 512),
                "per-sector IVs must diverge: {}",
                table
            );
        }
    }
}

/// The Loop-AES and TrueCrypt compatibility modes: 512-byte round-trips and
/// sector-bound ciphertext.
#[test]
fn lmk_and_tcw_roundtrip() {
    init_log();
    let key64 = format!("{}{}", KEY32, KEY32);
    for table in
        [format!("aes-cbc-lmk {} 0 /dev/lower 0", KEY32), format!("aes-cbc-tcw {} 0 /dev/lower 0", key64)]
    {
        let dev = Arc::new(MemDevice::new(64));
        let map = CryptMapping::new(&table, dev.clone(), None).unwrap();
        let data = patterned(512, 42);
        assert_eq!(write_sync(&map, 5, &data), IoStatus::Ok, "{}", table);
        assert_eq!(write_sync(&map, 6, &data), IoStatus::Ok, "{}", table);
        assert_ne!(dev.read_raw(5, 512), dev.read_raw(6, 512), "{}", table);
        for sector in [5u64, 6] {
            let (s, back) = read_sync(&map, sector, 512);
            assert_eq!(s, IoStatus::Ok, "{}", table);
            assert_eq!(back, data, "{}", table);
        }
    }
}

/// Scenario: two writes with out-of-order sectors land on the lower device
/// in ascending order within one sequencer drain.
#[test]
fn sequencer_orders_writes_within_a_drain() {
    init_log();
    let dev = Arc::new(MemDevice::new(64));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32), dev.clone(), None)
            .unwrap();
    map.core().sequencer.pause();
    let (tx, rx) = channel();
    for sector in [17u64, 2] {
        let tx = tx.clone();
        map.submit(
            Bio::with_data(BioOp::Write, sector, &patterned(512, sector as u8))
                .with_completion(Box::new(move |s| { let _ = tx.send(s); })),
        );
    }
    // both clones must be parked in the tree before the drain runs
    while map.core().sequencer.pending() < 2 {
        std::thread::sleep(Duration::from_millis(5));
    }
    map.core().sequencer.resume();
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::Ok);
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::Ok);
    let writes: Vec<u64> = dev
        .drain_journal()
        .into_iter()
        .filter(|(op, _)| *op == BioOp::Write)
        .map(|(_, s)| s)
        .collect();
    assert_eq!(writes, vec![2, 17]);
}

/// Scenario: AEAD with a 16-byte tag. Corrupting the tag of one sector
/// fails that sector's read with Protection; neighbors are unaffected.
#[test]
fn aead_tag_corruption_is_protection() {
    init_log();
    let dev = Arc::new(MemDevice::with_integrity(64, 16));
    let map = CryptMapping::new(
        &format!("capi:gcm-siv(aes)-plain64 {} 0 /dev/lower 0 1 integrity:16:aead", KEY32),
        dev.clone(),
        None,
    )
    .unwrap();
    let data = patterned(512, 1);
    assert_eq!(write_sync(&map, 4, &data), IoStatus::Ok);
    assert_eq!(write_sync(&map, 5, &data), IoStatus::Ok);

    dev.corrupt_meta(4, 3);
    let (status, _) = read_sync(&map, 4, 512);
    assert_eq!(status, IoStatus::Protection);
    let (status, back) = read_sync(&map, 5, 512);
    assert_eq!(status, IoStatus::Ok);
    assert_eq!(back, data);
}

/// Flipping ciphertext (not the tag) must also surface Protection.
#[test]
fn aead_data_corruption_is_protection() {
    init_log();
    let dev = Arc::new(MemDevice::with_integrity(64, 16));
    let map = CryptMapping::new(
        &format!(
            "capi:authenc(hmac(sha256),cbc(aes))-plain64 {}{} 0 /dev/lower 0 1 integrity:16:aead",
            KEY32, KEY32
        ),
        dev.clone(),
        None,
    )
    .unwrap();
    let data = patterned(512, 9);
    assert_eq!(write_sync(&map, 2, &data), IoStatus::Ok);
    let (s, back) = read_sync(&map, 2, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);

    dev.corrupt_data(2 * 512 + 100);
    let (status, _) = read_sync(&map, 2, 512);
    assert_eq!(status, IoStatus::Protection);
}

/// Scenario: the random IV mode stores its IV in the metadata sideband.
/// Writing the same plaintext twice gives different ciphertext; both
/// round-trip.
#[test]
fn random_iv_survives_roundtrip_via_stored_iv() {
    init_log();
    let dev = Arc::new(MemDevice::with_integrity(64, 16));
    let map = CryptMapping::new(
        &format!("aes-cbc-random {} 0 /dev/lower 0 1 integrity:16:none", KEY32),
        dev.clone(),
        None,
    )
    .unwrap();
    let data = patterned(512, 77);
    assert_eq!(write_sync(&map, 7, &data), IoStatus::Ok);
    let first = dev.read_raw(7, 512);
    let (s, back) = read_sync(&map, 7, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);

    assert_eq!(write_sync(&map, 7, &data), IoStatus::Ok);
    let second = dev.read_raw(7, 512);
    assert_ne!(first, second, "random IVs must not repeat");
    let (s, back) = read_sync(&map, 7, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// Scenario: engine fan-out. With four engines, sectors 0..=4 select
/// engines 0,1,2,3,0.
#[test]
fn engine_selection_strides_the_fanout() {
    init_log();
    let key: String = KEY32.repeat(4);
    let dev = Arc::new(MemDevice::new(64));
    let map =
        CryptMapping::new(&format!("aes:4-cbc-plain64 {} 0 /dev/lower 0", key), dev, None).unwrap();
    let core = map.core();
    let page = crate::backend::bio::alloc_page();
    for (sector, want) in [(0u64, 0usize), (1, 1), (2, 2), (3, 3), (4, 0)] {
        let span = SgSpan { page: page.clone(), offset: 0, len: 512 };
        let (_req, engine) =
            assemble(core, CryptDir::Write, sector, span.clone(), span, 0, None).unwrap();
        assert_eq!(engine, want, "sector {}", sector);
    }
    // and the full pipeline still round-trips under the fan-out
    let data = patterned(1024, 3);
    assert_eq!(write_sync(&map, 2, &data), IoStatus::Ok);
    let (s, back) = read_sync(&map, 2, 1024);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// Engine selection keys off the raw 512-unit sector even when
/// iv_large_sectors narrows the IV sector: with 4096-byte sectors the
/// crypto sector advances by 8, so four engines see 0, 8&3, 16&3, 24&3.
#[test]
fn engine_selection_ignores_the_large_sector_shift() {
    init_log();
    let key: String = KEY32.repeat(4);
    let dev = Arc::new(MemDevice::new(4096));
    let map = CryptMapping::new(
        &format!("aes:4-cbc-plain64 {} 0 /dev/lower 0 2 sector_size:4096 iv_large_sectors", key),
        dev,
        None,
    )
    .unwrap();
    let core = map.core();
    let page = crate::backend::bio::alloc_page();
    for cc_sector in [0u64, 8, 16, 24] {
        let span = SgSpan { page: page.clone(), offset: 0, len: 4096 };
        let (req, engine) =
            assemble(core, CryptDir::Write, cc_sector, span.clone(), span, 0, None).unwrap();
        assert_eq!(engine, (cc_sector & 3) as usize, "cc_sector {}", cc_sector);
        // the IV generator still sees the narrowed sector
        assert_eq!(req.iv_sector, cc_sector >> 3);
    }
    let data = patterned(16384, 6);
    assert_eq!(write_sync(&map, 8, &data), IoStatus::Ok);
    let (s, back) = read_sync(&map, 8, 16384);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// Scenario: page-pool pressure. Two 1 MiB writes against a 128-page pool
/// both complete, and the slow path was taken at least once.
#[test]
fn concurrent_writes_survive_pool_pressure() {
    init_log();
    let dev = Arc::new(MemDevice::new(8192));
    let map = Arc::new(
        CryptMapping::with_pool_limit(
            &format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32),
            dev,
            None,
            Some(128),
        )
        .unwrap(),
    );
    // Hold completed clones back so allocated pages cannot recycle until
    // the losing writer has observably entered the slow path.
    map.core().sequencer.pause();
    let mut handles = Vec::new();
    for lane in 0..2u64 {
        let map = map.clone();
        handles.push(std::thread::spawn(move || {
            let data = patterned(1 << 20, lane as u8);
            assert_eq!(write_sync(&map, lane * 2048, &data), IoStatus::Ok);
            let (s, back) = read_sync(&map, lane * 2048, 1 << 20);
            assert_eq!(s, IoStatus::Ok);
            assert_eq!(back, data);
        }));
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while map.core().pool.slow_path_hits() == 0 {
        assert!(std::time::Instant::now() < deadline, "nobody reached the slow path");
        std::thread::sleep(Duration::from_millis(2));
    }
    map.core().sequencer.resume();
    for h in handles {
        h.join().unwrap();
    }
    assert!(map.core().pool.slow_path_hits() >= 1, "pressure must reach the slow path");
    assert_eq!(map.core().pool.outstanding(), 0);
    assert_eq!(map.core().pool.accounted(), 0);
}

/// 4096-byte sectors with iv_large_sectors: multi-sector I/O round-trips.
#[test]
fn large_sectors_roundtrip() {
    init_log();
    let dev = Arc::new(MemDevice::new(4096));
    let map = CryptMapping::new(
        &format!("aes-xts-plain64 {}{} 0 /dev/lower 0 2 sector_size:4096 iv_large_sectors", KEY32, KEY32),
        dev,
        None,
    )
    .unwrap();
    let data = patterned(16384, 5);
    assert_eq!(write_sync(&map, 8, &data), IoStatus::Ok);
    let (s, back) = read_sync(&map, 8, 16384);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);

    // misaligned starts are refused
    let (tx, rx) = channel();
    map.submit(
        Bio::with_data(BioOp::Write, 3, &patterned(4096, 0))
            .with_completion(Box::new(move |s| { let _ = tx.send(s); })),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::IoError);
}

/// Flushes pass through untouched; discards pass through only when allowed.
#[test]
fn flush_and_discard_forwarding() {
    init_log();
    let dev = Arc::new(MemDevice::new(64));
    let map = CryptMapping::new(
        &format!("aes-cbc-plain64 {} 0 /dev/lower 0 1 allow_discards", KEY32),
        dev.clone(),
        None,
    )
    .unwrap();
    let (tx, rx) = channel();
    map.submit(Bio::new(BioOp::Flush, 0).with_completion(Box::new(move |s| { let _ = tx.send(s); })));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::Ok);

    let (tx, rx) = channel();
    let mut discard = Bio::new(BioOp::Discard, 8);
    discard.raw_len = 4096;
    map.submit(discard.with_completion(Box::new(move |s| { let _ = tx.send(s); })));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::Ok);

    let no_discard = CryptMapping::new(
        &format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32),
        Arc::new(MemDevice::new(64)),
        None,
    )
    .unwrap();
    let (tx, rx) = channel();
    let mut discard = Bio::new(BioOp::Discard, 8);
    discard.raw_len = 4096;
    no_discard.submit(discard.with_completion(Box::new(move |s| { let _ = tx.send(s); })));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::IoError);
}

/// The `start` offset remaps the whole extent on the lower device.
#[test]
fn start_offset_remaps() {
    init_log();
    let dev = Arc::new(MemDevice::new(128));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 32", KEY32), dev.clone(), None)
            .unwrap();
    assert_eq!(map.sectors(), 96);
    let data = patterned(512, 11);
    assert_eq!(write_sync(&map, 0, &data), IoStatus::Ok);
    // logical sector 0 lives at lower sector 32
    assert!(dev.read_raw(32, 512).iter().any(|&b| b != 0));
    assert!(dev.read_raw(0, 512).iter().all(|&b| b == 0));
    let (s, back) = read_sync(&map, 0, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// iv_offset shifts IV derivation without moving data: two mappings with
/// different iv_offset produce different ciphertext for the same sector.
#[test]
fn iv_offset_shifts_iv_derivation() {
    init_log();
    let mk = |ivoff: u64| {
        let dev = Arc::new(MemDevice::new(64));
        let map = CryptMapping::new(
            &format!("aes-cbc-plain64 {} {} /dev/lower 0", KEY32, ivoff),
            dev.clone(),
            None,
        )
        .unwrap();
        assert_eq!(write_sync(&map, 1, &patterned(512, 0)), IoStatus::Ok);
        dev.read_raw(1, 512)
    };
    assert_ne!(mk(0), mk(100));
}

/// A lower-device failure surfaces as IoError on the upper completion.
#[test]
fn lower_device_error_propagates() {
    init_log();
    let dev = Arc::new(MemDevice::new(64));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32), dev.clone(), None)
            .unwrap();
    dev.fail_next(1);
    assert_eq!(write_sync(&map, 0, &[1u8; 512]), IoStatus::IoError);
    // the next one goes through
    assert_eq!(write_sync(&map, 0, &[1u8; 512]), IoStatus::Ok);
}

/// No-wait submissions fail with Resource after one re-queue when the pool
/// is exhausted, instead of blocking.
#[test]
fn nowait_surfaces_resource_exhaustion() {
    init_log();
    let dev = Arc::new(MemDevice::new(1024));
    let map = CryptMapping::with_pool_limit(
        &format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32),
        dev,
        None,
        Some(16),
    )
    .unwrap();
    let hog = map.core().pool.try_alloc(16).unwrap();
    let (tx, rx) = channel();
    let mut bio = Bio::with_data(BioOp::Write, 0, &patterned(16 * PAGE_SIZE, 1));
    bio.nowait = true;
    map.submit(bio.with_completion(Box::new(move |s| { let _ = tx.send(s); })));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::Resource);
    map.core().pool.release(hog);
    // with pages back, the same write succeeds
    let mut bio = Bio::with_data(BioOp::Write, 0, &patterned(16 * PAGE_SIZE, 1));
    bio.nowait = true;
    let (tx, rx) = channel();
    map.submit(bio.with_completion(Box::new(move |s| { let _ = tx.send(s); })));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), IoStatus::Ok);
}

/// The offload pipeline tags descriptors for device-side crypto and skips
/// the converter entirely: bytes land verbatim, with the tag attached.
#[test]
fn offload_pipeline_tags_and_forwards() {
    init_log();
    let dev = Arc::new(MemDevice::new(64));
    let map =
        CryptMapping::new(&format!("aes-disk-plain64 {} 0 /dev/lower 0", KEY32), dev.clone(), None)
            .unwrap();
    let data = patterned(512, 21);
    assert_eq!(write_sync(&map, 3, &data), IoStatus::Ok);
    assert_eq!(dev.inline_tagged(), 1);
    // the core did not encrypt; the device is expected to
    assert_eq!(dev.read_raw(3, 512), data);
    let (s, back) = read_sync(&map, 3, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
    assert_eq!(dev.inline_tagged(), 2);
}

/// After `key wipe` + `key set`, old data written under the old key reads
/// back only under the old key.
#[test]
fn rekey_changes_the_view() {
    init_log();
    let other_key = "11".repeat(32);
    let dev = Arc::new(MemDevice::new(64));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32), dev, None).unwrap();
    let data = patterned(512, 2);
    assert_eq!(write_sync(&map, 1, &data), IoStatus::Ok);

    map.suspend();
    map.message("key wipe").unwrap();
    map.message(&format!("key set {}", other_key)).unwrap();
    map.resume().unwrap();

    let (s, back) = read_sync(&map, 1, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_ne!(back, data, "a different key must not reveal old plaintext");

    map.suspend();
    map.message(&format!("key set {}", KEY32)).unwrap();
    map.resume().unwrap();
    let (s, back) = read_sync(&map, 1, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// Randomized consistency check: scattered writes of random payloads all
/// read back intact, including overwrites. Seeded, so failures reproduce.
#[test]
fn scattered_random_writes_read_back() {
    use rand::{Rng, SeedableRng};
    init_log();
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0x1bad_b002);
    let dev = Arc::new(MemDevice::new(512));
    let map = CryptMapping::new(
        &format!("aes-xts-plain64 {}{} 0 /dev/lower 0", KEY32, KEY32),
        dev,
        None,
    )
    .unwrap();
    let mut shadow: std::collections::HashMap<u64, Vec<u8>> = std::collections::HashMap::new();
    for _ in 0..64 {
        let sector = rng.gen_range(0..500);
        let nsect = rng.gen_range(1..=8usize).min(512 - sector as usize);
        let mut data = vec![0u8; nsect * 512];
        rng.fill(&mut data[..]);
        assert_eq!(write_sync(&map, sector, &data), IoStatus::Ok);
        for (i, chunk) in data.chunks(512).enumerate() {
            shadow.insert(sector + i as u64, chunk.to_vec());
        }
    }
    for (&sector, expect) in &shadow {
        let (s, back) = read_sync(&map, sector, 512);
        assert_eq!(s, IoStatus::Ok);
        assert_eq!(&back, expect, "sector {}", sector);
    }
}

// ---- asynchronous engine behavior ----------------------------------------

fn noop_handle() -> CompletionHandle { Arc::new(|_: CryptEvent, _: &mut CryptRequest| {}) }

/// Wraps an inline engine and completes every request from another thread,
/// reporting `Busy` (and firing the two-event protocol) every `busy_every`th
/// submission.
struct AsyncShim {
    inner: Arc<dyn SectorCipher>,
    busy_every: usize,
    submissions: AtomicUsize,
}

impl AsyncShim {
    fn wrap(inner: Arc<dyn SectorCipher>, busy_every: usize) -> Arc<AsyncShim> {
        Arc::new(AsyncShim { inner, busy_every, submissions: AtomicUsize::new(0) })
    }
}

impl SectorCipher for AsyncShim {
    fn set_key(&self, key: &[u8]) -> Result<(), KeyError> { self.inner.set_key(key) }

    fn clear_key(&self) { self.inner.clear_key() }

    fn iv_size(&self) -> usize { self.inner.iv_size() }

    fn block_size(&self) -> usize { self.inner.block_size() }

    fn tag_size(&self) -> usize { self.inner.tag_size() }

    fn process(&self, req: &mut CryptRequest, done: &CompletionHandle) -> EngineStatus {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        let backlogged = self.busy_every > 0 && (n + 1) % self.busy_every == 0;
        let mut owned = req.clone();
        let inner = self.inner.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1));
            if backlogged {
                // completion fires twice for a backlogged request
                (*done)(CryptEvent::Restart, &mut owned);
            }
            let result = match inner.process(&mut owned, &noop_handle()) {
                EngineStatus::Ok => Ok(()),
                EngineStatus::Error(e) => Err(e),
                other => panic!("inner engine must be inline, got {:?}", other),
            };
            (*done)(CryptEvent::Finished(result), &mut owned);
        });
        if backlogged { EngineStatus::Busy } else { EngineStatus::Async }
    }
}

/// Everything still round-trips when the engine completes asynchronously,
/// including the sequencer's reordering of out-of-order completions.
#[test]
fn async_engine_completions_roundtrip() {
    init_log();
    let dev = Arc::new(MemDevice::new(256));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32), dev, None).unwrap();
    let core = map.core();
    let shimmed = AsyncShim::wrap(core.engine(0), 0);
    core.swap_engines_for_test(vec![shimmed as Arc<dyn SectorCipher>]);

    let data = patterned(16 * 512, 13);
    assert_eq!(write_sync(&map, 8, &data), IoStatus::Ok);
    let (s, back) = read_sync(&map, 8, 16 * 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// The backlog path: Busy submissions park the converter until the restart
/// signal, then complete through the normal async route.
#[test]
fn backlogged_engine_restarts_the_converter() {
    init_log();
    let dev = Arc::new(MemDevice::new(256));
    let map =
        CryptMapping::new(&format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32), dev, None).unwrap();
    let core = map.core();
    let shimmed = AsyncShim::wrap(core.engine(0), 3);
    core.swap_engines_for_test(vec![shimmed as Arc<dyn SectorCipher>]);

    let data = patterned(24 * 512, 19);
    assert_eq!(write_sync(&map, 0, &data), IoStatus::Ok);
    let (s, back) = read_sync(&map, 0, 24 * 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
}

/// `submit_from_crypt_cpus`: inline-completed writes bypass the sequencer
/// and submit straight from the crypt worker.
#[test]
fn no_offload_submits_directly() {
    init_log();
    let dev = Arc::new(MemDevice::new(64));
    let map = CryptMapping::new(
        &format!("aes-cbc-plain64 {} 0 /dev/lower 0 2 submit_from_crypt_cpus same_cpu_crypt", KEY32),
        dev.clone(),
        None,
    )
    .unwrap();
    // park the sequencer: direct submission must not care
    map.core().sequencer.pause();
    let data = patterned(512, 4);
    assert_eq!(write_sync(&map, 6, &data), IoStatus::Ok);
    assert_eq!(map.core().sequencer.pending(), 0);
    map.core().sequencer.resume();
    let (s, back) = read_sync(&map, 6, 512);
    assert_eq!(s, IoStatus::Ok);
    assert_eq!(back, data);
    assert_eq!(
        map.status(),
        format!(
            "aes-cbc-plain64 {} 0 /dev/lower 0 2 same_cpu_crypt submit_from_crypt_cpus",
            KEY32
        )
    );
}

/// Page accounting: a write of W bytes draws ceil(W / page_size) pages and
/// every one returns by completion.
#[test]
fn page_accounting_balances() {
    init_log();
    let dev = Arc::new(MemDevice::new(1024));
    let map = CryptMapping::with_pool_limit(
        &format!("aes-cbc-plain64 {} 0 /dev/lower 0", KEY32),
        dev,
        None,
        Some(64),
    )
    .unwrap();
    let data = patterned(10 * 4096, 3);
    assert_eq!(write_sync(&map, 0, &data), IoStatus::Ok);
    assert_eq!(map.core().pool.outstanding(), 0);
    assert_eq!(map.core().pool.accounted(), 0);
}
