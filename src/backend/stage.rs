use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::api::*;
use crate::backend::bio::{Bio, BioOp, BioVec, PageBuf};
use crate::backend::convert::{crypt_convert, ConvertContext};
use crate::backend::iv::CryptDir;
use crate::backend::mapping::{CipherKind, CryptCore};

/// One upper I/O in flight. The pending counter governs lifetime: every
/// stage that schedules asynchronous follow-up takes a reference, every
/// completion drops one, and the final drop releases resources and signals
/// the upper layer with the sticky error.
pub(crate) struct CryptIo {
    /// Logical start sector within the virtual device, 512-byte units.
    pub sector: u64,
    base: Mutex<Option<Bio>>,
    dir: CryptDir,
    error: Mutex<IoStatus>,
    io_pending: AtomicUsize,
    crypt_pending: AtomicUsize,
    pub ctx: Mutex<Option<ConvertContext>>,
    write_clone: Mutex<Option<Bio>>,
    /// Pool pages backing the write clone, returned at the end of life.
    pages: Mutex<Vec<PageBuf>>,
    integrity: Mutex<Option<Arc<Mutex<Vec<u8>>>>>,
    integrity_from_pool: AtomicBool,
    restart_flag: Mutex<bool>,
    restart_cv: Condvar,
    /// One free re-queue is allowed before a no-wait allocation failure
    /// becomes terminal.
    requeued: AtomicBool,
}

impl CryptIo {
    fn new(base: Bio, sector: u64) -> Arc<CryptIo> {
        let dir = match base.op {
            BioOp::Write => CryptDir::Write,
            _ => CryptDir::Read,
        };
        Arc::new(CryptIo {
            sector,
            base: Mutex::new(Some(base)),
            dir,
            error: Mutex::new(IoStatus::Ok),
            io_pending: AtomicUsize::new(1),
            crypt_pending: AtomicUsize::new(0),
            ctx: Mutex::new(None),
            write_clone: Mutex::new(None),
            pages: Mutex::new(Vec::new()),
            integrity: Mutex::new(None),
            integrity_from_pool: AtomicBool::new(false),
            restart_flag: Mutex::new(false),
            restart_cv: Condvar::new(),
            requeued: AtomicBool::new(false),
        })
    }

    pub fn crypt_dir(&self) -> CryptDir { self.dir }

    pub fn latch_error(&self, status: IoStatus) {
        let mut err = self.error.lock().unwrap();
        if err.is_ok() {
            *err = status;
        }
    }

    pub fn error(&self) -> IoStatus { *self.error.lock().unwrap() }

    pub fn integrity_buf(&self) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.integrity.lock().unwrap().clone()
    }

    fn inc_pending(&self) { self.io_pending.fetch_add(1, Ordering::SeqCst); }

    /// Drops one lifetime reference; the last one ends the I/O.
    fn dec_pending(self: &Arc<CryptIo>, core: &Arc<CryptCore>) {
        if self.io_pending.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        crypt_io_end(core, self);
    }

    pub fn crypt_inc(&self) { self.crypt_pending.fetch_add(1, Ordering::SeqCst); }

    /// Drops a crypto reference from the converter's own loop; never the
    /// last one, because the converter holds the base reference.
    pub fn crypt_dec_quiet(&self) { self.crypt_pending.fetch_sub(1, Ordering::SeqCst); }

    /// Drops a crypto reference from an asynchronous completion; the last
    /// one dispatches the context onward.
    pub fn crypt_dec_and_dispatch(self: &Arc<CryptIo>, core: &Arc<CryptCore>, inline: bool) {
        if self.crypt_pending.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        match self.dir {
            CryptDir::Write => kcryptd_crypt_write_io_submit(core, self, !inline),
            CryptDir::Read => self.dec_pending(core),
        }
    }

    pub fn signal_restart(&self) {
        let mut flag = self.restart_flag.lock().unwrap();
        *flag = true;
        self.restart_cv.notify_one();
    }

    /// Parks the converter until the async path reports that a backlogged
    /// request began processing.
    pub fn wait_restart(&self) {
        let mut flag = self.restart_flag.lock().unwrap();
        while !*flag {
            flag = self.restart_cv.wait(flag).unwrap();
        }
        *flag = false;
    }
}

/// Final teardown: returns pool resources and completes the upper
/// descriptor with the latched status.
fn crypt_io_end(core: &Arc<CryptCore>, io: &Arc<CryptIo>) {
    let pages = std::mem::take(&mut *io.pages.lock().unwrap());
    core.pool.release(pages);
    if let Some(buf) = io.integrity.lock().unwrap().take() {
        if io.integrity_from_pool.load(Ordering::SeqCst) {
            core.tag_buf_release(buf);
        }
    }
    let base = io.base.lock().unwrap().take();
    let status = io.error();
    if let Some(base) = base {
        base.complete(status);
    }
    core.io_finished();
}

/// Entry point: routes one upper descriptor through the pipeline.
pub(crate) fn map_bio(core: &Arc<CryptCore>, bio: Bio) {
    let flags = core.flags();
    if flags.contains(CryptFlags::SUSPENDED) {
        bio.complete(IoStatus::IoError);
        return;
    }

    // Flushes and discards never touch crypto: remap and forward.
    if bio.op == BioOp::Flush {
        forward_plain(core, bio);
        return;
    }
    if bio.op == BioOp::Discard {
        if !flags.contains(CryptFlags::ALLOW_DISCARDS) {
            bio.complete(IoStatus::IoError);
            return;
        }
        forward_plain(core, bio);
        return;
    }

    if !flags.contains(CryptFlags::KEY_VALID) {
        bio.complete(IoStatus::IoError);
        return;
    }

    // Device-offloaded mappings are a different pipeline: tag the
    // descriptor with the engine handle and let the lower device do the
    // cipher work.
    if core.kind == CipherKind::Offload {
        forward_offload(core, bio);
        return;
    }

    if let Err(status) = check_geometry(core, &bio) {
        bio.complete(status);
        return;
    }

    dispatch_in_chunks(core, bio);
}

/// Both the starting sector and every segment must line up with the crypto
/// sector; nothing smaller can be encrypted independently.
fn check_geometry(core: &CryptCore, bio: &Bio) -> Result<(), IoStatus> {
    let step = (core.sector_size >> SECTOR_SHIFT) as u64;
    if bio.sector % step != 0 || bio.data_len() % core.sector_size != 0 {
        log::warn!(
            "misaligned io at sector {} len {} (sector size {})",
            bio.sector,
            bio.data_len(),
            core.sector_size
        );
        return Err(IoStatus::IoError);
    }
    for seg in &bio.segments {
        if seg.len % core.sector_size != 0 {
            return Err(IoStatus::IoError);
        }
    }
    let end = bio.sector + bio.sectors();
    if core.start + end > core.device.sectors() {
        return Err(IoStatus::IoError);
    }
    Ok(())
}

fn forward_plain(core: &Arc<CryptCore>, mut bio: Bio) {
    bio.sector += core.start;
    let bio = track_forwarded(core, bio);
    let dev = core.clone();
    core.io_queue.spawn(Box::new(move || {
        dev.device.submit(bio);
    }));
}

/// Forwarded descriptors still count toward quiesce, so teardown cannot
/// outrun them.
fn track_forwarded(core: &Arc<CryptCore>, mut bio: Bio) -> Bio {
    core.io_started();
    let fin = core.clone();
    let upstream = bio.take_completion();
    bio.with_completion(Box::new(move |status| {
        if let Some(f) = upstream {
            f(status);
        }
        fin.io_finished();
    }))
}

fn forward_offload(core: &Arc<CryptCore>, mut bio: Bio) {
    let tag = match core.inline_tag() {
        Some(tag) => tag,
        None => {
            bio.complete(IoStatus::IoError);
            return;
        }
    };
    bio.sector += core.start;
    bio.inline_crypt = Some(tag);
    let bio = track_forwarded(core, bio);
    let dev = core.clone();
    core.io_queue.spawn(Box::new(move || {
        dev.device.submit(bio);
    }));
}

/// Carves a descriptor so every piece fits the page pool's maximum run,
/// then dispatches each piece as its own I/O context. The upper completion
/// fires once, with the first failure, after the last piece ends.
fn dispatch_in_chunks(core: &Arc<CryptCore>, mut bio: Bio) {
    let max_bytes = core.pool.max_run_pages() * PAGE_SIZE;
    let needs_split = (bio.op == BioOp::Write || core.on_disk_tag_size > 0)
        && bio.data_len() > max_bytes;
    if !needs_split {
        core.io_started();
        let sector = bio.sector;
        dispatch_io(core, CryptIo::new(bio, sector));
        return;
    }

    let total = bio.data_len();
    let completion = bio.take_completion();
    let nchunks = (total + max_bytes - 1) / max_bytes;
    struct SplitTracker {
        remaining: AtomicUsize,
        status: Mutex<IoStatus>,
        completion: Mutex<Option<crate::backend::bio::BioCompletion>>,
    }
    let tracker = Arc::new(SplitTracker {
        remaining: AtomicUsize::new(nchunks),
        status: Mutex::new(IoStatus::Ok),
        completion: Mutex::new(completion),
    });

    let mut offset = 0usize;
    while offset < total {
        let len = max_bytes.min(total - offset);
        let t = tracker.clone();
        let chunk = slice_bio(&bio, offset, len).with_completion(Box::new(move |status| {
            if !status.is_ok() {
                let mut s = t.status.lock().unwrap();
                if s.is_ok() {
                    *s = status;
                }
            }
            if t.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                if let Some(f) = t.completion.lock().unwrap().take() {
                    f(*t.status.lock().unwrap());
                }
            }
        }));
        core.io_started();
        let sector = chunk.sector;
        dispatch_io(core, CryptIo::new(chunk, sector));
        offset += len;
    }
}

/// A sub-descriptor covering `[offset, offset + len)` of `bio`'s data,
/// sharing its pages.
fn slice_bio(bio: &Bio, offset: usize, len: usize) -> Bio {
    let mut out = Bio::new(bio.op, bio.sector + (offset >> SECTOR_SHIFT) as u64);
    out.nowait = bio.nowait;
    let mut pos = 0usize;
    let mut remaining = len;
    for seg in &bio.segments {
        let seg_end = pos + seg.len;
        if seg_end > offset && remaining > 0 {
            let begin = offset.max(pos) - pos;
            let take = (seg.len - begin).min(remaining);
            out.segments.push(BioVec {
                page: seg.page.clone(),
                offset: seg.offset + begin,
                len: take,
            });
            remaining -= take;
        }
        pos = seg_end;
        if remaining == 0 {
            break;
        }
    }
    out
}

fn dispatch_io(core: &Arc<CryptCore>, io: Arc<CryptIo>) {
    if core.on_disk_tag_size > 0 {
        let sectors = {
            let base = io.base.lock().unwrap();
            base.as_ref().map(|b| b.data_len() / core.sector_size).unwrap_or(0)
        };
        let want = sectors * core.on_disk_tag_size;
        let (buf, from_pool) = core.tag_buf_acquire(want);
        io.integrity_from_pool.store(from_pool, Ordering::SeqCst);
        *io.integrity.lock().unwrap() = Some(buf);
    }
    match io.crypt_dir() {
        CryptDir::Read => kcryptd_io_read(core, &io),
        CryptDir::Write => {
            let core2 = core.clone();
            let io2 = io;
            core.crypt_queue.spawn(Box::new(move || {
                kcryptd_crypt_write_convert(&core2, &io2);
            }));
        }
    }
}

/// Read stage one: clone the descriptor (sharing its pages), remap, and
/// submit to the lower device from the I/O pool. Decryption happens on the
/// crypt pool once the ciphertext is in.
fn kcryptd_io_read(core: &Arc<CryptCore>, io: &Arc<CryptIo>) {
    let mut clone = {
        let base = io.base.lock().unwrap();
        match base.as_ref() {
            Some(base) => base.clone_shallow(),
            None => return,
        }
    };
    clone.sector = core.start + io.sector;
    clone.integrity = io.integrity_buf();
    let endio_core = core.clone();
    let endio_io = io.clone();
    let clone = clone.with_completion(Box::new(move |status| {
        if !status.is_ok() {
            endio_io.latch_error(status);
            endio_io.dec_pending(&endio_core);
            return;
        }
        let core2 = endio_core.clone();
        let io2 = endio_io.clone();
        endio_core.crypt_queue.spawn(Box::new(move || {
            kcryptd_crypt_read_convert(&core2, &io2);
        }));
    }));
    let core2 = core.clone();
    core.io_queue.spawn(Box::new(move || {
        core2.device.submit(clone);
    }));
}

/// Read stage two: decrypt in place on the shared pages.
fn kcryptd_crypt_read_convert(core: &Arc<CryptCore>, io: &Arc<CryptIo>) {
    io.inc_pending();
    {
        let segs = match io.base.lock().unwrap().as_ref().map(|b| b.segments.clone()) {
            Some(segs) => segs,
            None => {
                io.dec_pending(core);
                return;
            }
        };
        *io.ctx.lock().unwrap() =
            Some(ConvertContext::new(segs.clone(), segs, core.iv_offset + io.sector));
    }
    io.crypt_pending.store(1, Ordering::SeqCst);
    let _ = crypt_convert(core, io);
    let finished = io.crypt_pending.fetch_sub(1, Ordering::SeqCst) == 1;
    if finished {
        io.dec_pending(core);
    }
    io.dec_pending(core);
}

/// Write stage one: obtain the ciphertext clone from the page pool, convert
/// into it, and hand it onward when the crypto is done.
pub(crate) fn kcryptd_crypt_write_convert(core: &Arc<CryptCore>, io: &Arc<CryptIo>) {
    io.inc_pending();

    let (total, nowait) = {
        let base = io.base.lock().unwrap();
        match base.as_ref() {
            Some(base) => (base.data_len(), base.nowait),
            None => {
                io.dec_pending(core);
                return;
            }
        }
    };
    let npages = (total + PAGE_SIZE - 1) / PAGE_SIZE;

    let pages = match alloc_clone_pages(core, io, npages, nowait) {
        Some(pages) => pages,
        None => {
            // the re-queue (or the terminal Resource status) was arranged
            io.dec_pending(core);
            return;
        }
    };

    let mut clone = Bio::new(BioOp::Write, core.start + io.sector);
    let mut remaining = total;
    for page in &pages {
        let len = remaining.min(PAGE_SIZE);
        clone.segments.push(BioVec { page: page.clone(), offset: 0, len });
        remaining -= len;
    }
    *io.pages.lock().unwrap() = pages;
    // the clone carries the metadata sideband down to the device
    clone.integrity = io.integrity_buf();

    {
        let in_segs = match io.base.lock().unwrap().as_ref().map(|b| b.segments.clone()) {
            Some(segs) => segs,
            None => {
                io.dec_pending(core);
                return;
            }
        };
        *io.ctx.lock().unwrap() = Some(ConvertContext::new(
            in_segs,
            clone.segments.clone(),
            core.iv_offset + io.sector,
        ));
    }
    *io.write_clone.lock().unwrap() = Some(clone);

    io.crypt_pending.store(1, Ordering::SeqCst);
    let _ = crypt_convert(core, io);
    let finished = io.crypt_pending.fetch_sub(1, Ordering::SeqCst) == 1;
    if finished {
        kcryptd_crypt_write_io_submit(core, io, false);
    }
    io.dec_pending(core);
}

/// Two-phase clone-page allocation with the one-shot no-wait re-queue.
fn alloc_clone_pages(
    core: &Arc<CryptCore>,
    io: &Arc<CryptIo>,
    npages: usize,
    nowait: bool,
) -> Option<Vec<PageBuf>> {
    if let Some(pages) = core.pool.try_alloc(npages) {
        return Some(pages);
    }
    if !nowait {
        return Some(core.pool.alloc_blocking(npages));
    }
    if !io.requeued.swap(true, Ordering::SeqCst) {
        log::debug!("no-wait allocation failed at sector {}, re-queueing once", io.sector);
        let core2 = core.clone();
        let io2 = io.clone();
        io.inc_pending();
        core.crypt_queue.spawn(Box::new(move || {
            kcryptd_crypt_write_convert(&core2, &io2);
            io2.dec_pending(&core2);
        }));
    } else {
        io.latch_error(IoStatus::Resource);
        // no device completion will ever run for this io; drop the base
        // reference here
        io.dec_pending(core);
    }
    None
}

/// Write stage two: pass the finished clone to the sequencer, or submit it
/// directly when offloading is disabled and the crypto completed inline.
pub(crate) fn kcryptd_crypt_write_io_submit(core: &Arc<CryptCore>, io: &Arc<CryptIo>, is_async: bool) {
    let clone = match io.write_clone.lock().unwrap().take() {
        Some(clone) => clone,
        None => return,
    };
    if !io.error().is_ok() {
        // pages go back at end-of-life; just drop the extra reference the
        // device completion will never release
        io.dec_pending(core);
        return;
    }
    let endio_core = core.clone();
    let endio_io = io.clone();
    let clone = clone.with_completion(Box::new(move |status| {
        if !status.is_ok() {
            endio_io.latch_error(status);
        }
        endio_io.dec_pending(&endio_core);
    }));
    if !is_async && core.flags().contains(CryptFlags::NO_OFFLOAD) {
        core.device.submit(clone);
        return;
    }
    let sector = clone.sector;
    core.sequencer.insert(sector, clone);
}
