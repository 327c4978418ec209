use std::sync::Arc;

use crate::api::*;
use crate::backend::bio::BioVec;
use crate::backend::engine::{CompletionHandle, CryptEvent, EngineStatus, SectorCipher};
use crate::backend::iv::CryptDir;
use crate::backend::mapping::CryptCore;
use crate::backend::request::{assemble, CryptRequest, SgSpan};
use crate::backend::stage::CryptIo;

/// Walks a descriptor's segments in sector-size steps. Segment lengths are
/// multiples of the sector size (the assembler rejects anything else), so a
/// span never straddles segments.
pub(crate) struct SegWalk {
    segs: Vec<BioVec>,
    seg: usize,
    off: usize,
}

impl SegWalk {
    pub fn new(segs: Vec<BioVec>) -> SegWalk { SegWalk { segs, seg: 0, off: 0 } }

    pub fn next_span(&mut self, len: usize) -> Option<SgSpan> {
        while self.seg < self.segs.len() {
            let seg = &self.segs[self.seg];
            if self.off < seg.len {
                let span =
                    SgSpan { page: seg.page.clone(), offset: seg.offset + self.off, len };
                self.off += len;
                return Some(span);
            }
            self.seg += 1;
            self.off = 0;
        }
        None
    }
}

/// The conversion cursor for one I/O: input and output iterators plus the
/// current crypto sector and tag slot.
pub(crate) struct ConvertContext {
    pub input: SegWalk,
    pub output: SegWalk,
    pub cc_sector: u64,
    pub tag_index: usize,
}

impl ConvertContext {
    pub fn new(input: Vec<BioVec>, output: Vec<BioVec>, cc_sector: u64) -> ConvertContext {
        ConvertContext { input: SegWalk::new(input), output: SegWalk::new(output), cc_sector, tag_index: 0 }
    }
}

/// Builds the completion handle asynchronous engines call back through.
/// `Restart` wakes a converter parked on a backlogged submission; `Finished`
/// latches errors, runs IV post-processing, and drops the crypto reference,
/// dispatching the I/O if it was the last one.
pub(crate) fn completion_handle(core: &Arc<CryptCore>, io: &Arc<CryptIo>) -> CompletionHandle {
    let core = core.clone();
    let io = io.clone();
    Arc::new(move |event: CryptEvent, req: &mut CryptRequest| match event {
        CryptEvent::Restart => io.signal_restart(),
        CryptEvent::Finished(result) => {
            match result {
                Ok(()) => {
                    let iv_len = req.iv_len;
                    let iv_sector = req.iv_sector;
                    let dir = req.dir;
                    let dst = req.dst.clone();
                    let post =
                        dst.with_mut(|data| core.ivgen.post(&mut req.iv[..iv_len], iv_sector, dir, data));
                    if post.is_err() {
                        io.latch_error(IoStatus::IoError);
                    }
                }
                Err(EngineError::BadTag) => {
                    core.log_integrity_failure(req.cc_sector);
                    io.latch_error(IoStatus::Protection);
                }
                Err(e) => {
                    log::error!("crypt engine failed at sector {}: {}", req.cc_sector, e);
                    io.latch_error(IoStatus::IoError);
                }
            }
            io.crypt_dec_and_dispatch(&core, false);
        }
    })
}

/// Drives one I/O's conversion context through its extent, one crypto sector
/// at a time. The caller holds one crypto reference; every submission takes
/// another, so the context cannot complete out from under the loop.
///
/// Returns `Err` only on a fatal inline failure; asynchronous failures latch
/// on the I/O and surface at completion.
pub(crate) fn crypt_convert(core: &Arc<CryptCore>, io: &Arc<CryptIo>) -> Result<(), IoStatus> {
    let dir = io.crypt_dir();
    let sector_bytes = core.sector_size;
    let sector_step = (core.sector_size >> SECTOR_SHIFT) as u64;
    let done = completion_handle(core, io);

    loop {
        // Advance the cursor under its lock; the crypto itself runs outside.
        let staged = {
            let mut guard = io.ctx.lock().unwrap();
            let ctx = match guard.as_mut() {
                Some(ctx) => ctx,
                None => break,
            };
            match ctx.input.next_span(sector_bytes) {
                Some(src) => {
                    let dst = match ctx.output.next_span(sector_bytes) {
                        Some(dst) => dst,
                        None => src.clone(),
                    };
                    let staged = (src, dst, ctx.cc_sector, ctx.tag_index);
                    ctx.cc_sector += sector_step;
                    ctx.tag_index += 1;
                    Some(staged)
                }
                None => None,
            }
        };
        let (src, dst, cc_sector, tag_index) = match staged {
            Some(s) => s,
            None => break,
        };

        io.crypt_inc();
        let (mut req, engine_index) =
            match assemble(core, dir, cc_sector, src, dst, tag_index, io.integrity_buf()) {
                Ok(built) => built,
                Err(e) => {
                    log::error!("request assembly failed at sector {}: {}", cc_sector, e);
                    io.crypt_dec_quiet();
                    io.latch_error(IoStatus::IoError);
                    return Err(IoStatus::IoError);
                }
            };

        let status = core.engine(engine_index).process(&mut req, &done);
        match status {
            EngineStatus::Ok => {
                // Completed inline: post-process, drop the reference, and
                // yield so a long extent cannot monopolize the worker.
                let iv_len = req.iv_len;
                let post = req.dst.clone().with_mut(|data| {
                    core.ivgen.post(&mut req.iv[..iv_len], req.iv_sector, dir, data)
                });
                if post.is_err() {
                    io.crypt_dec_quiet();
                    io.latch_error(IoStatus::IoError);
                    return Err(IoStatus::IoError);
                }
                io.crypt_dec_quiet();
                std::thread::yield_now();
            }
            EngineStatus::Async => {
                // The engine owns its copy of the request now; its completion
                // will drop the reference we just took.
            }
            EngineStatus::Busy => {
                // The driver queued the request but its input queue was full.
                // Wait for the restart signal, then treat it as in-flight.
                io.wait_restart();
            }
            EngineStatus::Error(EngineError::BadTag) => {
                core.log_integrity_failure(cc_sector);
                io.crypt_dec_quiet();
                io.latch_error(IoStatus::Protection);
                return Err(IoStatus::Protection);
            }
            EngineStatus::Error(e) => {
                log::error!("crypt engine failed at sector {}: {}", cc_sector, e);
                io.crypt_dec_quiet();
                io.latch_error(IoStatus::IoError);
                return Err(IoStatus::IoError);
            }
        }
    }
    Ok(())
}
