use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::api::*;
use crate::backend::bio::PageBuf;
use crate::backend::iv::CryptDir;
use crate::backend::mapping::CryptCore;

/// One run of bytes within a page, the unit a cipher engine addresses.
#[derive(Clone)]
pub(crate) struct SgSpan {
    pub page: PageBuf,
    pub offset: usize,
    pub len: usize,
}

impl SgSpan {
    pub fn copy_out(&self) -> Zeroizing<Vec<u8>> {
        let page = self.page.lock().unwrap();
        Zeroizing::new(page[self.offset..self.offset + self.len].to_vec())
    }

    pub fn copy_in(&self, data: &[u8]) {
        let mut page = self.page.lock().unwrap();
        page[self.offset..self.offset + self.len].copy_from_slice(data);
    }

    /// Runs `f` over the span's bytes in place.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut page = self.page.lock().unwrap();
        f(&mut page[self.offset..self.offset + self.len])
    }
}

/// The per-sector crypto request. One owned record replaces the original's
/// hand-computed composite allocation: the working IV, the original IV (the
/// engine mutates its working copy, AEAD authenticates the original), the
/// little-endian sector word, and the tag slot index all live here behind
/// typed accessors.
#[derive(Clone)]
pub(crate) struct CryptRequest {
    pub dir: CryptDir,
    pub cc_sector: u64,
    pub iv_sector: u64,
    pub iv: [u8; MAX_IV_SIZE],
    pub org_iv: [u8; MAX_IV_SIZE],
    pub iv_len: usize,
    pub sector_le: [u8; 8],
    pub src: SgSpan,
    pub dst: SgSpan,
    /// The I/O's integrity-metadata buffer; tags and stored IVs land at
    /// `tag_offset` within it.
    pub tag_buf: Option<Arc<Mutex<Vec<u8>>>>,
    pub tag_offset: usize,
    pub tag_size: usize,
}

impl CryptRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: CryptDir,
        cc_sector: u64,
        iv_sector: u64,
        src: SgSpan,
        dst: SgSpan,
        tag_buf: Option<Arc<Mutex<Vec<u8>>>>,
        tag_offset: usize,
        tag_size: usize,
    ) -> CryptRequest {
        CryptRequest {
            dir,
            cc_sector,
            iv_sector,
            iv: [0u8; MAX_IV_SIZE],
            org_iv: [0u8; MAX_IV_SIZE],
            iv_len: 0,
            sector_le: iv_sector.to_le_bytes(),
            src,
            dst,
            tag_buf,
            tag_offset,
            tag_size,
        }
    }

    /// Copies the input sector out for the engine to transform. The scratch
    /// wipes on drop.
    pub fn data_scratch(&self) -> Zeroizing<Vec<u8>> { self.src.copy_out() }

    /// Writes the transformed sector to the output span.
    pub fn store_data(&self, data: &[u8]) { self.dst.copy_in(data) }

    /// Output bytes as written; test convenience.
    #[cfg(test)]
    pub fn read_back(&self) -> Vec<u8> { self.dst.copy_out().to_vec() }

    pub fn store_tag(&self, tag: &[u8]) {
        if let Some(buf) = self.tag_buf.as_ref() {
            let mut buf = buf.lock().unwrap();
            buf[self.tag_offset..self.tag_offset + tag.len()].copy_from_slice(tag);
        }
    }

    pub fn load_tag(&self) -> Vec<u8> {
        match self.tag_buf.as_ref() {
            Some(buf) => {
                let buf = buf.lock().unwrap();
                buf[self.tag_offset..self.tag_offset + self.tag_size].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Stores the working IV behind the auth tag in the metadata slot, so
    /// the matching read can recover it.
    pub fn store_iv_meta(&self, iv_len: usize) {
        if let Some(buf) = self.tag_buf.as_ref() {
            let mut buf = buf.lock().unwrap();
            let at = self.tag_offset + self.tag_size;
            buf[at..at + iv_len].copy_from_slice(&self.iv[..iv_len]);
        }
    }

    pub fn load_iv_meta(&self, iv_len: usize) -> Option<Vec<u8>> {
        self.tag_buf.as_ref().map(|buf| {
            let buf = buf.lock().unwrap();
            let at = self.tag_offset + self.tag_size;
            buf[at..at + iv_len].to_vec()
        })
    }
}

/// Lays out one sector's request: picks the engine, derives the IV sector,
/// fills (or recovers) the IV, and stages the metadata slot.
///
/// Returns the request and the index of the engine that must run it.
pub(crate) fn assemble(
    core: &CryptCore,
    dir: CryptDir,
    cc_sector: u64,
    src: SgSpan,
    dst: SgSpan,
    tag_index: usize,
    tag_buf: Option<Arc<Mutex<Vec<u8>>>>,
) -> Result<(CryptRequest, usize), EngineError> {
    // Engine selection keys off the raw crypto sector; the large-sector
    // shift below only narrows what the IV generator sees.
    let engine_index = (cc_sector & (core.tfms_count as u64 - 1)) as usize;
    let iv_sector = if core.flags().contains(CryptFlags::IV_LARGE_SECTORS) {
        cc_sector >> core.sector_shift
    } else {
        cc_sector
    };
    let iv_len = core.iv_size;
    let tag_offset = tag_index * core.on_disk_tag_size;

    let mut req = CryptRequest::new(
        dir,
        cc_sector,
        iv_sector,
        src,
        dst,
        tag_buf,
        tag_offset,
        core.integrity_tag_size,
    );
    req.iv_len = iv_len;

    if dir == CryptDir::Read && core.integrity_iv_size > 0 {
        // The IV was stored alongside the tag at write time; recover it
        // instead of generating. This is what lets the random mode survive
        // a round trip.
        let stored = req
            .load_iv_meta(core.integrity_iv_size)
            .ok_or(EngineError::Failed("stored IV without metadata buffer"))?;
        req.iv[..iv_len].copy_from_slice(&stored[..iv_len]);
    } else {
        req.src.clone().with_mut(|data| {
            core.ivgen.generate(&mut req.iv[..iv_len], iv_sector, dir, data)
        })?;
    }
    req.org_iv[..iv_len].copy_from_slice(&req.iv[..iv_len]);

    if dir == CryptDir::Write && core.integrity_iv_size > 0 {
        req.store_iv_meta(core.integrity_iv_size);
    }
    Ok((req, engine_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bio::alloc_page;

    fn span(len: usize, fill: u8) -> SgSpan {
        let page = alloc_page();
        page.lock().unwrap()[..len].fill(fill);
        SgSpan { page, offset: 0, len }
    }

    #[test]
    fn tag_slots_are_indexed_runs() {
        let buf = Arc::new(Mutex::new(vec![0u8; 64]));
        // second sector of an io with 32-byte on-disk tags, 16-byte auth tag
        let mut req = CryptRequest::new(
            CryptDir::Write,
            1,
            1,
            span(512, 0),
            span(512, 0),
            Some(buf.clone()),
            32,
            16,
        );
        req.store_tag(&[0xeeu8; 16]);
        req.iv[..16].copy_from_slice(&[0x44u8; 16]);
        req.store_iv_meta(16);
        let snap = buf.lock().unwrap().clone();
        assert!(snap[..32].iter().all(|&b| b == 0));
        assert_eq!(&snap[32..48], &[0xeeu8; 16]);
        assert_eq!(&snap[48..64], &[0x44u8; 16]);
        assert_eq!(req.load_tag(), vec![0xeeu8; 16]);
    }

    #[test]
    fn scratch_roundtrip_between_spans() {
        let src = span(512, 0x21);
        let dst = span(512, 0);
        let req =
            CryptRequest::new(CryptDir::Write, 0, 0, src, dst.clone(), None, 0, 0);
        let mut data = req.data_scratch();
        for b in data.iter_mut() {
            *b ^= 0xff;
        }
        req.store_data(&data);
        assert_eq!(dst.copy_out().to_vec(), vec![0x21 ^ 0xff; 512]);
    }
}
