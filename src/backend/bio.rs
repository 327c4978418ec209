use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::api::*;

/// One pool page. Pages are shared between a descriptor and its clones, so
/// they sit behind a lock; the converter holds it only for the duration of
/// one sector's crypto.
pub type PageBuf = Arc<Mutex<Box<[u8]>>>;

pub fn alloc_page() -> PageBuf {
    Arc::new(Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
    /// Cache flush; carries no data.
    Flush,
    /// Deallocation hint; carries an extent but no data.
    Discard,
}

/// One run of bytes within a page.
#[derive(Clone)]
pub struct BioVec {
    pub page: PageBuf,
    pub offset: usize,
    pub len: usize,
}

/// Inline-crypto tag for device-offloaded mappings. The lower device performs
/// the cipher work itself; the mapping only remaps sectors and attaches this.
pub struct InlineCryptTag {
    /// Crypto-API name of the cipher the device must run.
    pub cipher: String,
    pub key: Zeroizing<Vec<u8>>,
    /// Added to the logical sector before the device derives its IV.
    pub iv_offset: u64,
}

pub type BioCompletion = Box<dyn FnOnce(IoStatus) + Send + 'static>;

/// An I/O descriptor. Sector numbers are in 512-byte units. Completion fires
/// exactly once, from whatever thread finishes the descriptor.
pub struct Bio {
    pub op: BioOp,
    pub sector: u64,
    pub segments: Vec<BioVec>,
    /// Byte extent for segment-less ops (Discard).
    pub raw_len: usize,
    /// Sideband integrity metadata travelling with the descriptor.
    pub integrity: Option<Arc<Mutex<Vec<u8>>>>,
    /// Fail fast instead of blocking on allocation.
    pub nowait: bool,
    pub inline_crypt: Option<Arc<InlineCryptTag>>,
    completion: Option<BioCompletion>,
}

impl Bio {
    pub fn new(op: BioOp, sector: u64) -> Bio {
        Bio {
            op,
            sector,
            segments: Vec::new(),
            raw_len: 0,
            integrity: None,
            nowait: false,
            inline_crypt: None,
            completion: None,
        }
    }

    /// Builds a descriptor whose pages are freshly allocated copies of `data`.
    /// Reads pass a zero-filled `data` of the right length.
    pub fn with_data(op: BioOp, sector: u64, data: &[u8]) -> Bio {
        let mut bio = Bio::new(op, sector);
        for chunk in data.chunks(PAGE_SIZE) {
            let page = alloc_page();
            page.lock().unwrap()[..chunk.len()].copy_from_slice(chunk);
            bio.segments.push(BioVec { page, offset: 0, len: chunk.len() });
        }
        bio
    }

    pub fn with_completion(mut self, f: BioCompletion) -> Bio {
        self.completion = Some(f);
        self
    }

    pub fn data_len(&self) -> usize {
        if self.segments.is_empty() {
            self.raw_len
        } else {
            self.segments.iter().map(|v| v.len).sum()
        }
    }

    /// Length in 512-byte sectors.
    pub fn sectors(&self) -> u64 { (self.data_len() >> SECTOR_SHIFT) as u64 }

    pub fn has_data(&self) -> bool { !self.segments.is_empty() }

    /// Copies the descriptor's bytes out into one contiguous buffer.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_len());
        for seg in &self.segments {
            let page = seg.page.lock().unwrap();
            out.extend_from_slice(&page[seg.offset..seg.offset + seg.len]);
        }
        out
    }

    /// Overwrites the descriptor's bytes from one contiguous buffer.
    /// `data` must be exactly `data_len()` bytes.
    pub fn copy_from_slice(&self, data: &[u8]) {
        assert!(data.len() == self.data_len(), "bio fill length mismatch");
        let mut pos = 0;
        for seg in &self.segments {
            let mut page = seg.page.lock().unwrap();
            page[seg.offset..seg.offset + seg.len].copy_from_slice(&data[pos..pos + seg.len]);
            pos += seg.len;
        }
    }

    /// A clone sharing this descriptor's pages. Carries no completion; the
    /// caller wires its own.
    pub fn clone_shallow(&self) -> Bio {
        Bio {
            op: self.op,
            sector: self.sector,
            segments: self.segments.clone(),
            raw_len: self.raw_len,
            integrity: self.integrity.clone(),
            nowait: self.nowait,
            inline_crypt: self.inline_crypt.clone(),
            completion: None,
        }
    }

    pub fn take_completion(&mut self) -> Option<BioCompletion> { self.completion.take() }

    /// Terminates the descriptor. A descriptor without a completion is legal
    /// (clones submitted to the lower device often don't need one).
    pub fn complete(mut self, status: IoStatus) {
        if let Some(f) = self.completion.take() {
            f(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn data_roundtrip_through_pages() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let bio = Bio::with_data(BioOp::Write, 4, &data);
        assert_eq!(bio.segments.len(), 2);
        assert_eq!(bio.data_len(), 8192);
        assert_eq!(bio.sectors(), 16);
        assert_eq!(bio.copy_to_vec(), data);
    }

    #[test]
    fn completion_fires_once_with_status() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let bio = Bio::new(BioOp::Flush, 0).with_completion(Box::new(move |status| {
            assert_eq!(status, IoStatus::Protection);
            f.store(true, Ordering::SeqCst);
        }));
        bio.complete(IoStatus::Protection);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn shallow_clone_shares_pages() {
        let bio = Bio::with_data(BioOp::Read, 0, &[0u8; 512]);
        let clone = bio.clone_shallow();
        clone.copy_from_slice(&[0xa5u8; 512]);
        assert_eq!(bio.copy_to_vec(), vec![0xa5u8; 512]);
    }
}
