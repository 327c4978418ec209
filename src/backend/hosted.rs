use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::api::*;
use crate::backend::bio::{Bio, BioOp};

/// An in-memory lower device for hosted runs and tests. Sector data lives in
/// one flat buffer; per-sector integrity metadata lives in a parallel
/// sideband buffer, `tag_bytes` per 512-byte sector. Requests complete
/// inline on the submitting thread.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    meta: Mutex<Vec<u8>>,
    tag_bytes: usize,
    name: String,
    /// Every submission is journaled as (op, sector) so tests can observe
    /// ordering on the wire.
    journal: Mutex<Vec<(BioOp, u64)>>,
    /// Number of upcoming submissions to fail with IoError.
    fail_arm: AtomicUsize,
    /// Submissions that arrived carrying an inline-crypto tag.
    inline_tagged: AtomicUsize,
}

impl MemDevice {
    pub fn new(sectors: u64) -> MemDevice { MemDevice::with_integrity(sectors, 0) }

    pub fn with_integrity(sectors: u64, tag_bytes: usize) -> MemDevice {
        MemDevice {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            meta: Mutex::new(vec![0u8; sectors as usize * tag_bytes]),
            tag_bytes,
            name: format!("memdev{}", sectors),
            journal: Mutex::new(Vec::new()),
            fail_arm: AtomicUsize::new(0),
            inline_tagged: AtomicUsize::new(0),
        }
    }

    /// Raw ciphertext bytes as stored, starting at `sector`.
    pub fn read_raw(&self, sector: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + len].to_vec()
    }

    /// Flips one bit of stored sector data.
    pub fn corrupt_data(&self, byte_index: usize) {
        self.data.lock().unwrap()[byte_index] ^= 0x01;
    }

    /// Flips one bit of the integrity sideband for `sector`, `offset` bytes
    /// into that sector's tag area.
    pub fn corrupt_meta(&self, sector: u64, offset: usize) {
        let idx = sector as usize * self.tag_bytes + offset;
        self.meta.lock().unwrap()[idx] ^= 0x01;
    }

    pub fn meta_snapshot(&self) -> Vec<u8> { self.meta.lock().unwrap().clone() }

    /// Submissions journaled since the last call, oldest first.
    pub fn drain_journal(&self) -> Vec<(BioOp, u64)> {
        std::mem::take(&mut *self.journal.lock().unwrap())
    }

    /// Arms the device to fail the next `n` submissions.
    pub fn fail_next(&self, n: usize) { self.fail_arm.store(n, Ordering::SeqCst); }

    /// How many submissions carried an inline-crypto tag.
    pub fn inline_tagged(&self) -> usize { self.inline_tagged.load(Ordering::SeqCst) }

    fn take_failure(&self) -> bool {
        self.fail_arm
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| if v > 0 { Some(v - 1) } else { None })
            .is_ok()
    }
}

impl BlockDevice for MemDevice {
    fn sectors(&self) -> u64 { (self.data.lock().unwrap().len() / SECTOR_SIZE) as u64 }

    fn integrity_bytes_per_sector(&self) -> usize { self.tag_bytes }

    fn name(&self) -> String { self.name.clone() }

    fn submit(&self, bio: Bio) {
        self.journal.lock().unwrap().push((bio.op, bio.sector));
        if bio.inline_crypt.is_some() {
            self.inline_tagged.fetch_add(1, Ordering::SeqCst);
        }
        if self.take_failure() {
            log::warn!("memdev: injected failure at sector {}", bio.sector);
            bio.complete(IoStatus::IoError);
            return;
        }
        let start = bio.sector as usize * SECTOR_SIZE;
        match bio.op {
            BioOp::Read => {
                {
                    let data = self.data.lock().unwrap();
                    let mut pos = start;
                    for seg in &bio.segments {
                        let mut page = seg.page.lock().unwrap();
                        page[seg.offset..seg.offset + seg.len]
                            .copy_from_slice(&data[pos..pos + seg.len]);
                        pos += seg.len;
                    }
                }
                if self.tag_bytes > 0 {
                    if let Some(ibuf) = bio.integrity.as_ref() {
                        let meta = self.meta.lock().unwrap();
                        let mstart = bio.sector as usize * self.tag_bytes;
                        let mlen = bio.sectors() as usize * self.tag_bytes;
                        ibuf.lock().unwrap()[..mlen].copy_from_slice(&meta[mstart..mstart + mlen]);
                    }
                }
                bio.complete(IoStatus::Ok);
            }
            BioOp::Write => {
                {
                    let mut data = self.data.lock().unwrap();
                    let mut pos = start;
                    for seg in &bio.segments {
                        let page = seg.page.lock().unwrap();
                        data[pos..pos + seg.len].copy_from_slice(&page[seg.offset..seg.offset + seg.len]);
                        pos += seg.len;
                    }
                }
                if self.tag_bytes > 0 {
                    if let Some(ibuf) = bio.integrity.as_ref() {
                        let mut meta = self.meta.lock().unwrap();
                        let mstart = bio.sector as usize * self.tag_bytes;
                        let mlen = bio.sectors() as usize * self.tag_bytes;
                        meta[mstart..mstart + mlen].copy_from_slice(&ibuf.lock().unwrap()[..mlen]);
                    }
                }
                bio.complete(IoStatus::Ok);
            }
            BioOp::Flush => bio.complete(IoStatus::Ok),
            BioOp::Discard => {
                let len = bio.data_len();
                self.data.lock().unwrap()[start..start + len].fill(0);
                bio.complete(IoStatus::Ok);
            }
        }
    }
}
