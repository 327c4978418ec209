use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::api::DeviceHandle;
use crate::backend::bio::Bio;

struct SeqInner {
    /// Completed write clones keyed by target sector. Duplicate sectors are
    /// legal (two upper I/Os to the same block); they drain in insert order.
    tree: Mutex<BTreeMap<u64, Vec<Bio>>>,
    kicked: Condvar,
    stop: AtomicBool,
    paused: AtomicBool,
    device: DeviceHandle,
}

/// The dedicated write-drain thread.
///
/// Asynchronous crypto completions land write clones here out of order. The
/// drain thread atomically swaps the live tree for an empty one, then walks
/// the stolen tree in ascending-sector order and submits each clone to the
/// lower device in one batched region. The walk only ever takes the minimum
/// and frees the node as the clone goes out; submission may release the
/// enclosing I/O context, so neighbor iteration is off the table.
pub(crate) struct WriteSequencer {
    inner: Arc<SeqInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriteSequencer {
    pub fn start(device: DeviceHandle) -> WriteSequencer {
        let inner = Arc::new(SeqInner {
            tree: Mutex::new(BTreeMap::new()),
            kicked: Condvar::new(),
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            device,
        });
        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("crypt-write".to_string())
            .spawn(move || drain_loop(thread_inner))
            .expect("couldn't spawn write sequencer");
        WriteSequencer { inner, thread: Mutex::new(Some(thread)) }
    }

    /// Hands a completed write clone to the drain thread. Held briefly: the
    /// lock covers only the insert, never a submission.
    pub fn insert(&self, sector: u64, clone: Bio) {
        self.inner.tree.lock().unwrap().entry(sector).or_insert_with(Vec::new).push(clone);
        self.inner.kicked.notify_one();
    }

    /// Quiesces the drain thread; inserts still accumulate.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.kicked.notify_one();
    }

    /// Clones waiting in the live tree.
    pub fn pending(&self) -> usize {
        self.inner.tree.lock().unwrap().values().map(|v| v.len()).sum()
    }

    /// Stops the thread after a final drain of everything queued.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.kicked.notify_one();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteSequencer {
    fn drop(&mut self) { self.stop(); }
}

fn drain_loop(inner: Arc<SeqInner>) {
    loop {
        let mut stolen = {
            let mut tree = inner.tree.lock().unwrap();
            while (tree.is_empty() || inner.paused.load(Ordering::SeqCst))
                && !inner.stop.load(Ordering::SeqCst)
            {
                tree = inner.kicked.wait(tree).unwrap();
            }
            if tree.is_empty() {
                // stop requested and nothing left
                return;
            }
            // Swap the live tree out; later inserts build a fresh one while
            // this drain walks its private copy lock-free.
            std::mem::take(&mut *tree)
        };
        log::trace!("write drain: {} sectors", stolen.len());
        while let Some(&sector) = stolen.keys().next() {
            let clones = stolen.remove(&sector).unwrap();
            for clone in clones {
                inner.device.submit(clone);
            }
        }
        if inner.stop.load(Ordering::SeqCst) && inner.tree.lock().unwrap().is_empty() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bio::BioOp;
    use crate::backend::hosted::MemDevice;
    use std::time::Duration;

    #[test]
    fn drains_in_ascending_sector_order() {
        let dev = Arc::new(MemDevice::new(64));
        let seq = WriteSequencer::start(dev.clone());
        seq.pause();
        for sector in [17u64, 2, 9, 33, 5] {
            seq.insert(sector, Bio::with_data(BioOp::Write, sector, &[0u8; 512]));
        }
        assert_eq!(seq.pending(), 5);
        seq.resume();
        while seq.pending() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        seq.stop();
        let order: Vec<u64> = dev.drain_journal().into_iter().map(|(_, s)| s).collect();
        assert_eq!(order, vec![2, 5, 9, 17, 33]);
    }

    #[test]
    fn stop_performs_final_drain() {
        let dev = Arc::new(MemDevice::new(64));
        let seq = WriteSequencer::start(dev.clone());
        seq.pause();
        seq.insert(7, Bio::with_data(BioOp::Write, 7, &[0u8; 512]));
        seq.insert(3, Bio::with_data(BioOp::Write, 3, &[0u8; 512]));
        seq.stop();
        let order: Vec<u64> = dev.drain_journal().into_iter().map(|(_, s)| s).collect();
        assert_eq!(order, vec![3, 7]);
    }

    #[test]
    fn duplicate_sectors_all_submit() {
        let dev = Arc::new(MemDevice::new(64));
        let seq = WriteSequencer::start(dev.clone());
        seq.pause();
        seq.insert(4, Bio::with_data(BioOp::Write, 4, &[1u8; 512]));
        seq.insert(4, Bio::with_data(BioOp::Write, 4, &[2u8; 512]));
        seq.stop();
        assert_eq!(dev.drain_journal().len(), 2);
    }
}
