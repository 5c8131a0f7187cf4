use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;

use super::backend::Backend;
use super::host::GpuContext;

/// A mappable buffer handed out by [`ReadbackPool::try_begin`].
///
/// Copy into [`buffer`](Self::buffer), submit, then pass the slot to
/// [`ReadbackPool::finish`] or [`ReadbackPool::cancel`].
pub struct ReadbackSlot<B: Backend> {
    buffer: B::Buffer,
    size: u64,
}

impl<B: Backend> ReadbackSlot<B> {
    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

struct PoolState<B: Backend> {
    free: HashMap<u64, Vec<B::Buffer>>,
    in_flight: bool,
    /// Buffer whose map is pending, so dispose can abort it.
    mapping: Option<B::Buffer>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    disposed: bool,
    allocated: u64,
    reused: u64,
    discarded: u64,
}

/// Pool of readback buffers with at most one map outstanding.
///
/// Completed buffers go back to a free list keyed by byte size. Once the pool
/// is disposed, a read that resolves late is dropped and its buffer destroyed.
pub struct ReadbackPool<B: Backend> {
    backend: B,
    device: B::Device,
    state: Rc<RefCell<PoolState<B>>>,
}

impl<B: Backend> PoolState<B> {
    fn read_done(&mut self) {
        self.in_flight = false;
        self.mapping = None;
        for tx in self.idle_waiters.drain(..) {
            let _ = tx.send(());
        }
    }
}

impl<B: Backend> Clone for ReadbackPool<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            device: self.device.clone(),
            state: self.state.clone(),
        }
    }
}

impl<B: Backend> ReadbackPool<B> {
    pub fn new(gpu: &GpuContext<B>) -> Self {
        Self {
            backend: gpu.backend.clone(),
            device: gpu.device.clone(),
            state: Rc::new(RefCell::new(PoolState {
                free: HashMap::new(),
                in_flight: false,
                mapping: None,
                idle_waiters: Vec::new(),
                disposed: false,
                allocated: 0,
                reused: 0,
                discarded: 0,
            })),
        }
    }

    /// Hands out a buffer of `size` bytes, or `None` while a read is in flight
    /// or after dispose.
    pub fn try_begin(&self, size: u64) -> Option<ReadbackSlot<B>> {
        let mut st = self.state.borrow_mut();
        if st.disposed || st.in_flight {
            return None;
        }
        st.in_flight = true;

        let pooled = st.free.get_mut(&size).and_then(Vec::pop);
        let buffer = match pooled {
            Some(buffer) => {
                st.reused += 1;
                buffer
            }
            None => {
                st.allocated += 1;
                self.backend.create_readback_buffer(&self.device, size)
            }
        };
        Some(ReadbackSlot { buffer, size })
    }

    /// Maps the slot's buffer on `spawner` and calls `apply` with its contents
    /// when the map resolves, unless the pool was disposed by then.
    pub fn finish(
        &self,
        slot: ReadbackSlot<B>,
        spawner: &LocalSpawner,
        apply: impl FnOnce(&[u8]) + 'static,
    ) {
        let ReadbackSlot { buffer, size } = slot;
        let map = self.backend.map_read(&self.device, &buffer);
        self.state.borrow_mut().mapping = Some(buffer.clone());
        let backend = self.backend.clone();
        let state = self.state.clone();

        let task = async move {
            let result = map.await;

            state.borrow_mut().read_done();
            if state.borrow().disposed {
                backend.destroy_buffer(&buffer);
                state.borrow_mut().discarded += 1;
                log::trace!("readback resolved after dispose; discarded");
                return;
            }

            match result {
                Ok(bytes) => apply(&bytes),
                Err(err) => {
                    log::warn!("readback map failed: {err}");
                    backend.destroy_buffer(&buffer);
                    return;
                }
            }

            let mut st = state.borrow_mut();
            if st.disposed {
                backend.destroy_buffer(&buffer);
            } else {
                st.free.entry(size).or_default().push(buffer);
            }
        };

        if let Err(err) = spawner.spawn_local(task) {
            // The executor is gone; the continuation (and its buffer) went with it.
            log::warn!("cannot schedule readback: {err}");
            let mut st = self.state.borrow_mut();
            if let Some(buffer) = st.mapping.take() {
                self.backend.destroy_buffer(&buffer);
            }
            st.read_done();
        }
    }

    /// Resolves once the read started by [`finish`](Self::finish) has run its
    /// continuation. Resolves immediately when nothing is being mapped.
    ///
    /// The map itself only completes while the driver is polled.
    pub async fn settle(&self) {
        let rx = {
            let mut st = self.state.borrow_mut();
            if st.mapping.is_none() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.idle_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Returns an unused slot to the pool without reading it.
    pub fn cancel(&self, slot: ReadbackSlot<B>) {
        let mut st = self.state.borrow_mut();
        st.in_flight = false;
        if st.disposed {
            self.backend.destroy_buffer(&slot.buffer);
        } else {
            st.free.entry(slot.size).or_default().push(slot.buffer);
        }
    }

    /// Destroys pooled buffers and the buffer of a read still in flight,
    /// which aborts its map. The continuation then resolves as discarded.
    /// Idempotent.
    pub fn dispose(&self) {
        let mut st = self.state.borrow_mut();
        if st.disposed {
            return;
        }
        st.disposed = true;
        if let Some(buffer) = st.mapping.take() {
            self.backend.destroy_buffer(&buffer);
        }
        for (_, buffers) in st.free.drain() {
            for buffer in buffers {
                self.backend.destroy_buffer(&buffer);
            }
        }
    }

    pub fn in_flight(&self) -> bool {
        self.state.borrow().in_flight
    }

    pub fn is_disposed(&self) -> bool {
        self.state.borrow().disposed
    }

    /// Buffers created over the pool's lifetime.
    pub fn allocated(&self) -> u64 {
        self.state.borrow().allocated
    }

    /// Reads served from the free list.
    pub fn reused(&self) -> u64 {
        self.state.borrow().reused
    }

    /// Reads that resolved after dispose and were dropped.
    pub fn discarded(&self) -> u64 {
        self.state.borrow().discarded
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use futures::executor::LocalPool;

    use super::*;
    use crate::device::headless::HeadlessBackend;
    use crate::device::{DeviceHost, DeviceHostOptions};

    fn pool() -> (HeadlessBackend, DeviceHost<HeadlessBackend>, ReadbackPool<HeadlessBackend>) {
        let backend = HeadlessBackend::new();
        let host =
            pollster::block_on(DeviceHost::init(backend.clone(), DeviceHostOptions::default()))
                .unwrap();
        let pool = ReadbackPool::new(host.context());
        (backend, host, pool)
    }

    #[test]
    fn one_read_in_flight_at_a_time() {
        let (_backend, _host, pool) = pool();
        let slot = pool.try_begin(16).unwrap();
        assert!(pool.try_begin(16).is_none());
        pool.cancel(slot);
        assert!(pool.try_begin(16).is_some());
    }

    #[test]
    fn completed_buffer_is_reused() {
        let (backend, _host, pool) = pool();
        let mut exec = LocalPool::new();
        let seen = Rc::new(Cell::new(0u8));

        let slot = pool.try_begin(4).unwrap();
        let sink = seen.clone();
        pool.finish(slot, &exec.spawner(), move |bytes| sink.set(bytes[0]));
        exec.run_until_stalled();
        assert!(pool.in_flight());

        assert_eq!(backend.complete_reads(&[9, 0, 0, 0]), 1);
        exec.run_until_stalled();
        assert_eq!(seen.get(), 9);
        assert!(!pool.in_flight());

        let again = pool.try_begin(4).unwrap();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.reused(), 1);
        pool.cancel(again);
        assert_eq!(backend.buffers_created(), 1);
    }

    #[test]
    fn free_list_is_keyed_by_size() {
        let (_backend, _host, pool) = pool();
        let slot = pool.try_begin(4).unwrap();
        pool.cancel(slot);
        let other = pool.try_begin(8).unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.reused(), 0);
        pool.cancel(other);
    }

    #[test]
    fn late_read_after_dispose_is_discarded() {
        let (backend, _host, pool) = pool();
        let mut exec = LocalPool::new();
        let applied = Rc::new(Cell::new(false));

        let slot = pool.try_begin(4).unwrap();
        let flag = applied.clone();
        pool.finish(slot, &exec.spawner(), move |_| flag.set(true));
        exec.run_until_stalled();

        pool.dispose();
        assert!(pool.try_begin(4).is_none());
        assert_eq!(backend.live_buffers(), 0);

        assert_eq!(backend.complete_reads(&[1, 2, 3, 4]), 0);
        exec.run_until_stalled();

        assert!(!applied.get());
        assert_eq!(pool.discarded(), 1);
        assert!(!pool.in_flight());
    }

    #[test]
    fn settle_waits_for_the_continuation() {
        let (backend, _host, pool) = pool();
        let mut exec = LocalPool::new();
        let applied = Rc::new(Cell::new(false));
        let settled = Rc::new(Cell::new(false));

        pollster::block_on(pool.settle());

        let slot = pool.try_begin(4).unwrap();
        let flag = applied.clone();
        pool.finish(slot, &exec.spawner(), move |_| flag.set(true));
        let p = pool.clone();
        let done = settled.clone();
        exec.spawner()
            .spawn_local(async move {
                p.settle().await;
                done.set(true);
            })
            .unwrap();
        exec.run_until_stalled();
        assert!(!settled.get());

        backend.complete_reads(&[0; 4]);
        exec.run_until_stalled();
        assert!(applied.get());
        assert!(settled.get());
    }

    #[test]
    fn dispose_aborts_a_read_that_never_completes() {
        let (backend, mut host, pool) = pool();
        let mut exec = LocalPool::new();

        let slot = pool.try_begin(16).unwrap();
        pool.finish(slot, &exec.spawner(), |_| panic!("read should not apply"));
        exec.run_until_stalled();
        assert_eq!(backend.pending_reads(), 1);

        pool.dispose();
        host.dispose();
        exec.run_until_stalled();

        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.pending_reads(), 0);
        assert_eq!(pool.discarded(), 1);
    }

    #[test]
    fn dispose_destroys_pooled_buffers() {
        let (backend, _host, pool) = pool();
        for size in [4, 8] {
            let slot = pool.try_begin(size).unwrap();
            pool.cancel(slot);
        }
        assert_eq!(backend.live_buffers(), 2);
        pool.dispose();
        pool.dispose();
        assert_eq!(backend.live_buffers(), 0);
    }
}
