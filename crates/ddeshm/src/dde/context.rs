//! Per-process DDE context: registry membership, lifecycle and reaping.

use super::handle::SegmentCache;
use super::main_block::{HandleSlot, MainBlock, MainBlockData, ProcessEntry};
use super::{DdeMessage, MAX_PROCS, MessageStats, ProcessInfo, Snapshot, WindowInfo};
use super::window::remote_handle;
use crate::config::DdeConfig;
use crate::error::{Error, Result};
use crate::ipc::{MsgQueue, RwSem, Segment, Wakeup, process_alive};
use ddeshm_log::{debug, error, info, warn};
use ddeshm_mem::{Arena, ArenaStorage, AtomTable};
use fxhash::FxBuildHasher;
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// Longest owned-segment chain walked while reaping.
const MAX_CHAIN: usize = 4096;

/// Callback servicing inbound messages. Its return value is carried back
/// to a synchronous sender.
pub(crate) type Handler = Rc<dyn Fn(&mut DdeContext, &DdeMessage) -> i64>;

/// This process' registry entry.
#[derive(Debug)]
pub(crate) struct Registration {
    pub index: usize,
    pub queue: MsgQueue,
    pub sem: RwSem,
    /// Owned arena segments, newest first.
    pub segments: Vec<i32>,
}

/// An ACK waiting to be sent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeferredAck {
    pub queue: MsgQueue,
    pub pid: i32,
    pub packet: crate::ipc::Packet,
}

/// A process' view of the shared DDE state.
///
/// The process registers itself lazily, on the first operation that needs
/// a queue or owned memory. Dropping the context unregisters the process
/// and, if it was the last one attached, destroys the main block.
pub struct DdeContext {
    pub(crate) config: DdeConfig,
    pub(crate) main: MainBlock,
    pub(crate) atoms: AtomTable<ArenaStorage>,
    pub(crate) wakeup: Arc<Wakeup>,
    pub(crate) registration: Option<Registration>,
    pub(crate) segments: RefCell<SegmentCache>,
    pub(crate) handler: Option<Handler>,
    pub(crate) deferred: VecDeque<DeferredAck>,
    pub(crate) outstanding: HashSet<u32, FxBuildHasher>,
    pub(crate) arrived: HashMap<u32, i64, FxBuildHasher>,
    pub(crate) next_seq: u32,
    pub(crate) depth: u32,
    pub(crate) stats: MessageStats,
    detached: bool,
}

impl std::fmt::Debug for DdeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdeContext")
            .field("main", &self.main)
            .field("registration", &self.registration)
            .field("depth", &self.depth)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Opens the main block and its atom table.
fn open_main(config: &DdeConfig) -> Result<(MainBlock, AtomTable<ArenaStorage>)> {
    let main = MainBlock::open(config)?;
    let atoms = {
        let data = main.read()?;
        let desc = data.atoms.get().ok_or(Error::BadMainBlock {
            reason: "atom table missing",
        })?;
        AtomTable::attach(main.storage(), desc)?
    };
    Ok((main, atoms))
}

pub(crate) fn current_pid() -> i32 {
    std::process::id() as i32
}

impl DdeContext {
    /// Attaches (or builds) the main block described by `config`.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, when no key in the range is usable,
    /// or when an IPC call fails.
    pub fn attach(config: DdeConfig) -> Result<Self> {
        config.validate()?;
        ddeshm_log::set_level_from_str(&config.log_level).map_err(Error::Config)?;
        let (main, atoms) = open_main(&config)?;
        let wakeup = Wakeup::acquire()?;

        Ok(DdeContext {
            config,
            main,
            atoms,
            wakeup,
            registration: None,
            segments: RefCell::new(SegmentCache::new()?),
            handler: None,
            deferred: VecDeque::new(),
            outstanding: HashSet::default(),
            arrived: HashMap::default(),
            next_seq: 1,
            depth: 0,
            stats: MessageStats::default(),
            detached: false,
        })
    }

    /// Loads the configuration from `path` (or defaults) and attaches.
    ///
    /// # Errors
    ///
    /// As [`DdeConfig::load`] and [`DdeContext::attach`].
    pub fn from_config_file(path: Option<&std::path::Path>) -> Result<Self> {
        Self::attach(DdeConfig::load(path)?)
    }

    /// Settings this context was attached with.
    #[must_use]
    pub fn config(&self) -> &DdeConfig {
        &self.config
    }

    /// Registry slot of this process, once registered.
    #[must_use]
    pub fn process_index(&self) -> Option<usize> {
        self.registration.as_ref().map(|r| r.index)
    }

    /// Message counters.
    #[must_use]
    pub fn stats(&self) -> MessageStats {
        self.stats
    }

    /// Installs the callback servicing inbound messages.
    pub fn set_handler(&mut self, handler: impl Fn(&mut DdeContext, &DdeMessage) -> i64 + 'static) {
        self.handler = Some(Rc::new(handler));
    }

    /// Removes the handler; inbound messages are then acknowledged with 0.
    pub fn clear_handler(&mut self) {
        self.handler = None;
    }

    /// Claims a registry slot for this process if it has none yet.
    ///
    /// Stale entries of dead processes are reaped on the way.
    pub(crate) fn ensure_registered(&mut self) -> Result<usize> {
        if let Some(registration) = &self.registration {
            return Ok(registration.index);
        }

        let queue = MsgQueue::create()?;
        let sem = match RwSem::create() {
            Ok(sem) => sem,
            Err(e) => {
                let _ = queue.remove();
                return Err(e);
            }
        };
        let pid = current_pid();

        let claimed = self.main.write().and_then(|mut data| {
            let mut cache = self.segments.borrow_mut();
            for idx in 0..MAX_PROCS {
                let entry = data.procs[idx];
                if !entry.is_vacant() && !process_alive(entry.pid) {
                    reap_entry(&mut data, idx, &mut cache);
                    self.stats.stale_reaped += 1;
                }
            }
            let idx = data
                .procs
                .iter()
                .position(ProcessEntry::is_vacant)
                .ok_or(Error::ResourceExhausted {
                    what: "process slots",
                })?;
            data.procs[idx] = ProcessEntry::new(pid, queue.id(), sem.id());
            Ok(idx)
        });

        match claimed {
            Ok(index) => {
                info!("registered as process {index} (queue {}, semaphore {})", queue.id(), sem.id());
                self.registration = Some(Registration {
                    index,
                    queue,
                    sem,
                    segments: Vec::new(),
                });
                Ok(index)
            }
            Err(e) => {
                warn!("registration failed: {e}");
                let _ = queue.remove();
                let _ = sem.remove();
                Err(e)
            }
        }
    }

    /// Tears down a peer entry after its liveness probe failed.
    pub(crate) fn reap_peer(&mut self, index: usize, pid: i32) -> Result<()> {
        let mut data = self.main.write()?;
        if data.procs[index].pid == pid && !process_alive(pid) {
            reap_entry(&mut data, index, &mut self.segments.borrow_mut());
            self.stats.stale_reaped += 1;
        }
        Ok(())
    }

    /// Releases this process' entry: queue, semaphore, owned segments,
    /// windows and handles.
    pub(crate) fn release_process(&mut self) -> Result<()> {
        let Some(registration) = self.registration.take() else {
            return Ok(());
        };
        self.deferred.clear();
        let mut data = self.main.write()?;
        reap_entry(&mut data, registration.index, &mut self.segments.borrow_mut());
        info!("released process {}", registration.index);
        Ok(())
    }

    /// Destroys the main block if no other process is attached, then opens
    /// a fresh one so the context stays usable. Returns whether the block
    /// was destroyed.
    pub(crate) fn recycle_main_block(&mut self) -> Result<bool> {
        if !self.main.destroy_if_last()? {
            return Ok(false);
        }
        self.segments.borrow_mut().clear();
        let (main, atoms) = open_main(&self.config)?;
        // The atom table points into the old block; swap it out first.
        self.atoms = atoms;
        self.main = main;
        info!("main block recycled (segment {})", self.main.segment_id());
        Ok(true)
    }

    /// Reaps every registered process that no longer exists. Returns the
    /// number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] if the main lock fails.
    pub fn reap_stale(&mut self) -> Result<usize> {
        let mut data = self.main.write()?;
        let mut cache = self.segments.borrow_mut();
        let mut reaped = 0;
        for idx in 0..MAX_PROCS {
            let entry = data.procs[idx];
            if !entry.is_vacant() && !process_alive(entry.pid) {
                reap_entry(&mut data, idx, &mut cache);
                reaped += 1;
            }
        }
        self.stats.stale_reaped += reaped as u64;
        Ok(reaped)
    }

    /// Collects the live processes, windows and table usage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] if the main lock fails.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let data = self.main.read()?;
        let processes = data
            .procs
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_vacant())
            .map(|(index, entry)| ProcessInfo {
                index,
                pid: entry.pid,
                windows: entry.windows,
                alive: process_alive(entry.pid),
            })
            .collect();
        let windows = data
            .windows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_occupied())
            .map(|(slot, w)| WindowInfo {
                remote: remote_handle(slot),
                local: w.local,
                pid: data.procs[w.proc_idx as usize].pid,
            })
            .collect();
        Ok(Snapshot {
            processes,
            windows,
            atoms: self.atoms.stats(),
            handles: data.handles.count(),
            arena: self.main.arena().stats(),
        })
    }

    /// Unregisters the process and detaches from the main block,
    /// destroying it if this was the last attached process.
    ///
    /// # Errors
    ///
    /// Reports the first failure; teardown continues past it.
    pub fn detach(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;
        let flushed = self.flush_deferred();
        let released = self.release_process();
        self.segments.borrow_mut().clear();
        let destroyed = self.main.destroy_if_last();
        debug!("detached (main block destroyed: {:?})", destroyed);
        flushed.and(released).and(destroyed.map(|_| ()))
    }
}

impl Drop for DdeContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("teardown incomplete: {e}");
        }
    }
}

/// Frees registry slot `idx` and everything hanging off it.
///
/// The caller holds the main write lock.
pub(crate) fn reap_entry(data: &mut MainBlockData, idx: usize, cache: &mut SegmentCache) {
    let entry = data.procs[idx];
    if entry.pid != current_pid() {
        warn!("reaping stale process {} (slot {idx})", entry.pid);
    }

    if let Err(e) = MsgQueue::from_id(entry.queue).remove() {
        error!("cannot remove queue {}: {e}", entry.queue);
    }
    if let Ok(sem) = RwSem::from_id(entry.sem) {
        if let Err(e) = sem.remove() {
            error!("cannot remove semaphore {}: {e}", entry.sem);
        }
    }

    let mut next = (entry.head_segment >= 0).then_some(entry.head_segment);
    let mut walked = 0;
    while let Some(id) = next.take() {
        walked += 1;
        if walked > MAX_CHAIN {
            error!("segment chain of process {} does not end", entry.pid);
            break;
        }
        let Ok(segment) = Segment::attach(id) else {
            cache.forget(id);
            break;
        };
        // SAFETY: chain segments are formatted arenas.
        let arena = unsafe { Arena::from_raw(segment.base()) };
        next = arena.next_segment();
        let _ = segment.mark_removed();
        drop(segment);
        cache.forget(id);
    }

    for window in data.windows.iter_mut().filter(|w| w.is_owned_by(idx)) {
        window.release();
    }

    let owned: Vec<usize> = data
        .handles
        .iter_set()
        .filter(|&bit| data.handle_slots[bit].owner as usize == idx)
        .collect();
    for bit in owned {
        data.handles.clear(bit);
        data.handle_slots[bit] = HandleSlot::EMPTY;
    }

    data.procs[idx] = ProcessEntry::VACANT;
}
