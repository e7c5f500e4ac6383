//! Per-process SysV message queues carrying fixed-size packets.
//!
//! Message types tag the packet kind. Receiving with a negative selector
//! takes the lowest type first, so pending SENDs are serviced before POSTs.

use crate::error::{Error, Result, errno};
use std::mem::{MaybeUninit, size_of};

/// Synchronous message awaiting an ACK.
pub const KIND_SEND: libc::c_long = 1;
/// Asynchronous message.
pub const KIND_POST: libc::c_long = 2;
/// Acknowledgment of a SEND or POST.
pub const KIND_ACK: libc::c_long = 3;
/// Selector matching SEND and POST, lowest type first.
pub const INBOUND: libc::c_long = -KIND_POST;

/// Wire format of one message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Packet {
    /// Sender-assigned sequence number, echoed by the ACK.
    pub seq: u32,
    /// Registry index of the sender.
    pub sender: u32,
    /// Pid of the sender.
    pub sender_pid: i32,
    /// Remote window handle of the target.
    pub target: u32,
    /// Remote window handle of the source window, 0 if none.
    pub source: u32,
    /// Message id.
    pub message: u32,
    /// First parameter.
    pub wparam: u64,
    /// Second parameter.
    pub lparam: u64,
    /// Handler result (ACK only).
    pub result: i64,
}

#[repr(C)]
struct Envelope {
    mtype: libc::c_long,
    packet: Packet,
}

/// A message queue addressed by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgQueue {
    id: i32,
}

impl MsgQueue {
    /// Creates a private queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if `msgget` fails.
    pub fn create() -> Result<Self> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::msgget(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(Error::last_os("msgget"));
        }
        Ok(MsgQueue { id })
    }

    /// Wraps a queue created by another process.
    #[must_use]
    pub const fn from_id(id: i32) -> Self {
        MsgQueue { id }
    }

    /// SysV queue id.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Enqueues `packet` without blocking.
    ///
    /// Returns `Ok(false)` when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] for other failures, e.g. a removed queue.
    pub fn send(&self, kind: libc::c_long, packet: &Packet) -> Result<bool> {
        let envelope = Envelope {
            mtype: kind,
            packet: *packet,
        };
        loop {
            // SAFETY: `envelope` starts with the type word followed by
            // `size_of::<Packet>()` payload bytes.
            let rc = unsafe {
                libc::msgsnd(
                    self.id,
                    (&raw const envelope).cast(),
                    size_of::<Packet>(),
                    libc::IPC_NOWAIT,
                )
            };
            if rc == 0 {
                return Ok(true);
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(false),
                errno => return Err(Error::Os { call: "msgsnd", errno }),
            }
        }
    }

    /// Dequeues the first packet matching `selector` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] for failures other than an empty queue.
    pub fn recv(&self, selector: libc::c_long) -> Result<Option<(libc::c_long, Packet)>> {
        let mut envelope = MaybeUninit::<Envelope>::zeroed();
        loop {
            // SAFETY: the buffer has room for the type word and one packet.
            let rc = unsafe {
                libc::msgrcv(
                    self.id,
                    envelope.as_mut_ptr().cast(),
                    size_of::<Packet>(),
                    selector,
                    libc::IPC_NOWAIT,
                )
            };
            if rc >= 0 {
                // SAFETY: zero-initialized and overwritten by the kernel.
                let envelope = unsafe { envelope.assume_init() };
                return Ok(Some((envelope.mtype, envelope.packet)));
            }
            match errno() {
                libc::EINTR => continue,
                libc::ENOMSG => return Ok(None),
                errno => return Err(Error::Os { call: "msgrcv", errno }),
            }
        }
    }

    /// Number of queued messages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the queue is gone.
    pub fn depth(&self) -> Result<u64> {
        let mut ds = MaybeUninit::<libc::msqid_ds>::zeroed();
        // SAFETY: IPC_STAT fills the provided buffer.
        if unsafe { libc::msgctl(self.id, libc::IPC_STAT, ds.as_mut_ptr()) } == -1 {
            return Err(Error::last_os("msgctl(IPC_STAT)"));
        }
        // SAFETY: filled by the successful call.
        Ok(unsafe { ds.assume_init() }.msg_qnum as u64)
    }

    /// Destroys the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] for failures other than an already removed
    /// queue.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID takes no buffer.
        if unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            return match errno() {
                libc::EINVAL | libc::EIDRM => Ok(()),
                errno => Err(Error::Os {
                    call: "msgctl(IPC_RMID)",
                    errno,
                }),
            };
        }
        Ok(())
    }
}
