//! Send/Post/ACK delivery.
//!
//! A SEND is enqueued on the target's queue, the target is woken, and the
//! sender waits on its own queue for the ACK carrying the same sequence
//! number. While waiting it keeps servicing its own inbound messages, so
//! two processes sending to each other do not deadlock; the nesting depth
//! bounds that re-entrancy. A POST returns once enqueued; its receiver
//! defers the ACK and flushes it from the message loop.

use super::context::{DdeContext, DeferredAck, current_pid};
use super::window::window_slot;
use super::{BROADCAST, DdeMessage, Message, MessageKind};
use crate::error::{Error, Result};
use crate::ipc::msg::{INBOUND, KIND_ACK, KIND_POST, KIND_SEND};
use crate::ipc::{MsgQueue, Packet, process_alive};
use ddeshm_log::{debug, trace, warn};
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for an ACK or queue space.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// A resolved peer process.
#[derive(Debug, Clone, Copy)]
struct Peer {
    index: usize,
    pid: i32,
    queue: MsgQueue,
}

impl MessageKind {
    const fn queue_type(self) -> libc::c_long {
        match self {
            MessageKind::Send => KIND_SEND,
            MessageKind::Post => KIND_POST,
        }
    }
}

impl DdeContext {
    /// Sends `msg` to remote window `target` and waits for the handler's
    /// result.
    ///
    /// With `target == BROADCAST` every other registered process receives
    /// the message; the results are OR-ed and the call succeeds if any
    /// peer acknowledged.
    ///
    /// # Errors
    ///
    /// - [`Error::PeerUnavailable`] if the target process is gone (found
    ///   without waiting for the timeout)
    /// - [`Error::Timeout`] if no ACK arrived in time
    /// - [`Error::InvalidWindow`] if `target` is not mapped
    /// - [`Error::NestingTooDeep`] when called from too deep inside
    ///   handlers
    pub fn send(&mut self, target: u32, msg: &Message) -> Result<i64> {
        self.deliver(MessageKind::Send, target, msg)
    }

    /// Enqueues `msg` for remote window `target` without waiting.
    ///
    /// # Errors
    ///
    /// As [`DdeContext::send`], except that no ACK is awaited.
    pub fn post(&mut self, target: u32, msg: &Message) -> Result<()> {
        self.deliver(MessageKind::Post, target, msg).map(|_| ())
    }

    fn deliver(&mut self, kind: MessageKind, target: u32, msg: &Message) -> Result<i64> {
        if self.depth >= self.config.max_nesting {
            return Err(Error::NestingTooDeep { depth: self.depth });
        }
        self.ensure_registered()?;
        let source = match msg.source {
            Some(local) => self.register_window(local)?,
            None => 0,
        };
        if target == BROADCAST {
            return self.broadcast(kind, msg, source);
        }
        let peer = self.resolve_peer(target)?;
        self.deliver_to(kind, &peer, target, source, msg)
    }

    fn resolve_peer(&mut self, target: u32) -> Result<Peer> {
        let invalid = Error::InvalidWindow { hwnd: target };
        let peer = {
            let slot = window_slot(target).ok_or(invalid.clone())?;
            let data = self.main.read()?;
            let window = data.windows[slot];
            if !window.is_occupied() {
                return Err(invalid);
            }
            let index = window.proc_idx as usize;
            let entry = data.procs[index];
            if entry.is_vacant() {
                return Err(invalid);
            }
            Peer {
                index,
                pid: entry.pid,
                queue: MsgQueue::from_id(entry.queue),
            }
        };
        self.check_alive(&peer)?;
        Ok(peer)
    }

    fn check_alive(&mut self, peer: &Peer) -> Result<()> {
        if process_alive(peer.pid) {
            return Ok(());
        }
        self.reap_peer(peer.index, peer.pid)?;
        Err(Error::PeerUnavailable { pid: peer.pid })
    }

    fn broadcast(&mut self, kind: MessageKind, msg: &Message, source: u32) -> Result<i64> {
        let me = self.process_index();
        let peers: Vec<Peer> = {
            let data = self.main.read()?;
            data.procs
                .iter()
                .enumerate()
                .filter(|(index, entry)| !entry.is_vacant() && Some(*index) != me)
                .map(|(index, entry)| Peer {
                    index,
                    pid: entry.pid,
                    queue: MsgQueue::from_id(entry.queue),
                })
                .collect()
        };

        let mut delivered = false;
        let mut result = 0;
        let mut last_error = None;
        for peer in &peers {
            let outcome = self
                .check_alive(peer)
                .and_then(|()| self.deliver_to(kind, peer, BROADCAST, source, msg));
            match outcome {
                Ok(value) => {
                    delivered = true;
                    result |= value;
                }
                Err(e @ (Error::PeerUnavailable { .. } | Error::Timeout { .. })) => {
                    debug!("broadcast skipped process {}: {e}", peer.pid);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if delivered {
            Ok(result)
        } else {
            Err(last_error.unwrap_or(Error::PeerUnavailable { pid: 0 }))
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    fn deliver_to(
        &mut self,
        kind: MessageKind,
        peer: &Peer,
        target: u32,
        source: u32,
        msg: &Message,
    ) -> Result<i64> {
        let index = self.ensure_registered()?;
        let packet = Packet {
            seq: self.next_seq(),
            sender: index as u32,
            sender_pid: current_pid(),
            target,
            source,
            message: msg.id,
            wparam: msg.wparam,
            lparam: msg.lparam,
            result: 0,
        };
        self.enqueue(peer, kind.queue_type(), &packet)?;
        trace!(
            "{kind:?} {:#x} to {target:#x} (pid {}, seq {})",
            msg.id, peer.pid, packet.seq
        );

        match kind {
            MessageKind::Post => {
                self.stats.posted += 1;
                Ok(0)
            }
            MessageKind::Send => {
                self.stats.sent += 1;
                self.outstanding.insert(packet.seq);
                let result = self.await_ack(peer, packet.seq);
                self.outstanding.remove(&packet.seq);
                self.arrived.remove(&packet.seq);
                result
            }
        }
    }

    /// Enqueues on the peer's queue, waiting out a full queue until the
    /// ACK deadline, then wakes the peer.
    fn enqueue(&mut self, peer: &Peer, kind: libc::c_long, packet: &Packet) -> Result<()> {
        let started = Instant::now();
        loop {
            match peer.queue.send(kind, packet) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    debug!("queue of process {} unusable: {e}", peer.pid);
                    self.check_alive(peer)?;
                    return Err(Error::PeerUnavailable { pid: peer.pid });
                }
            }
            if started.elapsed() >= self.config.ack_timeout() {
                self.stats.timeouts += 1;
                return Err(Error::Timeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            self.check_alive(peer)?;
            self.wakeup.notify(peer.pid)?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.wakeup.notify(peer.pid)
    }

    fn await_ack(&mut self, peer: &Peer, seq: u32) -> Result<i64> {
        let started = Instant::now();
        let deadline = started + self.config.ack_timeout();
        loop {
            self.collect_acks()?;
            if let Some(result) = self.arrived.remove(&seq) {
                return Ok(result);
            }
            if self.depth < self.config.max_nesting {
                self.service_inbound()?;
                self.flush_deferred()?;
                if self.arrived.contains_key(&seq) {
                    continue;
                }
            }
            self.check_alive(peer)?;

            let now = Instant::now();
            if now >= deadline {
                self.stats.timeouts += 1;
                let waited_ms = (now - started).as_millis() as u64;
                warn!("no ACK from process {} for seq {seq} after {waited_ms} ms", peer.pid);
                return Err(Error::Timeout { waited_ms });
            }
            self.wakeup.wait((deadline - now).min(POLL_SLICE))?;
        }
    }

    /// Moves ACKs from the own queue into `arrived`; ACKs nobody waits
    /// for (POST acknowledgments, late replies) are dropped.
    fn collect_acks(&mut self) -> Result<()> {
        let Some(queue) = self.registration.as_ref().map(|r| r.queue) else {
            return Ok(());
        };
        while let Some((_, ack)) = queue.recv(KIND_ACK)? {
            if self.outstanding.contains(&ack.seq) {
                self.stats.acks += 1;
                self.arrived.insert(ack.seq, ack.result);
            } else {
                self.stats.stray_acks += 1;
                trace!("dropped ACK for seq {}", ack.seq);
            }
        }
        Ok(())
    }

    /// Dispatches every pending inbound message. Returns the count.
    fn service_inbound(&mut self) -> Result<usize> {
        let mut serviced = 0;
        // A handler may release the registration, removing the queue.
        while let Some(queue) = self.registration.as_ref().map(|r| r.queue) {
            let Some((kind, packet)) = queue.recv(INBOUND)? else {
                break;
            };
            let kind = if kind == KIND_SEND {
                MessageKind::Send
            } else {
                MessageKind::Post
            };
            self.dispatch(kind, packet)?;
            serviced += 1;
        }
        Ok(serviced)
    }

    fn dispatch(&mut self, kind: MessageKind, packet: Packet) -> Result<()> {
        self.stats.received += 1;
        let hwnd = if packet.target == BROADCAST {
            Some(BROADCAST)
        } else {
            self.remote_to_local(packet.target).ok()
        };

        let result = match (hwnd, self.handler.clone()) {
            (Some(hwnd), Some(handler)) => {
                let message = DdeMessage {
                    kind,
                    hwnd,
                    source: (packet.source != 0).then_some(packet.source),
                    sender_pid: packet.sender_pid,
                    message: packet.message,
                    wparam: packet.wparam,
                    lparam: packet.lparam,
                };
                self.depth += 1;
                let result = handler(self, &message);
                self.depth -= 1;
                result
            }
            (None, _) => {
                debug!("message for unmapped window {:#x}", packet.target);
                0
            }
            (Some(_), None) => 0,
        };

        let Some(queue) = self.sender_queue(&packet)? else {
            debug!("sender {} of seq {} is gone", packet.sender_pid, packet.seq);
            return Ok(());
        };
        let ack = DeferredAck {
            queue,
            pid: packet.sender_pid,
            packet: Packet { result, ..packet },
        };
        match kind {
            MessageKind::Send => self.send_ack(&ack),
            MessageKind::Post => {
                self.deferred.push_back(ack);
                if self.deferred.len() >= self.config.deferred_ack_capacity {
                    self.flush_deferred()?;
                }
            }
        }
        Ok(())
    }

    fn sender_queue(&self, packet: &Packet) -> Result<Option<MsgQueue>> {
        let data = self.main.read()?;
        Ok(data
            .procs
            .get(packet.sender as usize)
            .filter(|entry| entry.pid == packet.sender_pid)
            .map(|entry| MsgQueue::from_id(entry.queue)))
    }

    fn send_ack(&self, ack: &DeferredAck) {
        match ack.queue.send(KIND_ACK, &ack.packet) {
            Ok(true) => {
                let _ = self.wakeup.notify(ack.pid);
            }
            Ok(false) => warn!("queue of process {} is full, ACK dropped", ack.pid),
            Err(e) => debug!("ACK to process {} failed: {e}", ack.pid),
        }
    }

    /// Sends every deferred POST acknowledgment.
    ///
    /// # Errors
    ///
    /// Currently infallible; failed ACKs are logged and dropped.
    pub fn flush_deferred(&mut self) -> Result<()> {
        while let Some(ack) = self.deferred.pop_front() {
            self.send_ack(&ack);
        }
        Ok(())
    }

    /// Services all pending inbound messages without blocking. Returns the
    /// number dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the own queue fails.
    pub fn pump(&mut self) -> Result<usize> {
        if self.registration.is_none() {
            return Ok(0);
        }
        self.flush_deferred()?;
        self.collect_acks()?;
        let serviced = self.service_inbound()?;
        self.flush_deferred()?;
        Ok(serviced)
    }

    /// Blocks until inbound traffic is queued or `timeout` passes. Returns
    /// whether something is waiting to be pumped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if polling or the own queue fails.
    pub fn wait_message(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            // Drain ACKs first so only SEND and POST packets are counted.
            self.collect_acks()?;
            if let Some(registration) = &self.registration {
                if registration.queue.depth()? > 0 {
                    return Ok(true);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.wakeup.wait((deadline - now).min(POLL_SLICE))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dde::context::tests::test_config;
    use crate::dde::main_block::{ProcessEntry, WindowEntry};
    use crate::dde::window::remote_handle;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_send_to_own_window() {
        let mut ctx = DdeContext::attach(test_config(0x50)).unwrap();
        let remote = ctx.register_window(0x77).unwrap();
        ctx.set_handler(|_, msg| {
            assert_eq!(msg.hwnd, 0x77);
            assert_eq!(msg.kind, MessageKind::Send);
            (msg.wparam + msg.lparam) as i64
        });

        let result = ctx.send(remote, &Message::new(0x3E0).wparam(40).lparam(2)).unwrap();
        assert_eq!(result, 42);
        let stats = ctx.stats();
        assert_eq!((stats.sent, stats.received, stats.acks), (1, 1, 1));
    }

    #[test]
    fn test_send_between_contexts() {
        let config = test_config(0x51);
        let mut a = DdeContext::attach(config.clone()).unwrap();
        let mut b = DdeContext::attach(config).unwrap();
        let rb = b.register_window(0x10).unwrap();
        b.set_handler(|_, msg| i64::from(msg.message) * 2);

        // `b` never pumps, so the send times out; the SEND stays queued.
        assert!(matches!(
            a.send(rb, &Message::new(21)),
            Err(Error::Timeout { .. })
        ));
        assert_eq!(b.pump().unwrap(), 1);
        assert_eq!(a.pump().unwrap(), 0);
        assert_eq!(a.stats().stray_acks, 1);
        assert_eq!(a.stats().timeouts, 1);
    }

    #[test]
    fn test_post_defers_ack() {
        let config = test_config(0x52);
        let mut a = DdeContext::attach(config.clone()).unwrap();
        let mut b = DdeContext::attach(config).unwrap();
        let rb = b.register_window(0x10).unwrap();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        b.set_handler(move |_, msg| {
            assert_eq!(msg.kind, MessageKind::Post);
            counter.set(counter.get() + 1);
            0
        });

        a.post(rb, &Message::new(1)).unwrap();
        a.post(rb, &Message::new(2)).unwrap();
        assert_eq!(a.stats().posted, 2);
        assert!(b.wait_message(Duration::from_secs(1)).unwrap());
        assert_eq!(b.pump().unwrap(), 2);
        assert_eq!(seen.get(), 2);
        assert!(b.deferred.is_empty());
    }

    #[test]
    fn test_source_window_is_translated() {
        let config = test_config(0x53);
        let mut a = DdeContext::attach(config.clone()).unwrap();
        let mut b = DdeContext::attach(config).unwrap();
        let rb = b.register_window(0x10).unwrap();
        let source = Rc::new(Cell::new(None));
        let seen = source.clone();
        b.set_handler(move |_, msg| {
            seen.set(msg.source);
            0
        });

        a.post(rb, &Message::new(1).from_window(0x55)).unwrap();
        b.pump().unwrap();
        let remote = source.get().unwrap();
        assert!(DdeContext::is_remote_window(remote));
        assert_eq!(a.remote_to_local(remote).unwrap(), 0x55);
    }

    #[test]
    fn test_unmapped_target() {
        let mut ctx = DdeContext::attach(test_config(0x54)).unwrap();
        assert_eq!(
            ctx.send(0xFFF0, &Message::new(1)),
            Err(Error::InvalidWindow { hwnd: 0xFFF0 })
        );
        assert_eq!(
            ctx.post(0x1234, &Message::new(1)),
            Err(Error::InvalidWindow { hwnd: 0x1234 })
        );
    }

    #[test]
    fn test_broadcast_without_peers() {
        let mut ctx = DdeContext::attach(test_config(0x55)).unwrap();
        ctx.register_window(1).unwrap();
        assert_eq!(
            ctx.send(BROADCAST, &Message::new(1)),
            Err(Error::PeerUnavailable { pid: 0 })
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut config = test_config(0x56);
        config.max_nesting = 3;
        let mut ctx = DdeContext::attach(config).unwrap();
        let remote = ctx.register_window(0x1).unwrap();
        let deepest = Rc::new(Cell::new(0));
        let record = deepest.clone();
        ctx.set_handler(move |ctx, msg| {
            record.set(record.get().max(msg.wparam));
            match ctx.send(remote, &Message::new(1).wparam(msg.wparam + 1)) {
                Ok(inner) => inner + 1,
                Err(Error::NestingTooDeep { depth }) => -(depth as i64),
                Err(e) => panic!("unexpected {e}"),
            }
        });

        // Depths 1..=3 run the handler; the send at depth 3 is refused.
        let result = ctx.send(remote, &Message::new(1).wparam(1)).unwrap();
        assert_eq!(deepest.get(), 3);
        assert_eq!(result, -3 + 2);
    }

    #[test]
    fn test_dead_peer_fails_fast() {
        let config = test_config(0x57);
        let mut ctx = DdeContext::attach(config).unwrap();
        ctx.register_window(1).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id() as i32;
        child.wait().unwrap();
        let queue = MsgQueue::create().unwrap();
        let target = {
            let mut data = ctx.main.write().unwrap();
            data.procs[9] = ProcessEntry::new(dead, queue.id(), -1);
            data.windows[20] = WindowEntry::occupied(9, 0x99);
            remote_handle(20)
        };

        let started = Instant::now();
        assert_eq!(
            ctx.send(target, &Message::new(1)),
            Err(Error::PeerUnavailable { pid: dead })
        );
        assert!(started.elapsed() < ctx.config().ack_timeout());
        assert!(ctx.resolve_window(target).is_err());
        assert_eq!(ctx.stats().stale_reaped, 1);
    }

    #[test]
    fn test_wait_message_ignores_leftover_acks() {
        let config = test_config(0x58);
        let mut a = DdeContext::attach(config.clone()).unwrap();
        let mut b = DdeContext::attach(config).unwrap();
        let rb = b.register_window(0x10).unwrap();

        a.post(rb, &Message::new(1)).unwrap();
        assert!(b.wait_message(Duration::from_secs(1)).unwrap());
        assert_eq!(b.pump().unwrap(), 1);

        // Only the POST acknowledgment is queued for `a`.
        assert!(!a.wait_message(Duration::from_millis(50)).unwrap());
        assert_eq!(a.stats().stray_acks, 1);
        assert_eq!(a.pump().unwrap(), 0);
    }

    #[test]
    fn test_handler_releasing_last_window_stops_pump() {
        let config = test_config(0x59);
        let mut ctx = DdeContext::attach(config.clone()).unwrap();
        let _other = DdeContext::attach(config).unwrap();
        let remote = ctx.register_window(0x30).unwrap();
        ctx.set_handler(|ctx, _| ctx.destroy_window(0x30).map_or(-1, |()| 1));

        ctx.post(remote, &Message::new(1)).unwrap();
        ctx.post(remote, &Message::new(2)).unwrap();
        assert_eq!(ctx.pump().unwrap(), 1);
        assert_eq!(ctx.process_index(), None);
        assert_eq!(ctx.pump().unwrap(), 0);
    }
}
