//! Message delivery between processes.
//!
//! The remote side is always a `ddepeer serve` child, whose handler answers
//! `wparam + lparam` (plus the result of a nested send with `--nested-to`).

mod common;

use common::{Peer, run_peer, unique_config};
use ddeshm::{BROADCAST, DdeContext, Error, Message};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn test_send_to_live_peer() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let mut peer = Peer::serve(&config, 1, &[]);

    let result = ctx
        .send(peer.remotes[0], &Message::new(0x3E0).wparam(40).lparam(2))
        .unwrap();
    assert_eq!(result, 42);

    let line = peer.expect_line("MSG", Duration::from_secs(5)).unwrap();
    assert!(line.contains("kind=send"));
    assert!(line.contains("msg=0x3e0"));
    assert!(line.contains(&format!("from={}", std::process::id())));
    assert_eq!(ctx.stats().acks, 1);
}

#[test]
fn test_send_and_post_to_killed_peer_fail_fast() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let mut first = Peer::serve(&config, 1, &[]);
    let mut second = Peer::serve(&config, 1, &[]);
    let (first_pid, second_pid) = (first.pid(), second.pid());
    first.kill();
    second.kill();

    let started = Instant::now();
    assert_eq!(
        ctx.send(first.remotes[0], &Message::new(1)),
        Err(Error::PeerUnavailable { pid: first_pid })
    );
    assert_eq!(
        ctx.post(second.remotes[0], &Message::new(1)),
        Err(Error::PeerUnavailable { pid: second_pid })
    );
    assert!(started.elapsed() < config.ack_timeout());

    // Both entries were reaped on the way.
    assert!(ctx.resolve_window(first.remotes[0]).is_err());
    let snapshot = ctx.snapshot().unwrap();
    assert!(snapshot.processes.iter().all(|p| p.pid != first_pid && p.pid != second_pid));
}

#[test]
fn test_broadcast_reaches_every_other_process() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let mut a = Peer::serve(&config, 1, &[]);
    let mut b = Peer::serve(&config, 2, &[]);

    let own_calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&own_calls);
    ctx.register_window(0x500).unwrap();
    ctx.set_handler(move |_, _| {
        counter.set(counter.get() + 1);
        0
    });

    let result = ctx
        .send(BROADCAST, &Message::new(0x10).wparam(1).lparam(2))
        .unwrap();
    assert_eq!(result, 3);
    for peer in [&mut a, &mut b] {
        let line = peer.expect_line("MSG", Duration::from_secs(5)).unwrap();
        assert!(line.contains("hwnd=0xffff"));
    }
    assert_eq!(own_calls.get(), 0);
    assert_eq!(ctx.stats().sent, 2);
}

#[test]
fn test_post_is_acknowledged_later() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let mut peer = Peer::serve(&config, 1, &[]);

    ctx.post(peer.remotes[0], &Message::new(0x20).wparam(7)).unwrap();
    let line = peer.expect_line("MSG", Duration::from_secs(5)).unwrap();
    assert!(line.contains("kind=post"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.stats().stray_acks == 0 && Instant::now() < deadline {
        ctx.wait_message(Duration::from_millis(50)).unwrap();
        ctx.pump().unwrap();
    }
    assert_eq!(ctx.stats().stray_acks, 1);
}

#[test]
fn test_nested_send_reenters_sender() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let own = ctx.register_window(0x600).unwrap();
    ctx.set_handler(|_, msg| 100 + msg.wparam as i64);

    let peer = Peer::serve(&config, 1, &["--nested-to", &format!("{own:#x}")]);

    // The peer calls back into us while we wait for its ACK.
    let result = ctx
        .send(peer.remotes[0], &Message::new(0x30).wparam(5).lparam(1))
        .unwrap();
    assert_eq!(result, 6 + 105);
    assert_eq!(ctx.stats().received, 1);
}

#[test]
fn test_send_through_chain_of_peers() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let last = Peer::serve(&config, 1, &[]);
    let first = Peer::serve(&config, 1, &["--nested-to", &format!("{:#x}", last.remotes[0])]);

    let result = ctx
        .send(first.remotes[0], &Message::new(0x40).wparam(2).lparam(3))
        .unwrap();
    assert_eq!(result, 5 + 2);
}

#[test]
fn test_cli_send_and_status() {
    let config = unique_config();
    let peer = Peer::serve(&config, 1, &[]);

    let to = format!("{:#x}", peer.remotes[0]);
    let output = run_peer(
        &config,
        &["send", "--to", &to, "--msg", "0x3e0", "--wparam", "20", "--lparam", "22"],
    );
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "RESULT 42");

    let output = run_peer(&config, &["status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("pid={}", peer.pid())));
    assert!(stdout.contains(&format!("{to} -> 0x1001")));
}

#[test]
fn test_cli_exit_code_for_dead_peer() {
    let config = unique_config();
    let _ctx = DdeContext::attach(config.clone()).unwrap();
    let mut peer = Peer::serve(&config, 1, &[]);
    peer.kill();

    let to = format!("{:#x}", peer.remotes[0]);
    let output = run_peer(&config, &["send", "--to", &to, "--msg", "1"]);
    assert_eq!(output.status.code(), Some(2));
}
