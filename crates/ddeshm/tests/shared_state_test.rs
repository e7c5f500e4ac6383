//! Atoms and the window table as seen from separate processes.

mod common;

use common::{Peer, run_peer, unique_config};
use ddeshm::DdeContext;

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn test_atoms_cross_process() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();

    let ours = ctx.add_atom("SharedTopic").unwrap();
    let output = run_peer(&config, &["atom", "find", "sharedtopic"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), ours.to_string());

    let output = run_peer(&config, &["atom", "add", "FromChild"]);
    assert!(output.status.success());
    let theirs = ctx.find_atom("FROMCHILD").unwrap().unwrap();
    assert_eq!(stdout(&output), theirs.to_string());
    assert_eq!(ctx.atom_name(theirs).unwrap().as_deref(), Some("FromChild"));

    // Reference added by us, removed by the child.
    ctx.add_atom("FromChild").unwrap();
    let atom = theirs.to_string();
    let output = run_peer(&config, &["atom", "delete", &atom]);
    assert!(output.status.success());
    assert_eq!(ctx.atom_refcount(theirs).unwrap(), Some(1));
}

#[test]
fn test_atom_find_missing() {
    let config = unique_config();
    let _ctx = DdeContext::attach(config.clone()).unwrap();
    let output = run_peer(&config, &["atom", "find", "nobody-added-this"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "not found");
}

#[test]
fn test_peer_windows_visible_and_reaped() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let mut peer = Peer::serve(&config, 3, &[]);
    assert_eq!(peer.remotes.len(), 3);

    for (offset, remote) in peer.remotes.iter().enumerate() {
        assert!(DdeContext::is_remote_window(*remote));
        let info = ctx.resolve_window(*remote).unwrap();
        assert_eq!(info.pid, peer.pid());
        assert_eq!(info.local, 0x1001 + offset as u32);
    }

    peer.kill();
    assert_eq!(ctx.reap_stale().unwrap(), 1);
    for remote in &peer.remotes {
        assert!(ctx.resolve_window(*remote).is_err());
    }
    let snapshot = ctx.snapshot().unwrap();
    assert!(snapshot.windows.is_empty());
}

#[test]
fn test_main_block_survives_peer_exit() {
    let config = unique_config();
    let mut ctx = DdeContext::attach(config.clone()).unwrap();
    let atom = ctx.add_atom("Persistent").unwrap();

    // A child attaches, registers and detaches cleanly.
    let mut peer = Peer::serve(&config, 1, &["--lifetime-ms", "100"]);
    peer.lines_until_exit("COUNT");

    assert_eq!(ctx.find_atom("Persistent").unwrap(), Some(atom));
    assert_eq!(ctx.snapshot().unwrap().processes.len(), 0);
}
