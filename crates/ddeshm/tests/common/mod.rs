// Common test utilities for integration tests
//
// Each test gets a key range of its own so tests never share a main block,
// and remote peers are `ddepeer` child processes.

#![allow(dead_code)]

use ddeshm::DdeConfig;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_SLOT: AtomicU32 = AtomicU32::new(0);

/// A configuration whose key range no other test uses.
pub fn unique_config() -> DdeConfig {
    let slot = NEXT_SLOT.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id();
    DdeConfig {
        shm_key: 0x6D00_0000 + ((pid & 0xFFF) << 12) + slot * 16,
        key_range: 8,
        ack_timeout_ms: 2000,
        ..DdeConfig::default()
    }
}

fn peer_command(config: &DdeConfig) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ddepeer"));
    command
        .env("DDESHM_LOG", "error")
        .arg("--key")
        .arg(format!("{:#x}", config.shm_key))
        .arg("--timeout-ms")
        .arg(config.ack_timeout_ms.to_string());
    command
}

/// Runs a one-shot `ddepeer` command to completion.
pub fn run_peer(config: &DdeConfig, args: &[&str]) -> Output {
    peer_command(config)
        .args(args)
        .output()
        .expect("Failed to run ddepeer")
}

/// A `ddepeer serve` child process.
pub struct Peer {
    child: Child,
    lines: Receiver<String>,
    /// Remote handles of the windows it mapped.
    pub remotes: Vec<u32>,
}

impl Peer {
    /// Starts a peer serving `windows` windows and waits until it is ready.
    pub fn serve(config: &DdeConfig, windows: u32, extra: &[&str]) -> Peer {
        let mut child = peer_command(config)
            .arg("serve")
            .arg("--windows")
            .arg(windows.to_string())
            .args(extra)
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn ddepeer");

        let stdout = child.stdout.take().expect("Missing stdout");
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut peer = Peer {
            child,
            lines,
            remotes: Vec::new(),
        };
        let ready = peer
            .expect_line("READY", Duration::from_secs(10))
            .expect("ddepeer did not become ready");
        peer.remotes = ready
            .split_whitespace()
            .skip(1)
            .map(|hwnd| u32::from_str_radix(hwnd.trim_start_matches("0x"), 16).unwrap())
            .collect();
        peer
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Waits for the next output line starting with `prefix`.
    pub fn expect_line(&mut self, prefix: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.lines.recv_timeout(remaining) {
                Ok(line) if line.starts_with(prefix) => return Some(line),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    /// Collects output lines starting with `prefix` until the peer exits.
    pub fn lines_until_exit(&mut self, prefix: &str) -> Vec<String> {
        let _ = self.child.wait();
        self.lines.iter().filter(|line| line.starts_with(prefix)).collect()
    }

    /// Kills the peer without giving it a chance to unregister.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.kill();
    }
}
