//! End-to-end tests for the `corral` binary.
//!
//! Confining a command needs root, a writable cgroup v2 hierarchy with the
//! pids controller, and a statically linked busybox to build the image
//! from. Each test returns early when the host cannot provide these.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const BUSYBOX_APPLETS: &[&str] = &["sh", "echo", "hostname", "sleep", "cat", "seq", "true"];

fn corral() -> Command {
    Command::new(env!("CARGO_BIN_EXE_corral"))
}

fn running_as_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("Uid:"))
                .and_then(|l| l.split_whitespace().nth(2).map(|euid| euid == "0"))
        })
        .unwrap_or(false)
}

fn busybox() -> Option<PathBuf> {
    std::env::var_os("CORRAL_TEST_BUSYBOX")
        .map(PathBuf::from)
        .or_else(|| Some(PathBuf::from("/bin/busybox")))
        .filter(|p| p.is_file())
}

/// A throwaway image directory plus config pointing corral's state into a
/// temp dir.
struct Host {
    _dir: TempDir,
    image: PathBuf,
    config: PathBuf,
    rootfs_dir: PathBuf,
}

impl Host {
    fn new() -> Option<Self> {
        if !running_as_root() || !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            eprintln!("skipping: needs root and cgroup v2");
            return None;
        }
        let Some(busybox) = busybox() else {
            eprintln!("skipping: no static busybox (set CORRAL_TEST_BUSYBOX)");
            return None;
        };

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        let bin = image.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(image.join("proc")).unwrap();
        let _ = std::fs::copy(&busybox, bin.join("busybox")).unwrap();
        for applet in BUSYBOX_APPLETS {
            symlink("busybox", bin.join(applet)).unwrap();
        }

        let rootfs_dir = dir.path().join("roots");
        let runtime_dir = dir.path().join("run");
        let config = dir.path().join("corral.json");
        let body = config_json(&rootfs_dir, &runtime_dir);
        std::fs::write(&config, body).unwrap();

        Some(Self {
            _dir: dir,
            image,
            config,
            rootfs_dir,
        })
    }

    fn run(&self, extra: &[&str], command: &[&str]) -> Output {
        let image = format!("file://{}", self.image.display());
        corral()
            .arg("run")
            .arg("--config")
            .arg(&self.config)
            .args(extra)
            .arg(&image)
            .args(command)
            .env("PATH", "/bin")
            .output()
            .unwrap()
    }

    fn leftover_roots(&self) -> usize {
        std::fs::read_dir(&self.rootfs_dir).map_or(0, Iterator::count)
    }
}

fn config_json(rootfs_dir: &Path, runtime_dir: &Path) -> String {
    format!(
        r#"{{"rootfs_dir": "{}", "runtime_dir": "{}"}}"#,
        rootfs_dir.display(),
        runtime_dir.display()
    )
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ── Exit status ──────────────────────────────────────────────────

#[test]
fn echo_prints_and_exits_zero() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&[], &["/bin/echo", "hello"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "hello\n");
    assert_eq!(host.leftover_roots(), 0);
}

#[test]
fn exit_code_is_propagated() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&[], &["/bin/sh", "-c", "exit 7"]);
    assert_eq!(output.status.code(), Some(7));
    assert_eq!(host.leftover_roots(), 0);
}

#[test]
fn killed_command_maps_to_128_plus_signal() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&[], &["/bin/sh", "-c", "kill -9 $$"]);
    assert_eq!(output.status.code(), Some(128 + 9));
}

#[test]
fn missing_command_fails_without_leaking_the_root() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&[], &["/bin/does-not-exist"]);
    assert_ne!(output.status.code(), Some(0));
    assert!(stderr(&output).contains("command not found"));
    assert_eq!(host.leftover_roots(), 0);
}

#[test]
fn missing_image_fails_before_launch() {
    let Some(host) = Host::new() else { return };
    let output = corral()
        .arg("run")
        .arg("--config")
        .arg(&host.config)
        .arg("file:///nonexistent/corral-image")
        .arg("/bin/true")
        .output()
        .unwrap();
    assert_ne!(output.status.code(), Some(0));
    assert_eq!(host.leftover_roots(), 0);
}

// ── Isolation ────────────────────────────────────────────────────

#[test]
fn hostname_is_isolated() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&[], &["/bin/hostname"]);
    assert_eq!(stdout(&output), "container\n");

    let output = host.run(&["--hostname", "box"], &["/bin/hostname"]);
    assert_eq!(stdout(&output), "box\n");
}

#[test]
fn command_runs_in_a_fresh_pid_namespace() {
    let Some(host) = Host::new() else { return };
    // The re-executed child is PID 1; the command is its first child.
    let output = host.run(&[], &["/bin/sh", "-c", "echo $$"]);
    assert_eq!(stdout(&output), "2\n");
}

#[test]
fn proc_shows_only_the_container() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&[], &["/bin/cat", "/proc/1/cmdline"]);
    assert!(stdout(&output).contains("child"));
}

#[test]
fn pids_limit_caps_the_processes_that_start() {
    let Some(host) = Host::new() else { return };
    // Each started sleep prints a fresh pid; a refused fork leaves `$!`
    // unchanged. The confined child and the shell hold two of the 20.
    let script = "for i in $(seq 1 30); do sleep 5 & echo $!; done";
    let output = host.run(&["--pids-max", "20"], &["/bin/sh", "-c", script]);
    let started: std::collections::HashSet<&str> = std::str::from_utf8(&output.stdout)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty())
        .collect();
    assert!(
        !started.is_empty() && started.len() <= 18,
        "{} sleeps started; stderr: {}",
        started.len(),
        stderr(&output)
    );
    assert!(stderr(&output).contains("fork"), "stderr: {}", stderr(&output));
    assert_eq!(host.leftover_roots(), 0);
}

// ── Timeouts ─────────────────────────────────────────────────────

#[test]
fn run_timeout_kills_the_command() {
    let Some(host) = Host::new() else { return };
    let output = host.run(&["--run-timeout", "1"], &["/bin/sleep", "30"]);
    assert_ne!(output.status.code(), Some(0));
    assert!(stderr(&output).contains("timed out"));
    assert_eq!(host.leftover_roots(), 0);
}

// ── Hidden child mode ────────────────────────────────────────────

#[test]
fn child_refuses_to_run_outside_a_launch() {
    let output = corral()
        .args(["child", "--", "busybox", "/bin/true"])
        .env_remove("CORRAL_CONFINEMENT")
        .output()
        .unwrap();
    assert_ne!(output.status.code(), Some(0));
    assert!(stderr(&output).contains("internal"));
}
