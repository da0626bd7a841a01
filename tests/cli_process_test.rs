use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_libvirt-snmp-subagent"))
}

fn inventory_config() -> (NamedTempFile, NamedTempFile) {
    let mut inventory = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        inventory,
        r#"
[[guest]]
uuid = "6695eb01-f6a4-8304-79aa-97f2502e193f"
name = "web01"
state = "running"
cpu_count = 2
"#
    )
    .unwrap();

    let mut config = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        config,
        "[libvirt]\nsource = \"inventory\"\ninventory_path = \"{}\"\n",
        inventory.path().display()
    )
    .unwrap();
    (config, inventory)
}

fn run(args: &[&str]) -> Output {
    binary().args(args).output().unwrap()
}

#[test]
fn test_directive_listing_exits_zero() {
    let (config, _inventory) = inventory_config();
    let output = run(&["-H", "-c", config.path().to_str().unwrap()]);

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("Configuration directives understood:\n"));
    assert!(stderr.contains("\n  agent.agentx_socket "));
    assert!(stderr.contains("\n  libvirt.uri "));
}

#[test]
fn test_unknown_option_prints_usage_and_exits_zero() {
    let output = run(&["-q"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown option q"));
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("usage: "));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let output = run(&["-f", "-L", "-c", missing.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
}

fn assert_signal_stops_foreground_master(signal: Signal) {
    let (config, _inventory) = inventory_config();
    let mut child = binary()
        .args([
            "-f",
            "-L",
            "-M",
            "-c",
            config.path().to_str().unwrap(),
            "udp:127.0.0.1:0",
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    assert!(child.try_wait().unwrap().is_none(), "agent exited early");

    kill(Pid::from_raw(child.id() as i32), signal).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("agent did not stop after {:?}", signal);
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success());
}

#[test]
fn test_sigterm_stops_foreground_master() {
    assert_signal_stops_foreground_master(Signal::SIGTERM);
}

#[test]
fn test_sigint_stops_foreground_master() {
    assert_signal_stops_foreground_master(Signal::SIGINT);
}
