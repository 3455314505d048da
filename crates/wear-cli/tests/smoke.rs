#![cfg(not(target_arch = "wasm32"))]

use std::process::{Command, Output};

use wear_gpu::pm4::{build_type3_header, opcode};
use wear_mem::regions::USER_BASE;

fn wear(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wear"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run wear")
}

fn stats(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout was not JSON ({err}).\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn bios_boot_prints_banner_and_stats() {
    let output = wear(&["--bios", "--memory-mib", "16", "--run-ms", "200", "--stats-json"]);
    assert!(output.status.success(), "{output:?}");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("WeaR-emu Internal BIOS v1.0"),
        "banner missing from log:\n{stderr}"
    );

    let stats = stats(&output);
    assert!(stats["instructions"].as_u64().unwrap() > 0);
    assert!(stats["syscalls"].as_u64().unwrap() >= 3);
    assert_eq!(stats["unimplemented_syscalls"], 0);
}

#[test]
fn halting_binary_finishes_before_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("halt.bin");
    // nop; nop; hlt
    std::fs::write(&path, [0x90u8, 0x90, 0xF4]).unwrap();

    let output = wear(&[
        "--binary",
        path.to_str().unwrap(),
        "--memory-mib",
        "1",
        "--run-ms",
        "10000",
        "--stats-json",
    ]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stats(&output)["instructions"], 3);
}

#[test]
fn faulting_binary_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fault.bin");
    std::fs::write(&path, [0xE9u8]).unwrap();

    // Placed so the jump displacement runs past the end of a 1 MiB buffer.
    let output = wear(&[
        "--binary",
        path.to_str().unwrap(),
        "--load-address",
        "0x4ffffd",
        "--memory-mib",
        "1",
        "--run-ms",
        "10000",
    ]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ERROR"), "{stdout}");
}

#[test]
fn config_file_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wear.json");
    std::fs::write(&path, r#"{ "memory": { "size_bytes": 3000 } }"#).unwrap();

    let output = wear(&["--config", path.to_str().unwrap(), "--run-ms", "10"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to initialize emulator"), "{stderr}");
}

/// Pulls the first number after `label` out of the text report.
fn reported(stdout: &str, label: &str) -> u64 {
    let line = stdout
        .lines()
        .find(|line| line.starts_with(label))
        .unwrap_or_else(|| panic!("no {label:?} line in:\n{stdout}"));
    line[label.len()..]
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("unparsable line {line:?}"))
}

#[test]
fn every_queued_draw_is_presented() {
    const TABLE: u64 = 0x800;
    const SIZES: u64 = 0x808;
    const COMMANDS: u64 = 0x1000;

    // loop: submit one command buffer holding a single draw; jmp loop
    let mut image = Vec::new();
    image.extend_from_slice(&[0x48, 0xC7, 0xC0]);
    image.extend_from_slice(&591u32.to_le_bytes());
    image.extend_from_slice(&[0x48, 0xC7, 0xC7]);
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&[0x48, 0xBE]);
    image.extend_from_slice(&(USER_BASE + TABLE).to_le_bytes());
    image.extend_from_slice(&[0x48, 0xBA]);
    image.extend_from_slice(&(USER_BASE + SIZES).to_le_bytes());
    image.extend_from_slice(&[0x0F, 0x05, 0xE9]);
    let back = -(image.len() as i32 + 4);
    image.extend_from_slice(&back.to_le_bytes());

    image.resize(COMMANDS as usize + 12, 0);
    image[TABLE as usize..][..8].copy_from_slice(&(USER_BASE + COMMANDS).to_le_bytes());
    image[SIZES as usize..][..4].copy_from_slice(&12u32.to_le_bytes());
    let draw = [build_type3_header(opcode::DRAW_INDEX_AUTO, 2, 0), 3, 0];
    for (i, word) in draw.iter().enumerate() {
        image[COMMANDS as usize + i * 4..][..4].copy_from_slice(&word.to_le_bytes());
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("draws.bin");
    std::fs::write(&path, &image).unwrap();

    let output = wear(&[
        "--binary",
        path.to_str().unwrap(),
        "--memory-mib",
        "1",
        "--steps-per-tick",
        "16",
        "--run-ms",
        "100",
    ]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let queued = reported(&stdout, "queued draws:");
    assert!(queued > 0, "{stdout}");
    let presented = stdout
        .lines()
        .find(|line| line.starts_with("presented commands:"))
        .and_then(|line| line.split(", ").nth(1))
        .and_then(|part| part.split_whitespace().next())
        .and_then(|n| n.parse::<u64>().ok());
    assert_eq!(presented, Some(queued), "{stdout}");
}
