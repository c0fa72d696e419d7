//! Runs the binary, which traces itself in a single-threaded process.

use std::fs;
use std::process::Command;

fn run(capacity: &str, pages: &str) -> (std::process::Output, String) {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("pages.out");
    let output = Command::new(env!("CARGO_BIN_EXE_page_snoop"))
        .arg(capacity)
        .arg(&out)
        .arg(pages)
        .env("PAGE_SNOOP_LOG", "info")
        .output()
        .unwrap();
    let dump = fs::read_to_string(&out).unwrap_or_default();
    (output, dump)
}

/// Workload buffer the binary reports as `Workload at 0x..-0x..`.
fn workload_range(stderr: &str) -> (usize, usize) {
    let line = stderr
        .lines()
        .find(|l| l.contains("Workload at "))
        .expect("workload line logged");
    let span = line.split("Workload at ").nth(1).unwrap().trim();
    let mut bounds = span
        .split('-')
        .map(|b| usize::from_str_radix(b.trim_start_matches("0x"), 16).unwrap());
    (bounds.next().unwrap(), bounds.next().unwrap())
}

#[test]
fn dump_has_one_line_per_slot() {
    let (output, dump) = run("32", "64");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 32);
    for line in &lines {
        let addr = usize::from_str_radix(line, 16).unwrap();
        assert_eq!(addr % 4096, 0, "{} is not page aligned", line);
        assert_eq!(line.to_lowercase(), *line);
    }
    // The workload alone touches 32 distinct pages, so the cache is full.
    assert!(lines.iter().all(|l| *l != "0"));

    // Stopping comes right after the workload, so its pages are the newest.
    let (start, end) = workload_range(&String::from_utf8_lossy(&output.stderr));
    let first_page = start & !4095;
    let in_workload = lines
        .iter()
        .map(|l| usize::from_str_radix(l, 16).unwrap())
        .filter(|addr| *addr >= first_page && *addr < end)
        .count();
    assert!(in_workload >= 24, "only {} of 32 pages in the workload", in_workload);
}

#[test]
fn small_cache_completes() {
    let (output, dump) = run("8", "16");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(dump.lines().count(), 8);
}

#[test]
fn zero_capacity_is_fatal() {
    let (output, dump) = run("0", "4");
    assert_eq!(output.status.code(), Some(1));
    assert!(dump.is_empty());
}
