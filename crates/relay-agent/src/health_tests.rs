// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn reads_vm_rss_for_current_process() {
    let pid = std::process::id();
    let rss = read_vm_rss(pid).expect("vm rss readable for self");
    assert!(rss > 0, "expected a nonzero resident set size for the running test process");
}

#[test]
fn reads_total_ticks_for_current_process() {
    let pid = std::process::id();
    let ticks = read_total_ticks(pid).expect("stat readable for self");
    // utime+stime only grows; zero is plausible immediately at process
    // start but vanishingly unlikely once the test harness is running.
    let _ = ticks;
}

#[test]
fn clock_ticks_per_sec_is_sane() {
    let hz = clock_ticks_per_sec();
    assert!(hz >= 1.0 && hz <= 10_000.0);
}

#[test]
fn sample_reflects_last_read_proc_call() {
    let pid = std::process::id();
    let (sample, ticks) = read_proc(pid, None).expect("first sample");
    assert_eq!(sample.cpu_percent, 0.0, "no cpu percent without a previous sample to diff against");
    let (sample2, _) = read_proc(pid, Some(ticks)).expect("second sample");
    assert!(sample2.cpu_percent >= 0.0);
}

#[tokio::test]
async fn reporter_sample_starts_at_zero_before_first_tick() {
    let reporter = HealthReporter::new(std::process::id());
    let sample = reporter.sample();
    assert_eq!(sample.rss_bytes, 0);
    assert_eq!(sample.cpu_percent, 0.0);
}
