/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end tests for the disk usage watcher, on a real directory with
//! real inotify. These need no privileges.

use std::fs;
use std::future::Future;
use std::mem;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use sandstorm_supervisor::disk_usage::DiskUsageWatcher;
use tokio::task::LocalSet;
use tokio::time::timeout;

/// Per-entry overhead the size formula adds for a present child with a name
/// of `name_len` bytes.
fn entry_overhead(name_len: u64) -> u64 {
    mem::size_of::<libc::stat>() as u64 + ((name_len + 8) & !7)
}

fn block_round(size: u64) -> u64 {
    (size + 4095) & !4095
}

/// Recompute, independently of the watcher, what the recursive total for
/// `dir` should settle at: block-rounded sizes divided by link count, plus
/// per-entry overhead. Directory link counts vary by filesystem, so exact
/// literals only work for regular files.
fn expected_total(dir: &Path) -> u64 {
    let mut total = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let meta = entry.metadata().unwrap();
        let name_len = entry.file_name().len() as u64;
        let mut bytes = block_round(meta.size());
        if meta.nlink() != 0 {
            bytes /= meta.nlink();
            bytes += entry_overhead(name_len);
        } else {
            bytes = 0;
        }
        total += bytes;
        if meta.is_dir() {
            total += expected_total(&entry.path());
        }
    }
    total
}

fn run_local<F, Fut>(f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = LocalSet::new();
    local.block_on(&rt, f());
}

async fn wait_for_size(watcher: &DiskUsageWatcher, expected: u64) -> u64 {
    let mut size = watcher.size();
    while size != expected {
        size = timeout(Duration::from_secs(10), watcher.size_when_changed(size))
            .await
            .expect("timed out waiting for a size change");
    }
    size
}

#[test]
fn file_creation_and_deletion_are_accounted() {
    let dir = tempfile::tempdir().unwrap();
    run_local(|| async move {
        let watcher = DiskUsageWatcher::watching(dir.path());
        let _task = tokio::task::spawn_local(watcher.clone().run());

        fs::write(dir.path().join("f"), vec![0u8; 10_000]).unwrap();
        let expected = block_round(10_000) + entry_overhead(1);
        assert_eq!(wait_for_size(&watcher, expected).await, expected);

        fs::remove_file(dir.path().join("f")).unwrap();
        assert_eq!(wait_for_size(&watcher, 0).await, 0);
    });
}

#[test]
fn subdirectories_are_watched_recursively() {
    let dir = tempfile::tempdir().unwrap();
    run_local(|| async move {
        let watcher = DiskUsageWatcher::watching(dir.path());
        let _task = tokio::task::spawn_local(watcher.clone().run());

        fs::create_dir(dir.path().join("sub")).unwrap();
        let dir_only = expected_total(dir.path());
        assert!(dir_only > 0);
        assert_eq!(wait_for_size(&watcher, dir_only).await, dir_only);

        // A file created inside the subdirectory afterwards proves the
        // watch actually descended.
        fs::write(dir.path().join("sub/inner"), vec![0u8; 5_000]).unwrap();
        let with_file = expected_total(dir.path());
        assert!(with_file > dir_only);
        assert_eq!(wait_for_size(&watcher, with_file).await, with_file);

        fs::remove_file(dir.path().join("sub/inner")).unwrap();
        fs::remove_dir(dir.path().join("sub")).unwrap();
        assert_eq!(wait_for_size(&watcher, 0).await, 0);
    });
}

#[test]
fn preexisting_contents_are_counted_by_the_initial_scan() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/data"), vec![0u8; 9_000]).unwrap();
    let expected = expected_total(dir.path());

    run_local(|| async move {
        let watcher = DiskUsageWatcher::watching(dir.path());
        let _task = tokio::task::spawn_local(watcher.clone().run());
        assert_eq!(wait_for_size(&watcher, expected).await, expected);
    });
}

#[test]
fn changed_size_still_debounces() {
    let dir = tempfile::tempdir().unwrap();
    run_local(|| async move {
        let watcher = DiskUsageWatcher::watching(dir.path());
        let _task = tokio::task::spawn_local(watcher.clone().run());

        fs::write(dir.path().join("f"), vec![0u8; 100]).unwrap();
        let expected = block_round(100) + entry_overhead(1);
        wait_for_size(&watcher, expected).await;

        // The caller's stale value differs from the current size, so the
        // future resolves without waiting for a new change, but never
        // before the debounce window.
        let start = Instant::now();
        let size = watcher.size_when_changed(0).await;
        assert_eq!(size, expected);
        assert!(start.elapsed() >= Duration::from_millis(100));
    });
}

#[test]
fn hardlinks_are_split_between_their_names() {
    let dir = tempfile::tempdir().unwrap();
    // Both names exist before the watcher's initial scan, so each is
    // statted with a link count of two.
    fs::write(dir.path().join("a"), vec![0u8; 8192]).unwrap();
    fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();

    run_local(|| async move {
        let watcher = DiskUsageWatcher::watching(dir.path());
        let _task = tokio::task::spawn_local(watcher.clone().run());

        // Each name contributes size/nlink, so the payload is counted once
        // across both entries.
        let expected = 2 * (8192 / 2 + entry_overhead(1));
        assert_eq!(wait_for_size(&watcher, expected).await, expected);
    });
}
