#![cfg(target_family = "unix")]
use std::fs::OpenOptions;
use std::path::Path;

use pmem_pages::{memlogs, Config, LogDestination, PageStore, PAGE_SIZE};
use pmem_recover::PageRecovery;

fn config(dir: &Path) -> Config {
    Config {
        backing_file: dir.join("image"),
        pages: 4,
        log_destination: LogDestination::Directory(dir.join("logs")),
        ..Config::default()
    }
}

/// Write `x = 1` in a durable section, then stop without finishing the workspace.
fn crash_after_one_section(dir: &Path) {
    let store = PageStore::open(config(dir)).expect("to open the store");
    store.register_variable("x", 64, 8).unwrap();
    store.register_variable("y", PAGE_SIZE + 8, 8).unwrap();

    let mut ws = store.workspace(1).unwrap();
    ws.begin_durable().unwrap();
    ws.write_u64(64, 1).unwrap();
    ws.end_durable().unwrap();

    // No final commit and no cancel, as if the process died here.
    std::mem::forget(ws);
}

#[test]
fn committed_variable_is_restored() {
    let dir = tempfile::tempdir().unwrap();
    crash_after_one_section(dir.path());

    let mut recovery = PageRecovery::open(&config(dir.path())).unwrap();
    assert_eq!(recovery.varmap().len(), 2);

    let mut x = [0xff; 8];
    assert_eq!(recovery.recover(&mut x, 8, "x"), 8);
    assert_eq!(u64::from_le_bytes(x), 1);

    // A shorter read of the same variable.
    let mut low = [0; 4];
    assert_eq!(recovery.recover(&mut low, 4, "x"), 4);
    assert_eq!(low, [1, 0, 0, 0]);
}

#[test]
fn unknown_and_uncommitted_variables_restore_nothing() {
    let dir = tempfile::tempdir().unwrap();
    crash_after_one_section(dir.path());

    let mut recovery = PageRecovery::open(&config(dir.path())).unwrap();
    let mut dest = [0; 8];
    assert_eq!(recovery.recover(&mut dest, 8, "nope"), 0);
    // Page 1 was never written.
    assert_eq!(recovery.recover(&mut dest, 8, "y"), 0);
    assert!(!recovery.lookup(1).unwrap().dirtied);
}

#[test]
fn truncated_memory_log_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    crash_after_one_section(dir.path());

    let logs = memlogs(&dir.path().join("logs")).unwrap();
    assert_eq!(logs.len(), 1);
    let (_, _, path) = &logs[0];
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    // Cut off the sentinel.
    file.set_len(len - 16).unwrap();

    let mut recovery = PageRecovery::open(&config(dir.path())).unwrap();
    let mut x = [0; 8];
    assert_eq!(recovery.recover(&mut x, 8, "x"), 0);
}

#[test]
fn image_gets_every_committed_page() {
    let dir = tempfile::tempdir().unwrap();
    crash_after_one_section(dir.path());

    let mut recovery = PageRecovery::open(&config(dir.path())).unwrap();
    let mut image = vec![0xee; 4 * PAGE_SIZE];
    assert_eq!(recovery.recover_image(&mut image), 1);
    assert_eq!(&image[64..72], &1u64.to_le_bytes());
    assert!(image[..64].iter().all(|&b| b == 0));
    // Pages without a log entry are left alone.
    assert!(image[PAGE_SIZE..].iter().all(|&b| b == 0xee));
}
