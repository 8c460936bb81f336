use std::path::Path;

use crate::{
    last_xact, memlog_name, read_log, HeapKind, LookupInfo, LookupTable, MemoryLogger, VarEntry,
    VarLocation, VarMap, PAGE_SIZE,
};

fn with_setup(method: impl FnOnce(&Path)) {
    let dir = tempfile::tempdir().expect("to create a log directory");
    method(dir.path())
}

#[test]
fn memory_log_ends_with_sentinel() {
    with_setup(|dir| {
        let mut logger = MemoryLogger::new(dir, 3);
        logger.open(7).unwrap();
        let first = logger.append(2, &[0xaa; PAGE_SIZE]).unwrap();
        let second = logger.append(5, &[0xbb; PAGE_SIZE]).unwrap();
        logger.close().unwrap();
        assert!(!logger.is_open());

        let path = dir.join(memlog_name(3, 7));
        let contents = read_log(&path).unwrap();
        assert!(contents.complete);
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.records[0].page_no, 2);
        assert_eq!(contents.records[0].offset, first);
        assert_eq!(contents.records[1].page_no, 5);
        assert_eq!(contents.records[1].offset, second);

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes[second as usize..][..PAGE_SIZE].iter().all(|&b| b == 0xbb));
        assert_eq!(last_xact(dir).unwrap(), 7);
    });
}

#[test]
fn truncated_memory_log_is_incomplete() {
    with_setup(|dir| {
        let mut logger = MemoryLogger::new(dir, 1);
        logger.open(1).unwrap();
        logger.append(0, &[1; PAGE_SIZE]).unwrap();
        logger.append(1, &[2; PAGE_SIZE]).unwrap();
        // The process died before closing.
        drop(logger);

        let path = dir.join(memlog_name(1, 1));
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((8 + PAGE_SIZE + 100) as u64).unwrap();

        let contents = read_log(&path).unwrap();
        assert!(!contents.complete);
        assert_eq!(contents.records.len(), 1);
    });
}

#[test]
fn append_needs_an_open_log() {
    with_setup(|dir| {
        let mut logger = MemoryLogger::new(dir, 1);
        assert!(logger.append(0, &[0; PAGE_SIZE]).is_err());
        assert_eq!(last_xact(&dir.join("missing")).unwrap(), 0);
    });
}

#[test]
fn lookup_buffer_commits_each_page_once() {
    with_setup(|dir| {
        let table = LookupTable::create(dir, HeapKind::Heap, 8).unwrap();
        let info = |xact| LookupInfo {
            xact,
            thread: 2,
            offset: 8,
            dirtied: true,
        };

        table.record_lookup(3, info(1));
        table.record_lookup(3, info(2));
        table.record_lookup(5, info(3));
        assert_eq!(table.get(3), LookupInfo::default());
        assert_eq!(table.buffered(3), info(2));

        assert_eq!(table.commit_buffer().unwrap(), 2);
        assert_eq!(table.get(3), info(2));
        assert_eq!(table.get(5), info(3));
        assert_eq!(table.buffered(3), LookupInfo::default());
        assert_eq!(table.commit_buffer().unwrap(), 0);

        let on_disk = crate::read_lookup(table.path()).unwrap();
        assert_eq!(on_disk.len(), 8);
        assert_eq!(on_disk[3], info(2));
        assert!(!on_disk[0].dirtied);
    });
}

#[test]
fn dependence_reports_other_threads() {
    with_setup(|dir| {
        let table = LookupTable::create(dir, HeapKind::Globals, 4).unwrap();
        assert!(!table.record_dependence(1, 0));
        assert!(!table.record_dependence(1, 0));
        assert!(table.record_dependence(1, 4));

        table.commit_buffer().unwrap();
        assert!(!table.record_dependence(1, 0));
        assert!(dir.join("dependence_globals").exists());
    });
}

#[test]
fn varmap_lines() {
    let map = VarMap::parse("x:8:2:16\nlegacy:0x2010\n\nbroken:1:2\n:8:0:0\n");
    assert_eq!(map.len(), 2);
    assert_eq!(
        map.get("x"),
        Some(VarLocation::Paged(VarEntry {
            size: 8,
            page_no: 2,
            page_offset: 16,
        }))
    );

    let legacy = map.get("legacy").unwrap().resolve(4);
    assert_eq!(legacy, VarEntry::at(0x2010, 4));
    assert_eq!(legacy.page_no, 2);
    assert_eq!(legacy.offset(), 0x2010);

    assert_eq!(VarMap::parse(&map.to_text()), map);
}

#[test]
fn varmap_loads_every_file() {
    with_setup(|dir| {
        let mut heap = VarMap::new();
        heap.insert("a", VarEntry::at(0, 8));
        heap.write_to(&dir.join("varmap_heap")).unwrap();

        let mut globals = VarMap::new();
        globals.insert("b", VarEntry::at(PAGE_SIZE + 8, 4));
        globals.write_to(&dir.join("varmap_globals")).unwrap();
        std::fs::write(dir.join("unrelated"), "c:1:0:0\n").unwrap();

        let map = VarMap::load_dir(dir).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("b").unwrap().resolve(0).page_no, 1);
        assert_eq!(map.get("c"), None);
    });
}

#[test]
fn unreadable_varmap_is_skipped() {
    with_setup(|dir| {
        let mut heap = VarMap::new();
        heap.insert("a", VarEntry::at(0, 8));
        heap.write_to(&dir.join("varmap_heap")).unwrap();
        // Not UTF-8.
        std::fs::write(dir.join("varmap_old"), [0xff, 0xfe, 0x00]).unwrap();

        let map = VarMap::load_dir(dir).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.get("a").is_some());
    });
}
