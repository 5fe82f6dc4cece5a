#![forbid(unsafe_code)]
//! Mount, recovery and mode transitions of whole volumes on memory and
//! file devices.

use hfs_block::{ByteDevice, DeviceEvent, FileByteDevice, MemoryByteDevice};
use hfs_core::{
    Cnid, FormatOptions, HfsError, Cx, InconsistentReason, MountOptions, MountOutcome,
    MountPhase, SUBTYPE_CASE_SENSITIVE, SUBTYPE_JOURNALED, Volume, format_volume,
};
use hfs_ondisk::{
    Endian, HeaderRecord, JournalInfoBlock, JournalInfoFlags, NodeDescriptor, NodeKind,
    VolumeAttributes, VolumeHeader,
};
use hfs_types::{LAST_MOUNTED_FSCK, LAST_MOUNTED_JOURNALED};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

const DEV_LEN: usize = 16 * 1024 * 1024;

fn formatted(opts: &FormatOptions) -> MemoryByteDevice {
    let dev = MemoryByteDevice::new(DEV_LEN);
    format_volume(Arc::new(dev.clone()), opts).expect("format");
    dev
}

fn quiet() -> MountOptions {
    MountOptions {
        run_mount_scan: false,
        ..MountOptions::default()
    }
}

fn mount(dev: &MemoryByteDevice, opts: MountOptions) -> Volume {
    Volume::mount(Arc::new(dev.clone()), opts).expect("mount")
}

fn disk_header(image: &[u8]) -> VolumeHeader {
    VolumeHeader::parse(&image[1024..1536]).expect("parse header")
}

fn journal_info(image: &[u8]) -> (usize, JournalInfoBlock) {
    let header = disk_header(image);
    let at = header.journal_info_block as usize * header.block_size as usize;
    let jib = JournalInfoBlock::parse(&image[at..at + 512]).expect("jib");
    (at, jib)
}

fn rewrite_journal_info(image: &mut [u8], edit: impl FnOnce(&mut JournalInfoBlock)) {
    let (at, mut jib) = journal_info(image);
    edit(&mut jib);
    jib.encode_into(&mut image[at..at + 512]).expect("encode jib");
}

// ── Mount / unmount ────────────────────────────────────────────────────────

#[test]
fn format_mount_unmount_round_trip() {
    let dev = formatted(&FormatOptions::default());
    let fresh = disk_header(&dev.snapshot());
    assert!(fresh.was_cleanly_unmounted());
    assert!(fresh.is_journaled());
    assert_eq!(fresh.last_mounted_version, LAST_MOUNTED_JOURNALED);

    let vol = mount(&dev, quiet());
    assert_eq!(vol.phase(), MountPhase::Mounted { read_only: false });
    assert!(vol.journal().is_logged());
    vol.sync().expect("sync");
    let live = disk_header(&dev.snapshot());
    assert!(!live.attributes.contains(VolumeAttributes::UNMOUNTED));
    assert_eq!(live.write_count, fresh.write_count.wrapping_add(1));

    vol.unmount().expect("unmount");
    assert_eq!(vol.phase(), MountPhase::Unmounted);
    let clean = disk_header(&dev.snapshot());
    assert!(clean.was_cleanly_unmounted());
    assert!(!clean.is_inconsistent());
    assert_eq!(clean.free_blocks, fresh.free_blocks);
}

#[test]
fn read_only_mount_refuses_writes_and_ignores_sync() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, MountOptions::read_only());
    assert!(vol.is_read_only());
    assert!(matches!(
        vol.create_folder(Cnid::ROOT_FOLDER, "x"),
        Err(HfsError::ReadOnly)
    ));
    vol.sync().expect("sync on read-only mount");
    vol.unmount().expect("unmount");
    assert!(disk_header(&dev.snapshot()).was_cleanly_unmounted());
}

#[test]
fn statfs_reports_reserve_and_subtype() {
    let dev = formatted(&FormatOptions {
        case_sensitive: true,
        ..FormatOptions::default()
    });
    let vol = mount(&dev, quiet());
    let st = vol.statfs();
    let header = vol.header();
    assert_eq!(st.block_size, 4096);
    assert_eq!(st.total_blocks, u64::from(header.total_blocks));
    assert_eq!(st.free_blocks, u64::from(vol.allocator().free_blocks()));
    assert_eq!(
        st.available_blocks,
        st.free_blocks - u64::from(vol.thresholds().danger)
    );
    assert_eq!(st.files, st.total_blocks - 2);
    assert!(st.free_files <= st.available_blocks);
    assert_eq!(st.name_max, 255);
    assert_eq!(st.subtype, SUBTYPE_JOURNALED | SUBTYPE_CASE_SENSITIVE);
    vol.unmount().expect("unmount");
}

#[test]
fn mount_scan_agrees_with_formatted_free_count() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, MountOptions::default());
    let report = vol.wait_for_scan().expect("scan").expect("scan started");
    assert_eq!(report.free_blocks, vol.header().free_blocks);
    assert!(!report.corrected_free_count);
    vol.unmount().expect("unmount");
}

#[test]
fn file_backed_volume_survives_remount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("volume.img");
    let dev: Arc<dyn ByteDevice> =
        Arc::new(FileByteDevice::create(&path, 8 * 1024 * 1024).expect("create"));
    format_volume(Arc::clone(&dev), &FormatOptions::default()).expect("format");
    let vol = Volume::mount(dev, quiet()).expect("mount");
    let cnid = vol.create_file(Cnid::ROOT_FOLDER, "notes.txt").expect("create");
    vol.unmount().expect("unmount");
    drop(vol);

    let dev: Arc<dyn ByteDevice> = Arc::new(FileByteDevice::open(&path).expect("open"));
    let vol = Volume::mount(dev, quiet()).expect("remount");
    let (_, record) = vol.lookup_by_cnid(cnid).expect("lookup").expect("present");
    assert_eq!(record.cnid(), Some(cnid));
    vol.unmount().expect("unmount");
}

// ── Header damage and consistency ──────────────────────────────────────────

#[test]
fn corrupt_primary_falls_back_to_alternate_and_marks_inconsistent() {
    let dev = formatted(&FormatOptions::default());
    let mut image = dev.snapshot();
    image[1024 + 2] = 0x7F;
    let dev = MemoryByteDevice::from_bytes(image);

    let vol = mount(&dev, quiet());
    assert!(vol.header().is_inconsistent());
    vol.unmount().expect("unmount");

    let repaired = disk_header(&dev.snapshot());
    assert!(repaired.is_inconsistent());
    assert!(!repaired.was_cleanly_unmounted());
    assert_eq!(repaired.version, 4);
}

#[test]
fn read_write_mount_of_inconsistent_volume_is_refused() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, quiet());
    vol.mark_inconsistent(InconsistentReason::FsckRequested);
    vol.unmount().expect("unmount");
    assert!(disk_header(&dev.snapshot()).is_inconsistent());

    assert!(matches!(
        Volume::mount(Arc::new(dev.clone()), quiet()),
        Err(HfsError::Inconsistent)
    ));
    let ro = mount(&dev, MountOptions::read_only());
    assert!(matches!(ro.upgrade(), Err(HfsError::Inconsistent)));
    ro.unmount().expect("unmount");

    let forced = mount(
        &dev,
        MountOptions {
            allow_inconsistent_rw: true,
            ..quiet()
        },
    );
    assert!(!forced.is_read_only());
    forced.unmount().expect("unmount");
}

// ── Journal handling ───────────────────────────────────────────────────────

/// Image of a mounted volume with a committed but un-checkpointed folder
/// creation, as if the machine lost power.
fn crashed_image() -> Vec<u8> {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, quiet());
    vol.create_folder(Cnid::ROOT_FOLDER, "docs").expect("mkdir");
    dev.snapshot()
}

#[test]
fn crash_after_commit_is_replayed_at_mount() {
    let dev = MemoryByteDevice::from_bytes(crashed_image());
    let vol = mount(&dev, quiet());
    assert!(vol.replay_report().transactions >= 1);
    assert!(vol.lookup(Cnid::ROOT_FOLDER, "docs").expect("lookup").is_some());
    assert_eq!(vol.header().folder_count, 1);
    assert!(vol.check_trees().is_ok());
    vol.unmount().expect("unmount");
}

#[test]
fn replay_only_mount_stops_after_replay() {
    let dev = MemoryByteDevice::from_bytes(crashed_image());
    let outcome = Volume::open(
        Arc::new(dev.clone()),
        MountOptions {
            journal_replay_only: true,
            ..quiet()
        },
    )
    .expect("open");
    let MountOutcome::Replayed(report) = outcome else {
        panic!("replay-only open mounted the volume");
    };
    assert!(report.transactions >= 1);

    let vol = mount(&dev, quiet());
    assert_eq!(vol.replay_report().transactions, 0);
    assert!(vol.lookup(Cnid::ROOT_FOLDER, "docs").expect("lookup").is_some());
    vol.unmount().expect("unmount");
}

#[test]
fn failed_journal_open_writes_fsck_marker() {
    let dev = formatted(&FormatOptions::default());
    let mut image = dev.snapshot();
    let (_, jib) = journal_info(&image);
    let ring = jib.offset as usize;
    image[ring..ring + 512].fill(0xA5);
    let dev = MemoryByteDevice::from_bytes(image);

    assert!(Volume::mount(Arc::new(dev.clone()), quiet()).is_err());
    let marked = disk_header(&dev.snapshot());
    assert_eq!(marked.last_mounted_version, LAST_MOUNTED_FSCK);

    // A volume not last mounted journaled gets a fresh journal.
    let vol = mount(&dev, quiet());
    assert!(vol.journal().is_logged());
    vol.unmount().expect("unmount");
    assert_eq!(
        disk_header(&dev.snapshot()).last_mounted_version,
        LAST_MOUNTED_JOURNALED
    );
}

#[test]
fn need_init_journal_is_formatted_and_flag_cleared() {
    let dev = formatted(&FormatOptions::default());
    let mut image = dev.snapshot();
    rewrite_journal_info(&mut image, |jib| {
        jib.flags = JournalInfoFlags(jib.flags.0 | JournalInfoFlags::NEED_INIT.0);
    });
    let dev = MemoryByteDevice::from_bytes(image);

    let vol = mount(&dev, quiet());
    assert!(vol.journal().is_logged());
    let (_, jib) = journal_info(&dev.snapshot());
    assert!(!jib.flags.contains(JournalInfoFlags::NEED_INIT));
    assert!(jib.flags.contains(JournalInfoFlags::IN_FS));
    vol.unmount().expect("unmount");
}

#[test]
fn external_journal_is_refused() {
    let dev = formatted(&FormatOptions::default());
    let mut image = dev.snapshot();
    rewrite_journal_info(&mut image, |jib| jib.flags = JournalInfoFlags::ON_OTHER_DEVICE);
    let dev = MemoryByteDevice::from_bytes(image);
    assert!(matches!(
        Volume::mount(Arc::new(dev.clone()), quiet()),
        Err(HfsError::UnsupportedFeature(_))
    ));
    assert_ne!(
        disk_header(&dev.snapshot()).last_mounted_version,
        LAST_MOUNTED_FSCK
    );
}

#[test]
fn journal_disabled_mount_clears_journaled_attribute() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(
        &dev,
        MountOptions {
            journal_disable: true,
            ..quiet()
        },
    );
    assert!(!vol.journal().is_logged());
    assert_eq!(vol.statfs().subtype & SUBTYPE_JOURNALED, 0);
    vol.unmount().expect("unmount");
    assert!(!disk_header(&dev.snapshot()).is_journaled());
}

#[test]
fn trims_follow_committed_frees() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, quiet());
    let run = vol
        .allocate(hfs_core::AllocRequest::exact(8))
        .expect("allocate");
    assert!(vol.allocator().is_allocated(run.start_block).expect("bit"));
    let _ = dev.take_events();
    vol.free(run).expect("free");
    assert_eq!(vol.trimmed_bytes(), 8 * 4096);
    let events = dev.take_events();
    let trim_at = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::Trim { .. }))
        .expect("trim issued");
    assert!(events[..trim_at].iter().any(|e| *e == DeviceEvent::Sync));
    vol.unmount().expect("unmount");
}

// ── Freeze / thaw ──────────────────────────────────────────────────────────

#[test]
fn interrupted_freeze_returns_to_mounted_and_retry_succeeds() {
    let dev = formatted(&FormatOptions::default());
    let vol = Arc::new(mount(&dev, quiet()));

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let writer = {
        let vol = Arc::clone(&vol);
        thread::spawn(move || {
            vol.write_transaction(|_| {
                entered_tx.send(()).expect("send");
                release_rx.recv().expect("release");
                Ok(())
            })
        })
    };
    entered_rx.recv().expect("writer entered");

    let cx = Cx::for_request();
    let canceller = {
        let cx = cx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cx.set_cancel_requested(true);
        })
    };
    assert!(matches!(vol.freeze(&cx), Err(HfsError::Interrupted)));
    canceller.join().expect("canceller");
    assert_eq!(vol.phase(), MountPhase::Mounted { read_only: false });

    release_tx.send(()).expect("release");
    writer.join().expect("writer thread").expect("writer");

    vol.freeze(&Cx::for_request()).expect("freeze");
    assert_eq!(vol.phase(), MountPhase::Frozen);
    vol.thaw().expect("thaw");
    assert!(matches!(vol.thaw(), Err(HfsError::InvalidArgument(_))));
    vol.unmount().expect("unmount");
}

#[test]
fn frozen_volume_holds_writers_until_thaw() {
    let dev = formatted(&FormatOptions::default());
    let vol = Arc::new(mount(&dev, quiet()));
    vol.freeze(&Cx::for_request()).expect("freeze");

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let vol = Arc::clone(&vol);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let result = vol.create_folder(Cnid::ROOT_FOLDER, "later");
            done.store(true, Ordering::SeqCst);
            result
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));
    vol.sync().expect("sync while frozen backs off");

    vol.thaw().expect("thaw");
    writer.join().expect("writer thread").expect("mkdir");
    assert!(vol.lookup(Cnid::ROOT_FOLDER, "later").expect("lookup").is_some());
    vol.unmount().expect("unmount");
}

// ── Mode changes ───────────────────────────────────────────────────────────

#[test]
fn downgrade_closes_journal_before_device_sync() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, quiet());
    vol.create_folder(Cnid::ROOT_FOLDER, "a").expect("mkdir");
    let _ = dev.take_events();

    vol.downgrade().expect("downgrade");
    assert!(vol.is_read_only());
    assert!(vol.journal().is_closed());
    let events = dev.take_events();
    assert_eq!(events.last(), Some(&DeviceEvent::Sync));
    let header_write = events
        .iter()
        .rposition(|e| matches!(e, DeviceEvent::Write { offset: 1024, .. }))
        .expect("header checkpointed");
    assert!(header_write < events.len() - 1);
    assert!(disk_header(&dev.snapshot()).was_cleanly_unmounted());
    assert!(matches!(
        vol.create_folder(Cnid::ROOT_FOLDER, "b"),
        Err(HfsError::ReadOnly)
    ));

    vol.upgrade().expect("upgrade");
    assert!(!vol.is_read_only());
    assert!(vol.journal().is_logged());
    vol.create_folder(Cnid::ROOT_FOLDER, "b").expect("mkdir after upgrade");
    vol.sync().expect("sync");
    assert!(!disk_header(&dev.snapshot()).was_cleanly_unmounted());
    assert_eq!(vol.list(Cnid::ROOT_FOLDER).expect("list").len(), 2);
    vol.unmount().expect("unmount");
}

#[test]
fn unmount_twice_is_busy() {
    let dev = formatted(&FormatOptions::default());
    let vol = mount(&dev, quiet());
    vol.unmount().expect("unmount");
    assert!(matches!(vol.unmount(), Err(HfsError::Busy)));
}

// ── Attributes tree ────────────────────────────────────────────────────────

#[test]
fn attributes_tree_created_with_default_size() {
    let dev = MemoryByteDevice::new(100_000 * 512);
    format_volume(
        Arc::new(dev.clone()),
        &FormatOptions {
            block_size: 512,
            total_blocks: Some(100_000),
            catalog_node_size: 4096,
            journal_size: None,
            ..FormatOptions::default()
        },
    )
    .expect("format");
    let vol = mount(&dev, quiet());
    assert!(vol.attributes_tree().is_none());

    let tree = vol.create_attributes_tree(4096).expect("create");
    let header = tree.header();
    let fork = vol.header().attributes_file;
    assert_eq!(fork, tree.fork_data());
    assert_eq!(u64::from(header.total_nodes), fork.logical_size / 4096);
    assert_eq!(header.free_nodes, header.total_nodes - 1);
    assert!(header.total_nodes >= 2);
    vol.sync().expect("sync");

    let image = dev.snapshot();
    let at = fork.extents[0].start_block as usize * 512;
    let node = &image[at..at + 4096];
    let desc = NodeDescriptor::parse(node, Endian::Big).expect("descriptor");
    assert_eq!(desc.kind, NodeKind::Header);
    assert_eq!(desc.num_records, 3);
    let on_disk = HeaderRecord::parse(node, Endian::Big).expect("header record");
    assert_eq!(on_disk.total_nodes, header.total_nodes);
    assert_eq!(on_disk.node_size, 4096);

    let again = vol.create_attributes_tree(4096).expect("existing");
    assert!(Arc::ptr_eq(&tree, &again));
    vol.unmount().expect("unmount");

    let vol = mount(&dev, quiet());
    assert!(vol.attributes_tree().is_some());
    vol.unmount().expect("unmount");
}
