#![forbid(unsafe_code)]
//! Catalog create, lookup, list and remove through a mounted volume.

use hfs_block::MemoryByteDevice;
use hfs_core::{
    AllocRequest, CatalogRecord, Cnid, FormatOptions, HfsError, MountOptions, Volume,
    format_volume,
};
use hfs_ondisk::extents::FORK_DATA;
use hfs_ondisk::{
    CatalogKey, ExtentKey, ExtentRecord, FolderRecord, UniName, VolumeAttributes, VolumeHeader,
};
use proptest::prelude::*;
use std::sync::Arc;

fn volume(opts: &FormatOptions) -> (MemoryByteDevice, Volume) {
    let dev = MemoryByteDevice::new(16 * 1024 * 1024);
    format_volume(Arc::new(dev.clone()), opts).expect("format");
    let vol = Volume::mount(
        Arc::new(dev.clone()),
        MountOptions {
            run_mount_scan: false,
            ..MountOptions::default()
        },
    )
    .expect("mount");
    (dev, vol)
}

fn folder(vol: &Volume, cnid: Cnid) -> FolderRecord {
    match vol.lookup_by_cnid(cnid).expect("lookup").expect("present") {
        (_, CatalogRecord::Folder(f)) => f,
        (_, other) => panic!("expected folder, got {other:?}"),
    }
}

#[test]
fn root_folder_is_reachable_by_name_and_cnid() {
    let (_dev, vol) = volume(&FormatOptions {
        volume_name: "Macintosh HD".to_owned(),
        ..FormatOptions::default()
    });
    let by_name = vol
        .lookup(Cnid::ROOT_PARENT, "Macintosh HD")
        .expect("lookup")
        .expect("root");
    assert_eq!(by_name.cnid(), Some(Cnid::ROOT_FOLDER));
    let (key, _) = vol
        .lookup_by_cnid(Cnid::ROOT_FOLDER)
        .expect("lookup")
        .expect("root");
    assert_eq!(key.parent_id, Cnid::ROOT_PARENT);
    assert_eq!(key.name.to_string(), "Macintosh HD");
}

#[test]
fn create_updates_valence_and_volume_counts() {
    let (_dev, vol) = volume(&FormatOptions::default());
    let docs = vol.create_folder(Cnid::ROOT_FOLDER, "docs").expect("mkdir");
    let note = vol.create_file(docs, "note.txt").expect("create");
    assert_eq!(docs, Cnid::FIRST_USER);
    assert_eq!(note, Cnid(Cnid::FIRST_USER.0 + 1));

    let root = folder(&vol, Cnid::ROOT_FOLDER);
    assert_eq!(root.valence, 1);
    assert_eq!(root.folder_count, 1);
    assert_eq!(folder(&vol, docs).valence, 1);

    let header = vol.header();
    assert_eq!(header.folder_count, 1);
    assert_eq!(header.file_count, 1);
    assert_eq!(header.next_catalog_id, note.0 + 1);

    match vol.lookup(docs, "note.txt").expect("lookup") {
        Some(CatalogRecord::File(f)) => assert_eq!(f.file_id, note),
        other => panic!("expected file, got {other:?}"),
    }
    vol.unmount().expect("unmount");
}

#[test]
fn duplicate_and_bad_names_are_rejected() {
    let (_dev, vol) = volume(&FormatOptions::default());
    vol.create_file(Cnid::ROOT_FOLDER, "a").expect("create");
    assert!(matches!(
        vol.create_file(Cnid::ROOT_FOLDER, "a"),
        Err(HfsError::Exists)
    ));
    assert!(matches!(
        vol.create_folder(Cnid::ROOT_FOLDER, "A"),
        Err(HfsError::Exists)
    ));
    assert!(matches!(
        vol.create_file(Cnid::ROOT_FOLDER, ""),
        Err(HfsError::InvalidArgument(_))
    ));
    assert!(matches!(
        vol.create_file(Cnid::ROOT_FOLDER, &"n".repeat(256)),
        Err(HfsError::NameTooLong)
    ));
    assert!(matches!(
        vol.create_file(Cnid(9999), "orphan"),
        Err(HfsError::NotFound(_))
    ));
    assert_eq!(vol.header().file_count, 1);
    vol.unmount().expect("unmount");
}

#[test]
fn case_sensitive_volume_keeps_names_distinct() {
    let (_dev, vol) = volume(&FormatOptions {
        case_sensitive: true,
        ..FormatOptions::default()
    });
    vol.create_file(Cnid::ROOT_FOLDER, "a").expect("create");
    vol.create_file(Cnid::ROOT_FOLDER, "A").expect("create upper");
    assert_eq!(vol.list(Cnid::ROOT_FOLDER).expect("list").len(), 2);
    vol.unmount().expect("unmount");
}

#[test]
fn remove_requires_empty_folder_and_restores_counts() {
    let (_dev, vol) = volume(&FormatOptions::default());
    let docs = vol.create_folder(Cnid::ROOT_FOLDER, "docs").expect("mkdir");
    vol.create_file(docs, "x").expect("create");
    assert!(matches!(
        vol.remove(Cnid::ROOT_FOLDER, "docs"),
        Err(HfsError::NotEmpty)
    ));

    vol.remove(docs, "x").expect("rm");
    vol.remove(Cnid::ROOT_FOLDER, "docs").expect("rmdir");
    assert!(vol.lookup(Cnid::ROOT_FOLDER, "docs").expect("lookup").is_none());
    assert!(vol.lookup_by_cnid(docs).expect("lookup").is_none());
    assert_eq!(folder(&vol, Cnid::ROOT_FOLDER).valence, 0);
    let header = vol.header();
    assert_eq!((header.file_count, header.folder_count), (0, 0));
    assert!(matches!(
        vol.remove(Cnid::ROOT_FOLDER, "docs"),
        Err(HfsError::NotFound(_))
    ));
    vol.unmount().expect("unmount");
}

#[test]
fn removing_a_file_frees_inline_and_overflow_extents() {
    let (_dev, vol) = volume(&FormatOptions::default());
    let cnid = vol.create_file(Cnid::ROOT_FOLDER, "big").expect("create");
    let Some(CatalogRecord::File(mut file)) = vol.lookup(Cnid::ROOT_FOLDER, "big").expect("lookup")
    else {
        panic!("file record");
    };
    let key = CatalogKey::new(Cnid::ROOT_FOLDER, UniName::from_str_lossless("big").expect("name"));
    let free_before = vol.allocator().free_blocks();

    // Nine single-block runs: eight inline, one in the overflow tree.
    vol.write_transaction(|txn| {
        let mut runs = Vec::new();
        for _ in 0..9 {
            runs.push(vol.allocator().allocate(txn, AllocRequest::exact(1))?);
            // Keep a gap so neighbouring runs stay separate.
            vol.allocator().allocate(txn, AllocRequest::exact(1))?;
        }
        file.data_fork.total_blocks = 9;
        file.data_fork.logical_size = 9 * 4096;
        file.data_fork.extents.copy_from_slice(&runs[..8]);
        let mut overflow = ExtentRecord::default();
        overflow.0[0] = runs[8];
        let overflow_key = ExtentKey {
            fork_type: FORK_DATA,
            file_id: cnid,
            start_block: 8,
        };
        vol.extents_tree().insert(
            txn,
            &overflow_key.encode(),
            &overflow.encode().expect("encode extents"),
        )?;
        let data = CatalogRecord::File(file.clone())
            .encode()
            .expect("encode file");
        vol.catalog_tree().replace(txn, &key.encode(), &data)?;
        Ok(())
    })
    .expect("grow file");
    assert_eq!(vol.allocator().free_blocks(), free_before - 18);
    assert_eq!(vol.extents_tree().leaf_records(), 1);

    vol.remove(Cnid::ROOT_FOLDER, "big").expect("rm");
    assert_eq!(vol.allocator().free_blocks(), free_before - 9);
    assert_eq!(vol.extents_tree().leaf_records(), 0);
    vol.unmount().expect("unmount");
}

#[test]
fn catalog_survives_remount() {
    let (dev, vol) = volume(&FormatOptions::default());
    let docs = vol.create_folder(Cnid::ROOT_FOLDER, "docs").expect("mkdir");
    for name in ["c", "a", "b"] {
        vol.create_file(docs, name).expect("create");
    }
    vol.unmount().expect("unmount");

    let vol = Volume::mount(Arc::new(dev), MountOptions::read_only()).expect("remount");
    let names: Vec<String> = vol
        .list(docs)
        .expect("list")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["a", "b", "c"]);
    assert_eq!(vol.header().file_count, 3);
    assert!(vol.check_trees().is_ok());
    vol.unmount().expect("unmount");
}

#[test]
fn wrapped_cnid_counter_sets_reused_flag_and_skips_live_ids() {
    let dev = MemoryByteDevice::new(16 * 1024 * 1024);
    format_volume(Arc::new(dev.clone()), &FormatOptions::default()).expect("format");
    let vol = Volume::mount(Arc::new(dev.clone()), MountOptions::default()).expect("mount");
    let first = vol.create_file(Cnid::ROOT_FOLDER, "first").expect("create");
    assert_eq!(first, Cnid::FIRST_USER);
    vol.unmount().expect("unmount");

    // Move the on-disk counter to the top of the range.
    let mut image = dev.snapshot();
    let mut header = VolumeHeader::parse(&image[1024..1536]).expect("parse header");
    header.next_catalog_id = u32::MAX;
    header.encode_into(&mut image[1024..1536]).expect("encode header");
    let dev = MemoryByteDevice::from_bytes(image);
    let vol = Volume::mount(
        Arc::new(dev),
        MountOptions {
            run_mount_scan: false,
            ..MountOptions::default()
        },
    )
    .expect("remount");

    let top = vol.create_file(Cnid::ROOT_FOLDER, "top").expect("create");
    assert_eq!(top, Cnid(u32::MAX));
    let wrapped = vol.create_file(Cnid::ROOT_FOLDER, "wrapped").expect("create");
    assert_eq!(wrapped, Cnid(Cnid::FIRST_USER.0 + 1));
    assert!(vol.header().attributes.contains(VolumeAttributes::CNIDS_REUSED));
    vol.unmount().expect("unmount");
}

#[test]
fn create_failing_for_space_leaves_no_partial_entry() {
    let (_dev, vol) = volume(&FormatOptions::default());
    vol.write_transaction(|txn| {
        while vol.allocator().free_blocks() > 0 {
            let free = vol.allocator().free_blocks();
            vol.allocator().allocate(txn, AllocRequest::range(1, free))?;
        }
        Ok(())
    })
    .expect("drain");

    // Long names fill catalog nodes quickly; the tree cannot grow.
    let mut failed = None;
    for i in 0..4000 {
        let name = format!("{i:06}{}", "x".repeat(200));
        match vol.create_file(Cnid::ROOT_FOLDER, &name) {
            Ok(_) => {}
            Err(err) => {
                assert!(err.is_exhaustion(), "unexpected error {err:?}");
                failed = Some(name);
                break;
            }
        }
    }
    let failed = failed.expect("catalog never filled");

    assert!(vol.lookup(Cnid::ROOT_FOLDER, &failed).expect("lookup").is_none());
    let listed = vol.list(Cnid::ROOT_FOLDER).expect("list");
    assert!(listed.iter().all(|e| e.name != failed));
    let header = vol.header();
    assert_eq!(listed.len(), header.file_count as usize);
    assert_eq!(folder(&vol, Cnid::ROOT_FOLDER).valence as usize, listed.len());
    assert_eq!(vol.catalog_tree().leaf_records() as usize, 2 * listed.len() + 2);
    assert!(vol.check_trees().is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn listing_matches_created_names(names in proptest::collection::btree_set("[a-z]{1,12}", 1..40)) {
        let (_dev, vol) = volume(&FormatOptions::default());
        for name in &names {
            vol.create_file(Cnid::ROOT_FOLDER, name).expect("create");
        }
        let listed: Vec<String> = vol
            .list(Cnid::ROOT_FOLDER)
            .expect("list")
            .into_iter()
            .map(|e| e.name)
            .collect();
        let expected: Vec<String> = names.iter().cloned().collect();
        prop_assert_eq!(listed, expected);
        prop_assert_eq!(folder(&vol, Cnid::ROOT_FOLDER).valence as usize, names.len());
        let checks = vol.check_trees().expect("check");
        for check in checks {
            prop_assert_eq!(
                check.total_nodes,
                check.free_nodes + check.reachable + check.map_nodes + 1
            );
        }
        vol.unmount().expect("unmount");
    }
}
