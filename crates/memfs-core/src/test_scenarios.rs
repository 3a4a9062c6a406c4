// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios driven through the mount surface
//!
//! Each test builds a fresh mount on an unbounded fixed gauge and checks one
//! externally visible property: lookup after attach/detach, cookie stability
//! under hash collisions, truncate content preservation, quota admission and
//! node reclamation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{MountConfig, PageLimit};
use crate::dirindex::tests::colliding_names;
use crate::dirindex::{is_dup_cookie, name_hash, COOKIE_DOT, COOKIE_EOF, COOKIE_MIN};
use crate::fault::{FaultErrno, FaultOp, FaultPolicy, FaultRule};
use crate::pages::PAGE_SIZE;
use crate::{FsError, Mount, Node, NodeSpec, Owner};

fn mkdir(mount: &Mount, parent: &Arc<Node>, name: &[u8]) -> Arc<Node> {
    mount
        .create(parent, name, NodeSpec::Directory, Owner::default(), 0o755)
        .expect("mkdir")
}

fn mkfile(mount: &Mount, parent: &Arc<Node>, name: &[u8]) -> Arc<Node> {
    mount
        .create(parent, name, NodeSpec::Regular, Owner::default(), 0o644)
        .expect("create")
}

/// Walk a directory in batches of `batch`, returning (name, cookie) pairs.
fn list_in_batches(mount: &Mount, dir: &Arc<Node>, batch: usize) -> Vec<(Vec<u8>, u64)> {
    let mut out = Vec::new();
    let mut cookie = COOKIE_DOT;
    loop {
        let page = mount.readdir(dir, cookie, batch).unwrap();
        out.extend(page.entries.into_iter().map(|e| (e.name, e.cookie)));
        if page.next_cookie == COOKIE_EOF {
            return out;
        }
        assert_ne!(page.next_cookie, cookie, "readdir made no progress");
        cookie = page.next_cookie;
    }
}

#[test]
fn colliding_names_survive_detach_of_a_sibling() {
    let mount = Mount::for_tests();
    let root = mount.root();
    let d = mkdir(&mount, &root, b"d");
    assert_eq!(name_hash(b"aa"), name_hash(b"b@"));

    mkfile(&mount, &d, b"aa");
    let b = mkfile(&mount, &d, b"b@");
    mount.unlink(&d, b"aa").unwrap();

    let found = mount.lookup(&d, b"b@").unwrap();
    assert!(Arc::ptr_eq(found.node().unwrap(), &b));
    assert!(matches!(mount.lookup(&d, b"aa"), Err(FsError::NotFound)));

    let listing = mount.readdir(&d, COOKIE_DOT, usize::MAX).unwrap();
    let names: Vec<&[u8]> = listing.entries.iter().map(|e| e.name.as_slice()).collect();
    assert_eq!(names, vec![&b"."[..], &b".."[..], &b"b@"[..]]);
    assert_eq!(listing.entries[1].id, root.id());
    assert_eq!(listing.next_cookie, COOKIE_EOF);
}

#[test]
fn lookup_follows_the_latest_attach_for_each_name() {
    let mount = Mount::for_tests();
    let root = mount.root();
    let d = mkdir(&mount, &root, b"d");
    let pool = colliding_names(3);
    let mut model: HashMap<Vec<u8>, Arc<Node>> = HashMap::new();

    // Deterministic create/unlink churn over colliding and plain names.
    let mut names = pool.clone();
    names.extend([b"plain".to_vec(), b"other".to_vec()]);
    for round in 0..5 {
        for (i, name) in names.iter().enumerate() {
            if (i + round) % 3 == 0 {
                if model.remove(name).is_some() {
                    mount.unlink(&d, name).unwrap();
                }
            } else if !model.contains_key(name) {
                model.insert(name.clone(), mkfile(&mount, &d, name));
            }
        }
        for name in &names {
            match (mount.lookup(&d, name), model.get(name)) {
                (Ok(entry), Some(node)) => assert!(Arc::ptr_eq(entry.node().unwrap(), node)),
                (Err(FsError::NotFound), None) => {}
                (got, want) => panic!(
                    "{:?}: lookup {:?} but expected {:?}",
                    String::from_utf8_lossy(name),
                    got.map(|e| e.node().map(|n| n.id())),
                    want.map(|n| n.id())
                ),
            }
        }
    }

    // A replacement under the same name wins over the first.
    let name = &pool[0];
    if model.remove(name).is_some() {
        mount.unlink(&d, name).unwrap();
    }
    let first = mkfile(&mount, &d, name);
    mount.unlink(&d, name).unwrap();
    let second = mkfile(&mount, &d, name);
    assert!(first.is_destroyed());
    assert!(Arc::ptr_eq(mount.lookup(&d, name).unwrap().node().unwrap(), &second));
}

#[test]
fn every_colliding_entry_is_listed_exactly_once() {
    for blocks in [1u32, 2, 4, 6] {
        let mount = Mount::for_tests();
        let root = mount.root();
        let d = mkdir(&mount, &root, b"d");
        let names = colliding_names(blocks);
        for name in &names {
            mkfile(&mount, &d, name);
        }
        mkfile(&mount, &d, b"unrelated");

        for batch in [1usize, 3, 7, usize::MAX] {
            let listing = list_in_batches(&mount, &d, batch);
            let stored: Vec<&(Vec<u8>, u64)> = listing.iter().skip(2).collect();
            assert_eq!(stored.len(), names.len() + 1, "blocks={} batch={}", blocks, batch);

            let seen: HashSet<&[u8]> = stored.iter().map(|(n, _)| n.as_slice()).collect();
            assert_eq!(seen.len(), stored.len(), "duplicate name in listing");
            let cookies: HashSet<u64> = stored.iter().map(|(_, c)| *c).collect();
            assert_eq!(cookies.len(), stored.len(), "duplicate cookie in listing");
            for name in &names {
                assert!(seen.contains(name.as_slice()));
            }
            for (name, cookie) in &stored {
                assert!(*cookie >= COOKIE_MIN);
                if name.as_slice() != b"unrelated" {
                    assert!(is_dup_cookie(*cookie), "{:#x}", cookie);
                }
            }
        }
    }
}

#[test]
fn resuming_at_a_removed_duplicate_continues_with_its_successor() {
    let mount = Mount::for_tests();
    let root = mount.root();
    let d = mkdir(&mount, &root, b"d");
    let names = colliding_names(2);
    for name in &names {
        mkfile(&mount, &d, name);
    }

    let first = mount.readdir(&d, COOKIE_MIN, 1).unwrap();
    assert_eq!(first.entries.len(), 1);
    let resume = first.next_cookie;
    let removed = names
        .iter()
        .find(|n| mount.lookup(&d, n).unwrap().cookie() == resume)
        .cloned()
        .expect("entry at the resume cookie");
    mount.unlink(&d, &removed).unwrap();

    let rest = mount.readdir(&d, resume, usize::MAX).unwrap();
    let mut seen: Vec<Vec<u8>> = first.entries.into_iter().map(|e| e.name).collect();
    seen.extend(rest.entries.into_iter().map(|e| e.name));
    assert_eq!(seen.len(), names.len() - 1);
    assert!(!seen.contains(&removed));
    let unique: HashSet<&Vec<u8>> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len());
    assert_eq!(rest.next_cookie, COOKIE_EOF);
}

#[test]
fn removed_duplicate_resumes_correctly_across_colliding_chains() {
    let mount = Mount::for_tests();
    let root = mount.root();
    let d = mkdir(&mount, &root, b"d");
    let mut prefixes = [b'x', b'y'];
    prefixes.sort_by_key(|&p| std::cmp::Reverse(name_hash(&[p, b'a', b'a'])));
    for p in prefixes {
        mkfile(&mount, &d, &[p, b'a', b'a']);
        mkfile(&mount, &d, &[p, b'b', b'@']);
    }

    let first = mount.readdir(&d, COOKIE_MIN, 3).unwrap();
    let resume = first.next_cookie;
    let removed = [prefixes[0], b'b', b'@'].to_vec();
    assert_eq!(mount.lookup(&d, &removed).unwrap().cookie(), resume);
    mount.unlink(&d, &removed).unwrap();
    mkfile(&mount, &d, b"unrelated-insert");

    let rest = mount.readdir(&d, resume, usize::MAX).unwrap();
    let mut seen: Vec<Vec<u8>> = first.entries.into_iter().map(|e| e.name).collect();
    seen.extend(
        rest.entries
            .into_iter()
            .map(|e| e.name)
            .filter(|n| n.as_slice() != b"unrelated-insert"),
    );
    assert_eq!(seen.len(), 3);
    assert!(!seen.contains(&removed));
    let unique: HashSet<&Vec<u8>> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len());
}

#[test]
fn truncate_down_and_back_up_keeps_head_and_zeroes_the_rest() {
    let mount = Mount::for_tests();
    let file = mkfile(&mount, &mount.root(), b"f");
    let content: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8 + 1).collect();
    mount.write(&file, 0, &content).unwrap();
    assert_eq!(mount.statfs().data_pages, 3);

    let size = content.len() as u64;
    mount.truncate(&file, size).unwrap();
    assert_eq!(mount.statfs().data_pages, 3);

    mount.truncate(&file, PAGE_SIZE as u64).unwrap();
    assert_eq!(mount.statfs().data_pages, 1);
    mount.truncate(&file, size).unwrap();
    assert_eq!(mount.getattr(&file).unwrap().size, size);
    assert_eq!(mount.statfs().data_pages, 1);

    let mut back = vec![0xffu8; content.len()];
    assert_eq!(mount.read(&file, 0, &mut back).unwrap(), content.len());
    assert_eq!(&back[..PAGE_SIZE], &content[..PAGE_SIZE]);
    assert!(back[PAGE_SIZE..].iter().all(|&b| b == 0));
}

#[test]
fn truncate_inside_a_page_zero_fills_the_reintroduced_tail() {
    let mount = Mount::for_tests();
    let file = mkfile(&mount, &mount.root(), b"f");
    mount.write(&file, 0, &[9u8; PAGE_SIZE]).unwrap();
    mount.truncate(&file, 10).unwrap();
    mount.truncate(&file, PAGE_SIZE as u64).unwrap();

    let mut back = [0xffu8; PAGE_SIZE];
    mount.read(&file, 0, &mut back).unwrap();
    assert!(back[..10].iter().all(|&b| b == 9));
    assert!(back[10..].iter().all(|&b| b == 0));
}

#[test]
fn quota_refuses_exactly_the_requests_past_the_ceiling() {
    for ceiling in [1u64, 2, 5, 16] {
        let mount = Mount::with_config(MountConfig {
            max_pages: PageLimit::Pages(ceiling),
            ..Default::default()
        });
        let file = mkfile(&mount, &mount.root(), b"f");
        let in_use = mount.statfs().pages_in_use;
        assert!(in_use <= ceiling);
        let room = ceiling - in_use;

        for requested in 0..=room + 2 {
            assert_eq!(
                mount.query_admission(requested),
                in_use + requested <= ceiling,
                "ceiling={} requested={}",
                ceiling,
                requested
            );
        }

        if room > 0 {
            mount.write(&file, 0, &vec![1u8; room as usize * PAGE_SIZE]).unwrap();
        }
        assert_eq!(mount.statfs().pages_in_use, ceiling);
        let past = room * PAGE_SIZE as u64;
        assert!(matches!(mount.write(&file, past, b"x"), Err(FsError::OutOfQuota)));
        assert_eq!(mount.statfs().data_pages, room);
        assert_eq!(mount.getattr(&file).unwrap().size, past);
    }
}

#[test]
fn zero_and_unlimited_ceilings_are_the_extremes() {
    let zero = Mount::with_config(MountConfig {
        max_pages: PageLimit::Pages(0),
        ..Default::default()
    });
    assert!(zero.query_admission(0));
    assert!(!zero.query_admission(1));
    assert!(matches!(
        zero.create(&zero.root(), b"f", NodeSpec::Regular, Owner::default(), 0o644),
        Err(FsError::OutOfQuota)
    ));

    let unlimited = Mount::for_tests();
    assert_eq!(unlimited.statfs().pages_max, None);
    assert!(unlimited.query_admission(u64::MAX / 2));
    let file = mkfile(&unlimited, &unlimited.root(), b"f");
    unlimited.write(&file, 0, &vec![3u8; 64 * PAGE_SIZE]).unwrap();
    assert_eq!(unlimited.statfs().data_pages, 64);
}

#[test]
fn reachable_nodes_hold_references_and_released_ones_vanish() {
    let mount = Mount::for_tests();
    let root = mount.root();
    let d = mkdir(&mount, &root, b"d");
    let f = mkfile(&mount, &d, b"f");
    mount.link(&root, b"alias", &f).unwrap();
    mkfile(&mount, &d, b"g");

    let mut dirs = vec![Arc::clone(&root)];
    while let Some(dir) = dirs.pop() {
        let listing = mount.readdir(&dir, COOKIE_MIN, usize::MAX).unwrap();
        for info in listing.entries {
            let entry = mount.lookup(&dir, &info.name).unwrap();
            let node = entry.node().unwrap();
            assert!(node.refcount() >= 1, "node {} unreferenced", node.id());
            if node.is_dir() {
                dirs.push(Arc::clone(node));
            }
        }
    }

    // An extra holder keeps the unlinked file alive but out of the namespace.
    mount.acquire(&f).unwrap();
    mount.unlink(&d, b"f").unwrap();
    mount.unlink(&root, b"alias").unwrap();
    assert!(!f.is_destroyed());
    assert!(matches!(mount.lookup(&d, b"f"), Err(FsError::NotFound)));
    assert!(mount.live_nodes().iter().any(|n| Arc::ptr_eq(n, &f)));

    mount.release(&f);
    assert!(f.is_destroyed());
    assert!(!mount.live_nodes().iter().any(|n| Arc::ptr_eq(n, &f)));
    assert!(matches!(mount.acquire(&f), Err(FsError::NotFound)));
    assert!(matches!(mount.get_handle(&f), Err(FsError::NotFound)));
    assert_eq!(mount.statfs().nodes_in_use, 3);
}

#[test]
fn zero_fill_failure_surfaces_through_truncate_and_hole_punch() {
    let mount = Mount::for_tests();
    let file = mkfile(&mount, &mount.root(), b"f");
    mount.write(&file, 0, &[5u8; 2 * PAGE_SIZE]).unwrap();
    mount
        .faults()
        .set_policy(FaultPolicy::single(FaultRule::always(FaultOp::ZeroFill, FaultErrno::Eio)));

    let err = mount.truncate(&file, 100).unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert_eq!(mount.getattr(&file).unwrap().size, 2 * PAGE_SIZE as u64);
    assert_eq!(mount.statfs().data_pages, 2);

    assert!(matches!(mount.punch_hole(&file, 10, 20), Err(FsError::Io(_))));
    // Page-aligned truncation needs no zero fill.
    mount.truncate(&file, PAGE_SIZE as u64).unwrap();
    assert_eq!(mount.statfs().data_pages, 1);
    assert_eq!(mount.faults().injected(), 2);

    mount.faults().clear();
    mount.truncate(&file, 100).unwrap();
    let mut back = [0u8; 100];
    mount.read(&file, 0, &mut back).unwrap();
    assert!(back.iter().all(|&b| b == 5));
}

#[test]
fn truncate_ignoring_errors_shrinks_despite_zero_fill_failure() {
    let mount = Mount::for_tests();
    let file = mkfile(&mount, &mount.root(), b"f");
    mount.write(&file, 0, &[5u8; 3 * PAGE_SIZE]).unwrap();
    mount
        .faults()
        .set_policy(FaultPolicy::single(FaultRule::always(FaultOp::ZeroFill, FaultErrno::Eio)));

    assert!(matches!(mount.truncate_with(&file, 100, false), Err(FsError::Io(_))));
    assert_eq!(mount.statfs().data_pages, 3);

    mount.truncate_with(&file, 100, true).unwrap();
    assert_eq!(mount.getattr(&file).unwrap().size, 100);
    assert_eq!(mount.statfs().data_pages, 1);
    assert_eq!(mount.faults().injected(), 2);

    // The failed zero fill left the bytes past the new size in place.
    mount.faults().clear();
    mount.truncate(&file, 200).unwrap();
    let mut back = [0u8; 200];
    assert_eq!(mount.read(&file, 0, &mut back).unwrap(), 200);
    assert!(back.iter().all(|&b| b == 5));
}

#[test]
fn page_alloc_fault_leaves_the_file_unchanged() {
    let mount = Mount::for_tests();
    let file = mkfile(&mount, &mount.root(), b"f");
    mount.write(&file, 0, b"head").unwrap();
    mount
        .faults()
        .set_policy(FaultPolicy::single(FaultRule::always(FaultOp::PageAlloc, FaultErrno::Enomem)));

    assert!(matches!(
        mount.write(&file, PAGE_SIZE as u64, b"tail"),
        Err(FsError::OutOfMemory)
    ));
    assert_eq!(mount.getattr(&file).unwrap().size, 4);
    // Writes into an already backed page need no allocation.
    mount.write(&file, 0, b"HEAD").unwrap();
    assert_eq!(mount.statfs().data_pages, 1);
}

#[test]
fn system_reserve_binds_every_mount_sharing_a_budget() {
    use crate::accounting::{FixedMemory, SystemBudget};

    let gauge = Arc::new(FixedMemory::new(40, 1000));
    let budget = Arc::new(SystemBudget::new(gauge.clone(), 32));
    let a = Mount::new(MountConfig::default(), Arc::clone(&budget));
    let b = Mount::new(MountConfig::default(), budget);

    let fa = mkfile(&a, &a.root(), b"f");
    let fb = mkfile(&b, &b.root(), b"f");
    a.write(&fa, 0, &vec![1u8; 8 * PAGE_SIZE]).unwrap();
    gauge.set_free(40 - 8);
    assert!(matches!(b.write(&fb, 0, b"x"), Err(FsError::OutOfMemory)));
    assert!(!b.query_admission(1));

    a.truncate(&fa, 0).unwrap();
    gauge.set_free(40);
    b.write(&fb, 0, b"x").unwrap();
}

#[test]
fn percent_page_limit_is_sampled_from_total_memory() {
    use crate::accounting::{FixedMemory, SystemBudget};

    let budget = SystemBudget::new(Arc::new(FixedMemory::new(1 << 20, 400)), 0);
    let mount = Mount::new(
        MountConfig {
            max_pages: PageLimit::Percent(25),
            ..Default::default()
        },
        Arc::new(budget),
    );
    assert_eq!(mount.statfs().pages_max, Some(100));
}
