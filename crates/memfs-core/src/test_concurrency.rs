// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Multi-threaded scenarios against a single mount

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::config::{MountConfig, PageLimit};
use crate::dirindex::tests::colliding_names;
use crate::dirindex::{COOKIE_DOT, COOKIE_EOF};
use crate::pages::PAGE_SIZE;
use crate::types::BindingState;
use crate::{FsError, Mount, Node, NodeSpec, Owner};

const THREADS: usize = 8;

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

fn list_names(mount: &Mount, dir: &Arc<Node>, batch: usize) -> Vec<Vec<u8>> {
    let mut names = Vec::new();
    let mut cookie = COOKIE_DOT;
    loop {
        let page = mount.readdir(dir, cookie, batch).unwrap();
        names.extend(page.entries.into_iter().map(|e| e.name));
        if page.next_cookie == COOKIE_EOF {
            return names;
        }
        cookie = page.next_cookie;
    }
}

/// Run `f(thread_index)` on `THREADS` threads released together.
fn run_parallel<T, F>(f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                f(i)
            })
        })
        .collect();
    workers.into_iter().map(|w| w.join().unwrap()).collect()
}

#[test]
fn concurrent_create_and_unlink_keep_counts_consistent() {
    let mount = Mount::for_tests();
    let shared = mkdir(&mount, &mount.root(), b"shared");

    let m = mount.clone();
    let dir = Arc::clone(&shared);
    let kept: Vec<usize> = run_parallel(move |t| {
        let mut kept = 0;
        for i in 0..200 {
            let name = format!("t{}-{}", t, i);
            mkfile(&m, &dir, name.as_bytes());
            if i % 3 == 0 {
                kept += 1;
            } else {
                m.unlink(&dir, name.as_bytes()).unwrap();
            }
        }
        kept
    });

    let expected: usize = kept.iter().sum();
    let names = list_names(&mount, &shared, 17);
    assert_eq!(names.len(), expected + 2);
    let unique: HashSet<&Vec<u8>> = names.iter().collect();
    assert_eq!(unique.len(), names.len());

    let stats = mount.statfs();
    assert_eq!(stats.nodes_in_use, expected as u64 + 2);
    assert_eq!(stats.live_nodes, expected as u64 + 2);
}

#[test]
fn creating_one_name_from_many_threads_succeeds_once() {
    let mount = Mount::for_tests();
    let root = mount.root();

    let m = mount.clone();
    let dir = Arc::clone(&root);
    let outcomes = run_parallel(move |_| {
        m.create(&dir, b"contended", NodeSpec::Regular, Owner::default(), 0o644)
            .map(|_| ())
    });

    let created = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(created, 1);
    assert!(outcomes
        .iter()
        .all(|r| r.is_ok() || matches!(r, Err(FsError::AlreadyExists))));
    assert_eq!(mount.statfs().nodes_in_use, 2);
}

#[test]
fn readdir_never_repeats_entries_while_names_are_inserted() {
    let mount = Mount::for_tests();
    let d = mkdir(&mount, &mount.root(), b"d");
    let colliding = colliding_names(5);
    let (before, after) = colliding.split_at(colliding.len() / 2);
    for name in before {
        mkfile(&mount, &d, name);
    }
    for i in 0..32 {
        mkfile(&mount, &d, format!("seed{}", i).as_bytes());
    }
    let preexisting: HashSet<Vec<u8>> = list_names(&mount, &d, usize::MAX).into_iter().collect();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let mount = mount.clone();
        let d = Arc::clone(&d);
        let after = after.to_vec();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for (i, name) in after.iter().enumerate() {
                mkfile(&mount, &d, name);
                mkfile(&mount, &d, format!("late{}", i).as_bytes());
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut passes = 0;
    while !done.load(Ordering::SeqCst) || passes < 3 {
        let names = list_names(&mount, &d, 5);
        let unique: HashSet<&Vec<u8>> = names.iter().collect();
        assert_eq!(unique.len(), names.len(), "entry repeated within one listing");
        for name in &preexisting {
            assert!(unique.contains(name), "{:?} skipped", String::from_utf8_lossy(name));
        }
        passes += 1;
    }
    writer.join().unwrap();

    let all = list_names(&mount, &d, 5);
    assert_eq!(all.len(), preexisting.len() + 2 * after.len());
}

#[test]
fn concurrent_writers_never_exceed_the_page_ceiling() {
    let mount = Mount::with_config(MountConfig {
        max_pages: PageLimit::Pages(64),
        ..Default::default()
    });
    let root = mount.root();
    let files: Vec<Arc<Node>> = (0..THREADS)
        .map(|i| mkfile(&mount, &root, format!("w{}", i).as_bytes()))
        .collect();

    let m = mount.clone();
    let targets = files.clone();
    let granted: Vec<u64> = run_parallel(move |t| {
        let file = &targets[t];
        let mut granted = 0;
        for page in 0..32u64 {
            match m.write(file, page * PAGE_SIZE as u64, &[t as u8 + 1; 64]) {
                Ok(_) => granted += 1,
                Err(FsError::OutOfQuota) => {}
                Err(err) => panic!("unexpected write error: {}", err),
            }
        }
        granted
    });

    let stats = mount.statfs();
    assert!(stats.pages_in_use <= 64, "over quota: {:?}", stats);
    assert_eq!(stats.data_pages, granted.iter().sum::<u64>());
    let charged: u64 = files.iter().map(|f| mount.getattr(f).unwrap().pages).sum();
    assert_eq!(charged, stats.data_pages);
    assert_eq!(stats.pages_in_use, 64, "quota left unused: {:?}", stats);
}

#[test]
fn handle_churn_returns_every_reference() {
    let mount = Mount::for_tests();
    let file = mkfile(&mount, &mount.root(), b"f");

    let m = mount.clone();
    let node = Arc::clone(&file);
    run_parallel(move |_| {
        for _ in 0..200 {
            loop {
                match m.get_handle(&node) {
                    Ok(handle) => {
                        assert_eq!(handle.node_id(), node.id());
                        m.drop_handle(handle);
                        break;
                    }
                    Err(FsError::Busy) => continue,
                    Err(err) => panic!("unexpected handle error: {}", err),
                }
            }
        }
    });

    assert_eq!(file.refcount(), 1);
    assert_eq!(mount.statfs().handles, 0);
    assert_eq!(mount.binding_state(&file), BindingState::Unbound);
}

#[test]
fn crossing_renames_between_two_directories_complete() {
    let mount = Mount::for_tests();
    let root = mount.root();
    let a = mkdir(&mount, &root, b"a");
    let b = mkdir(&mount, &root, b"b");
    for i in 0..100 {
        mkfile(&mount, &a, format!("x{}", i).as_bytes());
        mkfile(&mount, &b, format!("y{}", i).as_bytes());
    }

    let movers: Vec<_> = [(Arc::clone(&a), Arc::clone(&b), "x"), (Arc::clone(&b), Arc::clone(&a), "y")]
        .into_iter()
        .map(|(from, to, prefix)| {
            let mount = mount.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let name = format!("{}{}", prefix, i);
                    mount.rename(&from, name.as_bytes(), &to, name.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for mover in movers {
        mover.join().unwrap();
    }

    let in_a = list_names(&mount, &a, usize::MAX);
    let in_b = list_names(&mount, &b, usize::MAX);
    assert_eq!(in_a.len(), 102);
    assert_eq!(in_b.len(), 102);
    assert!(in_a.iter().skip(2).all(|n| n.starts_with(b"y")));
    assert!(in_b.iter().skip(2).all(|n| n.starts_with(b"x")));
    assert_eq!(mount.statfs().nodes_in_use, 203);
}
