// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{local_settings, RepoFixture, RepoKind};

use anyhow::Result;
use git2::{Oid, Repository};
use portal_store::{
    store::{workspace::WorkspaceError, BoxError},
    CommitMessage, ErrorKind, ManifestName, Store,
};
use pretty_assertions::assert_eq;
use std::{
    fs::{rename, write},
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{mpsc::channel, Arc},
    thread,
    time::Duration,
};
use tempfile::TempDir;

const SUBDIR: Option<&str> = Some("vms/");

struct Harness {
    _dir: TempDir,
    remote_path: PathBuf,
    clone_dir: PathBuf,
    remote: RepoFixture,
}

impl Harness {
    /// Bare remote with one commit that holds no manifests.
    fn new() -> Result<Self> {
        Self::with_branch("main")
    }

    fn with_branch(branch: &str) -> Result<Self> {
        let dir = TempDir::new()?;
        let remote_path = dir.path().join("remote.git");
        let clone_dir = dir.path().join("cache");
        let remote = RepoFixture::with_branch(&remote_path, RepoKind::Bare, branch)?;
        remote.stage_and_commit("README.md", "VM definitions\n")?;

        Ok(Self {
            _dir: dir,
            remote_path,
            clone_dir,
            remote,
        })
    }

    fn store(&self) -> Store {
        Store::from_settings(&local_settings(&self.remote_path, &self.clone_dir))
    }

    fn local(&self, store: &Store) -> Result<Repository> {
        Ok(Repository::open(store.working_copy())?)
    }
}

fn local_head(repository: &Repository) -> Result<Oid> {
    Ok(repository.refname_to_id("HEAD")?)
}

#[test]
fn list_missing_subdirectory_is_empty() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();

    let names = store.list_manifests(SUBDIR, Some(".yaml"))?;
    assert!(names.is_empty());
    assert!(store.working_copy().join(".git").exists());

    Ok(())
}

#[test]
fn write_manifest_commits_and_pushes() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    let before = harness.remote.commit_count()?;

    let commit = store.write_manifest(
        "demo.yaml",
        "a: 1",
        "Add VM configuration for demo",
        SUBDIR,
    )?;

    assert_eq!(harness.remote.commit_count()?, before + 1);
    assert_eq!(harness.remote.head()?, commit);
    assert_eq!(harness.remote.head_message()?, "Add VM configuration for demo");
    assert_eq!(
        harness.remote.contents("vms/demo.yaml")?,
        Some("a: 1".to_string())
    );
    assert_eq!(store.read_manifest("demo.yaml", SUBDIR)?, "a: 1");

    Ok(())
}

#[test]
fn identical_write_is_noop() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    let message = "Add VM configuration for demo";

    let first = store.write_manifest("demo.yaml", "a: 1", message, SUBDIR)?;
    let count = harness.remote.commit_count()?;
    let second = store.write_manifest("demo.yaml", "a: 1", message, SUBDIR)?;

    assert_eq!(first, second);
    assert_eq!(harness.remote.commit_count()?, count);
    assert_eq!(local_head(&harness.local(&store)?)?, first);

    Ok(())
}

#[test]
fn failed_unit_of_work_rolls_back() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.write_manifest("keep.yaml", "a: 1", "Add VM configuration for keep", SUBDIR)?;
    let original = local_head(&harness.local(&store)?)?;
    let remote_before = harness.remote.head()?;

    let result = store.transaction("update demo", |workspace| -> Result<(), BoxError> {
        workspace.write_manifest("demo.yaml", "a: 1", "first", SUBDIR)?;
        workspace.write_manifest("keep.yaml", "a: 2", "second", SUBDIR)?;
        write(workspace.root().join("stray.txt"), "junk")?;
        write(workspace.root().join("vms/keep.yaml"), "a: 3")?;
        Err("render failed".into())
    });

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transaction);
    assert_eq!(err.operation(), "update demo");

    let status = store.status();
    assert_eq!(status.error, None);
    assert!(!status.is_dirty);
    assert!(status.untracked_files.is_empty());
    assert_eq!(status.latest_commit, Some(original.to_string()));
    assert_eq!(harness.remote.head()?, remote_before);

    let root = store.working_copy();
    assert!(!root.join("stray.txt").exists());
    assert!(!root.join("vms/demo.yaml").exists());
    assert_eq!(store.read_manifest("keep.yaml", SUBDIR)?, "a: 1");

    Ok(())
}

#[test]
fn panicking_unit_of_work_rolls_back() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;
    let original = local_head(&harness.local(&store)?)?;

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        store.transaction("create demo", |workspace| -> Result<(), BoxError> {
            workspace.write_manifest("demo.yaml", "a: 1", "Add VM configuration for demo", SUBDIR)?;
            panic!("renderer blew up");
        })
    }));
    assert!(outcome.is_err());

    // INVARIANT: Lock must be usable again after a panic.
    let status = store.status();
    assert_eq!(status.latest_commit, Some(original.to_string()));
    assert!(!status.is_dirty);
    assert!(status.untracked_files.is_empty());

    Ok(())
}

#[test]
fn push_failure_keeps_local_commit() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;

    let result = store.transaction("create demo", |workspace| -> Result<Oid, BoxError> {
        // INVARIANT: Remote moves on behind our back, so push cannot fast-forward.
        RepoFixture::open(&harness.remote_path)?.stage_and_commit("vms/other.yaml", "b: 2")?;
        Ok(workspace.write_manifest(
            "demo.yaml",
            "a: 1",
            "Add VM configuration for demo",
            SUBDIR,
        )?)
    });

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Push);

    let local = harness.local(&store)?;
    let head = local.head()?.peel_to_commit()?;
    assert_eq!(head.message(), Some("Add VM configuration for demo"));
    assert!(store.working_copy().join("vms/demo.yaml").exists());
    assert_eq!(harness.remote.contents("vms/demo.yaml")?, None);

    Ok(())
}

#[test]
fn push_pending_is_reported_until_reconciled() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;
    let parked = harness.remote_path.with_extension("parked");

    let result = store.transaction("create demo", |workspace| -> Result<Oid, BoxError> {
        let commit = workspace.write_manifest(
            "demo.yaml",
            "a: 1",
            "Add VM configuration for demo",
            SUBDIR,
        )?;
        rename(&harness.remote_path, &parked)?;
        Ok(commit)
    });
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Push);

    // INVARIANT: Unreachable remote still reports pending push.
    let status = store.status();
    assert!(status.error.is_some());
    let pending = status.push_pending.expect("push pending while remote is gone");
    assert_eq!(pending.operation, "create demo");

    rename(&parked, &harness.remote_path)?;
    let status = store.status();
    assert_eq!(status.error, None);
    assert_eq!(status.unpushed_commits, 1);
    assert_eq!(status.push_pending.map(|pending| pending.head), status.latest_commit);

    assert_eq!(store.reconcile()?, 1);
    let status = store.status();
    assert_eq!(status.push_pending, None);
    assert_eq!(status.unpushed_commits, 0);
    assert_eq!(
        harness.remote.contents("vms/demo.yaml")?,
        Some("a: 1".to_string())
    );

    Ok(())
}

#[test]
fn concurrent_transactions_are_serialized() -> Result<()> {
    let harness = Harness::new()?;
    let store = Arc::new(harness.store());
    let before = harness.remote.commit_count()?;

    let handles = (0..6)
        .map(|index| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let name = ManifestName::new(format!("vm-{index}"))?;
                store.write_manifest(
                    &name.file_name(),
                    &format!("index: {index}"),
                    &CommitMessage::Create.render(&name),
                    SUBDIR,
                )?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }

    assert_eq!(harness.remote.commit_count()?, before + 6);
    assert!(harness.remote.is_linear()?);

    let expect = (0..6).map(|index| format!("vm-{index}.yaml")).collect::<Vec<_>>();
    assert_eq!(store.list_manifests(SUBDIR, Some("yaml"))?, expect);
    for index in 0..6 {
        assert_eq!(
            harness.remote.contents(format!("vms/vm-{index}.yaml"))?,
            Some(format!("index: {index}"))
        );
    }

    Ok(())
}

#[test]
fn write_then_read_round_trip() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    let content = "apiVersion: kubevirt.io/v1\nkind: VirtualMachine\nmetadata:\n  name: demo\n";

    store.write_manifest("demo.yaml", content, "Add VM configuration for demo", SUBDIR)?;
    assert_eq!(store.read_manifest("demo.yaml", SUBDIR)?, content);

    Ok(())
}

#[test]
fn delete_then_read_is_not_found() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.write_manifest("demo.yaml", "a: 1", "Add VM configuration for demo", SUBDIR)?;
    store.write_manifest("keep.yaml", "b: 2", "Add VM configuration for keep", SUBDIR)?;

    store.delete_manifest("demo.yaml", "Delete VM configuration for demo", SUBDIR)?;

    let err = store.read_manifest("demo.yaml", SUBDIR).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.list_manifests(SUBDIR, Some(".yaml"))?, vec!["keep.yaml".to_string()]);
    assert_eq!(harness.remote.contents("vms/demo.yaml")?, None);
    assert_eq!(harness.remote.head_message()?, "Delete VM configuration for demo");

    Ok(())
}

#[test]
fn delete_missing_manifest_is_not_found() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;
    let before = harness.remote.head()?;

    let err = store
        .delete_manifest("ghost.yaml", "Delete VM configuration for ghost", SUBDIR)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let source = std::error::Error::source(&err).expect("store error keeps its cause");
    assert!(source.is::<WorkspaceError>());
    assert_eq!(harness.remote.head()?, before);

    Ok(())
}

#[test]
fn escaping_path_is_rejected() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;
    let before = harness.remote.head()?;

    let err = store
        .write_manifest("../escape.yaml", "a: 1", "Add VM configuration", SUBDIR)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    assert!(!store.working_copy().join("escape.yaml").exists());
    assert_eq!(harness.remote.head()?, before);

    Ok(())
}

#[test]
fn ensure_fast_forwards_to_remote() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;

    let upstream = harness.remote.stage_and_commit("vms/other.yaml", "b: 2")?;
    assert_eq!(store.read_manifest("other.yaml", SUBDIR)?, "b: 2");
    assert_eq!(local_head(&harness.local(&store)?)?, upstream);

    Ok(())
}

#[test]
fn ensure_resets_diverged_working_copy() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;

    // INVARIANT: Local commit the remote never saw, plus force-pushed upstream.
    RepoFixture::open(store.working_copy())?.stage_and_commit("vms/local.yaml", "c: 3")?;
    let upstream = harness.remote.force_commit("vms/rewritten.yaml", "d: 4")?;

    let path = store.ensure()?;
    assert_eq!(path, store.working_copy());
    assert_eq!(local_head(&harness.local(&store)?)?, upstream);
    assert_eq!(
        store.list_manifests(SUBDIR, Some(".yaml"))?,
        vec!["rewritten.yaml".to_string()]
    );

    let status = store.status();
    assert!(!status.is_dirty);
    assert_eq!(status.unpushed_commits, 0);

    Ok(())
}

#[test]
fn ensure_follows_rotated_remote_url() -> Result<()> {
    let harness = Harness::new()?;
    harness.store().ensure()?;

    let moved = harness.remote_path.with_extension("moved");
    rename(&harness.remote_path, &moved)?;
    let store = Store::from_settings(&local_settings(&moved, &harness.clone_dir));
    store.ensure()?;

    let local = harness.local(&store)?;
    let origin = local.find_remote("origin")?;
    assert_eq!(origin.url(), Some(moved.display().to_string().as_str()));
    assert_eq!(store.status().remote_url, Some(moved.display().to_string()));

    Ok(())
}

#[test]
fn clone_falls_back_to_master() -> Result<()> {
    let harness = Harness::with_branch("master")?;
    let store = harness.store();

    store.ensure()?;
    let status = store.status();
    assert_eq!(status.active_branch, Some("master".to_string()));

    let commit = store.write_manifest("demo.yaml", "a: 1", "Add VM configuration for demo", SUBDIR)?;
    assert_eq!(harness.remote.head()?, commit);

    Ok(())
}

#[test]
fn clone_falls_back_to_remote_default() -> Result<()> {
    let harness = Harness::with_branch("trunk")?;
    let store = harness.store();

    store.ensure()?;
    assert_eq!(store.status().active_branch, Some("trunk".to_string()));

    Ok(())
}

#[test]
fn empty_remote_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let remote_path = dir.path().join("remote.git");
    let clone_dir = dir.path().join("cache");
    RepoFixture::new(&remote_path, RepoKind::Bare)?;
    let store = Store::from_settings(&local_settings(&remote_path, &clone_dir));

    let err = store.ensure().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyRepository);
    assert!(!store.working_copy().exists());

    Ok(())
}

#[test]
fn status_reports_clean_working_copy() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    let commit = store.write_manifest("demo.yaml", "a: 1", "Add VM configuration for demo", SUBDIR)?;

    let status = store.status();
    assert_eq!(status.error, None);
    assert!(!status.is_dirty);
    assert!(status.untracked_files.is_empty());
    assert_eq!(status.active_branch, Some("main".to_string()));
    assert_eq!(status.latest_commit, Some(commit.to_string()));
    assert_eq!(
        status.remote_url,
        Some(harness.remote_path.display().to_string())
    );
    assert_eq!(status.unpushed_commits, 0);
    assert_eq!(status.push_pending, None);

    Ok(())
}

#[test]
fn status_captures_unreachable_remote() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Store::from_settings(&local_settings(
        dir.path().join("missing.git"),
        dir.path().join("cache"),
    ));

    let status = store.status();
    assert!(status.error.is_some());
    assert!(!status.is_dirty);
    assert_eq!(status.latest_commit, None);
    assert!(!store.working_copy().exists());

    let err = store.ensure().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sync);

    Ok(())
}

#[test]
fn update_requires_existing_manifest() -> Result<()> {
    let harness = Harness::new()?;
    let store = harness.store();
    store.ensure()?;
    let name = ManifestName::new("demo")?;

    let err = store
        .transaction(&format!("update {name}"), |workspace| -> Result<Oid, WorkspaceError> {
            workspace.read_manifest(&name.file_name(), SUBDIR)?;
            workspace.write_manifest(
                &name.file_name(),
                "a: 2",
                &CommitMessage::Update.render(&name),
                SUBDIR,
            )
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!store.working_copy().join("vms/demo.yaml").exists());

    Ok(())
}

#[test]
fn nested_store_call_fails_instead_of_blocking() -> Result<()> {
    let harness = Harness::new()?;
    let store = Arc::new(harness.store());
    store.ensure()?;
    let original = local_head(&harness.local(&store)?)?;

    let (sender, receiver) = channel();
    let inner = Arc::clone(&store);
    thread::spawn(move || {
        let mut nested_read = None;
        let mut nested_status = None;
        let outcome = inner.transaction("update demo", |workspace| -> Result<(), BoxError> {
            workspace.write_manifest("demo.yaml", "a: 1", "Add VM configuration for demo", SUBDIR)?;
            nested_read = Some(inner.read_manifest("demo.yaml", SUBDIR).map_err(|err| err.kind()));
            nested_status = inner.status().error;
            inner.write_manifest("demo.yaml", "a: 2", "Update VM configuration for demo", SUBDIR)?;
            Ok(())
        });
        let _ = sender.send((outcome.map_err(|err| err.kind()), nested_read, nested_status));
    });

    let (outcome, nested_read, nested_status) = receiver.recv_timeout(Duration::from_secs(30))?;
    assert_eq!(outcome, Err(ErrorKind::Reentrant));
    assert_eq!(nested_read, Some(Err(ErrorKind::Reentrant)));
    assert!(nested_status.is_some());

    // INVARIANT: Outer transaction rolled back and store is usable again.
    assert_eq!(local_head(&harness.local(&store)?)?, original);
    assert!(!store.working_copy().join("vms/demo.yaml").exists());
    store.write_manifest("demo.yaml", "a: 3", "Add VM configuration for demo", SUBDIR)?;
    assert_eq!(
        harness.remote.contents("vms/demo.yaml")?,
        Some("a: 3".to_string())
    );

    Ok(())
}
