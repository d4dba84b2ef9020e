// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{refs_of, remotes_of, snapshot, SysrootFixture, COMBINED_CONFIG};

use anyhow::Result;
use indoc::formatdoc;
use ostree_split::{
    clone, path,
    repo::{
        lock::{LockError, LockKind},
        RepoError,
    },
    split::NEW_REPO_NAME,
    swap, Repo, SplitError, SplitOptions, SplitState, Splitter,
};
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{
    env, fs,
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
};
use tempfile::TempDir;

fn endless_fixture() -> Result<SysrootFixture> {
    let fixture = SysrootFixture::new(COMBINED_CONFIG)?;
    fixture.add_ref("eos:os/eos/amd64/eos5", '1')?;
    fixture.add_ref("flathub:app/org.foo/x86_64/stable", '2')?;
    fixture.add_ref("flathub:appstream2/x86_64", '3')?;
    fixture.add_ref("eos:ostree-metadata", '4')?;
    fixture.add_ref("flathub:ostree-metadata", '5')?;
    fixture.add_object("ab/cdef.commit", "commit")?;
    fixture.add_object("12/3456.file", "file")?;

    Ok(fixture)
}

fn splitter(fixture: &SysrootFixture) -> Splitter {
    Splitter::new(fixture.layout().clone(), SplitOptions::default())
}

#[test]
fn split_combined_repository() -> Result<()> {
    let fixture = endless_fixture()?;
    let layout = fixture.layout();
    let splitter = splitter(&fixture);
    assert_eq!(splitter.state()?, SplitState::Unsplit);

    assert!(splitter.run()?);
    assert_eq!(splitter.state()?, SplitState::Complete);

    assert_eq!(refs_of(layout.os_repo())?, vec!["eos:os/eos/amd64/eos5"]);
    assert_eq!(remotes_of(layout.os_repo())?, vec!["eos"]);
    assert_eq!(
        refs_of(layout.flatpak_repo())?,
        vec!["flathub:app/org.foo/x86_64/stable", "flathub:appstream2/x86_64"]
    );
    assert_eq!(remotes_of(layout.flatpak_repo())?, vec!["flathub"]);

    let os_repo = Repo::open(layout.os_repo())?;
    let flatpak_repo = Repo::open(layout.flatpak_repo())?;
    assert_eq!(os_repo.mode()?.as_deref(), Some("bare"));
    assert_eq!(flatpak_repo.mode()?.as_deref(), Some("bare-user-only"));

    let meta = fs::symlink_metadata(layout.flatpak_dir())?;
    assert!(meta.is_dir());
    let meta = fs::symlink_metadata(layout.flatpak_repo())?;
    assert!(meta.is_dir());
    assert!(!fixture.shared_dir().exists());
    assert!(!layout.flatpak_dir().join(NEW_REPO_NAME).exists());

    let os_object = fs::metadata(layout.os_repo().join("objects/ab/cdef.commit"))?;
    let fp_object = fs::metadata(layout.flatpak_repo().join("objects/ab/cdef.commit"))?;
    assert_eq!(os_object.dev(), fp_object.dev());
    assert_eq!(os_object.ino(), fp_object.ino());

    let os_config = fs::metadata(layout.os_repo().join("config"))?;
    let fp_config = fs::metadata(layout.flatpak_repo().join("config"))?;
    assert_ne!(os_config.ino(), fp_config.ino());

    Ok(())
}

#[test]
fn second_run_changes_nothing() -> Result<()> {
    let fixture = endless_fixture()?;
    let splitter = splitter(&fixture);
    assert!(splitter.run()?);
    let before = snapshot(fixture.root())?;

    assert!(!splitter.run()?);

    let after = snapshot(fixture.root())?;
    assert_eq!(before, after);

    Ok(())
}

#[test]
fn recover_interrupted_repo_swap() -> Result<()> {
    let fixture = endless_fixture()?;
    let shared = fixture.shared_dir();

    // INVARIANT: Crash right after the symlink was moved aside.
    fs::rename(shared.join("repo"), shared.join(".repo.swap"))?;
    fs::create_dir(shared.join(NEW_REPO_NAME))?;
    fs::write(shared.join(NEW_REPO_NAME).join("partial"), "half copied")?;

    let splitter = splitter(&fixture);
    assert!(splitter.run()?);
    assert_eq!(splitter.state()?, SplitState::Complete);

    let layout = fixture.layout();
    assert!(!layout.flatpak_repo().join("partial").exists());
    assert!(!layout.flatpak_dir().join(".repo.swap").exists());
    assert_eq!(refs_of(layout.os_repo())?, vec!["eos:os/eos/amd64/eos5"]);
    assert_eq!(remotes_of(layout.flatpak_repo())?, vec!["flathub"]);

    Ok(())
}

#[test]
fn resume_with_repositories_already_split() -> Result<()> {
    let fixture = endless_fixture()?;
    let shared = fixture.shared_dir();
    let flatpak_repo = shared.join("repo");
    fs::remove_file(&flatpak_repo)?;
    fs::create_dir_all(flatpak_repo.join("refs").join("heads"))?;
    fs::write(flatpak_repo.join("config"), "[core]\nrepo_version=1\nmode=bare-user-only\n")?;

    let splitter = splitter(&fixture);
    assert_eq!(splitter.state()?, SplitState::RepoSplit);
    assert!(splitter.run()?);
    assert_eq!(splitter.state()?, SplitState::Complete);

    let layout = fixture.layout();
    assert!(fs::symlink_metadata(layout.flatpak_dir())?.is_dir());
    assert_eq!(
        refs_of(layout.os_repo())?,
        vec!["eos:os/eos/amd64/eos5", "eos:ostree-metadata"]
    );
    assert_eq!(remotes_of(layout.os_repo())?, vec!["eos"]);
    assert_eq!(refs_of(layout.flatpak_repo())?, Vec::<String>::new());

    Ok(())
}

#[test]
fn finish_split_interrupted_after_cutover() -> Result<()> {
    let fixture = endless_fixture()?;
    let layout = fixture.layout();
    let new_path = fixture.shared_dir().join(NEW_REPO_NAME);

    // INVARIANT: Crash right after the Flatpak repository went live, before
    //   the OS repository was cleaned.
    clone::duplicate(layout.os_repo(), &new_path)?;
    let new_repo = Repo::open(&new_path)?;
    new_repo.remove_remote("eos")?;
    new_repo.transaction(|txn| -> Result<(), RepoError> {
        txn.remove_ref(&"eos:os/eos/amd64/eos5".parse()?);
        Ok(())
    })?;
    swap::replace_symlink_with_path(layout.flatpak_repo(), &new_path)?;

    let splitter = splitter(&fixture);
    assert_eq!(splitter.state()?, SplitState::RepoSplit);
    assert!(splitter.run()?);
    assert_eq!(splitter.state()?, SplitState::Complete);

    assert_eq!(
        refs_of(layout.os_repo())?,
        vec!["eos:os/eos/amd64/eos5", "eos:ostree-metadata"]
    );
    assert_eq!(remotes_of(layout.os_repo())?, vec!["eos"]);
    assert_eq!(remotes_of(layout.flatpak_repo())?, vec!["flathub"]);

    let before = snapshot(fixture.root())?;
    assert!(!splitter.run()?);
    assert_eq!(snapshot(fixture.root())?, before);

    Ok(())
}

#[test]
fn rerun_keeps_refs_recreated_by_os_updates() -> Result<()> {
    let fixture = endless_fixture()?;
    let splitter = splitter(&fixture);
    assert!(splitter.run()?);

    fixture.add_ref("eos:ostree-metadata", '6')?;
    fixture.add_ref("ostree/0/1/0", '7')?;
    let before = snapshot(fixture.root())?;

    assert!(!splitter.run()?);
    assert_eq!(snapshot(fixture.root())?, before);
    assert_eq!(
        refs_of(fixture.layout().os_repo())?,
        vec!["ostree/0/1/0", "eos:os/eos/amd64/eos5", "eos:ostree-metadata"]
    );

    Ok(())
}

#[sealed_test]
fn prune_both_repositories() -> Result<()> {
    let fixture = endless_fixture()?;
    let layout = fixture.layout();
    let os_repo = path::real_path(layout.os_repo())?;
    let new_repo = path::real_path(fixture.shared_dir())?.join(NEW_REPO_NAME);

    // INVARIANT: Stand-in for ostree that needs the repository lock itself.
    let bin = TempDir::new()?;
    let calls = bin.path().join("calls");
    let stub = bin.path().join("ostree");
    fs::write(
        &stub,
        formatdoc! {r#"
            #!/bin/sh
            echo "$*" >> "{calls}"
            exec "{tool}" --repo "${{2#--repo=}}"
        "#,
            calls = calls.display(),
            tool = env!("CARGO_BIN_EXE_ostree-free-space-off"),
        },
    )?;
    fs::set_permissions(&stub, fs::Permissions::from_mode(0o755))?;
    let search_path = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{}:{search_path}", bin.path().display()));

    let options = SplitOptions {
        prune: true,
        ..SplitOptions::default()
    };
    assert!(Splitter::new(layout.clone(), options).run()?);

    let calls = fs::read_to_string(&calls)?;
    assert_eq!(
        calls.lines().collect::<Vec<_>>(),
        vec![
            format!("prune --repo={} --refs-only", new_repo.display()),
            format!("prune --repo={} --refs-only", os_repo.display()),
        ]
    );

    for repo in [layout.os_repo().to_path_buf(), layout.flatpak_repo()] {
        let config = Repo::open(&repo)?.read_config()?;
        assert_eq!(config.get("core", "min-free-space-size"), Some("0MB"));
    }
    assert_eq!(
        Repo::open(layout.flatpak_repo())?.mode()?.as_deref(),
        Some("bare-user-only")
    );

    Ok(())
}

#[test]
fn leftover_swap_symlinks_are_removed() -> Result<()> {
    let fixture = endless_fixture()?;
    let splitter = splitter(&fixture);
    assert!(splitter.run()?);

    let layout = fixture.layout();
    let stale = layout.flatpak_dir().with_file_name(".flatpak.swap");
    symlink(layout.flatpak_dir(), &stale)?;

    assert!(!splitter.run()?);
    assert!(fs::symlink_metadata(&stale).is_err());

    Ok(())
}

#[test]
fn flatpak_repo_must_be_symlink() -> Result<()> {
    let fixture = SysrootFixture::new(COMBINED_CONFIG)?;
    fixture.add_ref("eos:os/eos/amd64/eos5", '1')?;
    let layout = fixture.layout();

    // INVARIANT: Flatpak repository resolves to the OS repository without
    //   being a symlink itself.
    fs::remove_file(layout.flatpak_dir())?;
    symlink(layout.os_repo().parent().unwrap(), layout.flatpak_dir())?;
    let before = snapshot(fixture.root())?;

    let splitter = splitter(&fixture);
    assert_eq!(splitter.state()?, SplitState::Unsplit);
    let result = splitter.run();
    assert!(matches!(result, Err(SplitError::NotASymlink(_))));
    assert_eq!(snapshot(fixture.root())?, before);

    Ok(())
}

#[test]
fn held_lock_aborts_split() -> Result<()> {
    let fixture = endless_fixture()?;
    let layout = fixture.layout();
    let _held = Repo::open(layout.os_repo())?.lock(LockKind::Exclusive)?;
    let before = snapshot(fixture.root())?;

    let result = splitter(&fixture).run();
    assert!(matches!(
        result,
        Err(SplitError::Repo(RepoError::Lock(LockError::Contended { .. })))
    ));
    assert_eq!(snapshot(fixture.root())?, before);

    Ok(())
}

#[test]
fn disable_free_space_reservation() -> Result<()> {
    let fixture = SysrootFixture::new(COMBINED_CONFIG)?;
    let repo = Repo::open(fixture.layout().os_repo())?;
    repo.disable_min_free_space()?;

    let config = repo.read_config()?;
    assert_eq!(config.get("core", "min-free-space-size"), Some("0MB"));
    assert_eq!(config.get("core", "min-free-space-percent"), Some("0"));
    assert_eq!(config.get("core", "mode"), Some("bare"));

    Ok(())
}
