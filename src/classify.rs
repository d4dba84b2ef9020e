// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote and ref classification.
//!
//! Decides which content of a combined repository belongs to the base OS and
//! which belongs to Flatpak.
//!
//! Remotes are easy: every remote that Flatpak is told to ignore through a
//! boolean option (`xa.disable` by default) serves OS content, every other
//! remote serves Flatpak content.
//!
//! Refs are classified through the remote they were fetched from whenever
//! that remote is known. Local refs, and refs of remotes that were deleted
//! since, fall back to the type prefix of the ref name:
//!
//! | prefix                    | kind                                 |
//! |---------------------------|--------------------------------------|
//! | `app`, `runtime`, `deploy`| Flatpak                              |
//! | `os`, `ostree`            | OS                                   |
//! | `appstream`, `appstream2` | Flatpak if remote named, else other  |
//! | anything else             | other                                |
//!
//! The `ostree-metadata` ref is always other. Refs classified as other do not
//! survive in either repository.

use crate::repo::{refs::Refspec, Repo, RepoError};

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::{debug, instrument, warn};

/// Remote option that marks a remote as serving OS content.
pub const DEFAULT_OS_REMOTE_OPTION: &str = "xa.disable";

/// Destination of a ref after the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Base-OS content.
    Os,

    /// Flatpak application content.
    Flatpak,

    /// Neither, dropped from both repositories.
    Other,
}

impl Display for RefKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Os => fmt.write_str("os"),
            Self::Flatpak => fmt.write_str("flatpak"),
            Self::Other => fmt.write_str("other"),
        }
    }
}

/// OS-content and Flatpak-content remotes of a repository.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteSet {
    os: BTreeSet<String>,
    flatpak: BTreeSet<String>,
}

impl RemoteSet {
    /// Construct new remote set.
    ///
    /// Does not check that both sets are disjoint, [`gather_refs`] does.
    pub fn new(
        os: impl IntoIterator<Item = impl Into<String>>,
        flatpak: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            os: os.into_iter().map(Into::into).collect(),
            flatpak: flatpak.into_iter().map(Into::into).collect(),
        }
    }

    /// Remotes serving OS content.
    pub fn os(&self) -> impl Iterator<Item = &str> {
        self.os.iter().map(String::as_str)
    }

    /// Remotes serving Flatpak content.
    pub fn flatpak(&self) -> impl Iterator<Item = &str> {
        self.flatpak.iter().map(String::as_str)
    }

    /// Remotes listed in both sets.
    pub fn overlap(&self) -> Vec<String> {
        self.os.intersection(&self.flatpak).cloned().collect()
    }

    fn kind_of(&self, remote: &str) -> Option<RefKind> {
        if self.os.contains(remote) {
            Some(RefKind::Os)
        } else if self.flatpak.contains(remote) {
            Some(RefKind::Flatpak)
        } else {
            None
        }
    }
}

/// Refs of a repository grouped by destination.
///
/// Every ref of the repository appears in exactly one list. Each list is
/// sorted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    pub os: Vec<Refspec>,
    pub flatpak: Vec<Refspec>,
    pub other: Vec<Refspec>,
}

impl Partition {
    /// Refs that must not survive in the OS repository.
    pub fn not_os(&self) -> impl Iterator<Item = &Refspec> {
        self.flatpak.iter().chain(self.other.iter())
    }

    /// Refs that must not survive in the Flatpak repository.
    pub fn not_flatpak(&self) -> impl Iterator<Item = &Refspec> {
        self.os.iter().chain(self.other.iter())
    }
}

/// Sort remotes of repository into OS and Flatpak content.
///
/// A remote serves OS content if its boolean `option` is set to true.
///
/// # Errors
///
/// - Return [`ClassifyError::Repo`] if remotes cannot be read.
#[instrument(skip(repo), level = "debug")]
pub fn gather_remotes(repo: &Repo, option: &str) -> Result<RemoteSet> {
    let mut remotes = RemoteSet::default();
    for remote in repo.list_remotes()? {
        if repo.remote_bool_option(&remote, option)? {
            debug!("remote {remote:?} serves os content");
            remotes.os.insert(remote);
        } else {
            debug!("remote {remote:?} serves flatpak content");
            remotes.flatpak.insert(remote);
        }
    }

    Ok(remotes)
}

/// Decide destination of a single ref.
pub fn classify_refspec(refspec: &Refspec, remotes: &RemoteSet) -> RefKind {
    if refspec.name() == "ostree-metadata" {
        return RefKind::Other;
    }

    if let Some(remote) = refspec.remote_name() {
        match remotes.kind_of(remote) {
            Some(kind) => return kind,
            None => warn!("ref {refspec} belongs to unknown remote {remote:?}, guessing from its name"),
        }
    }

    match refspec.prefix() {
        "app" | "runtime" | "deploy" => RefKind::Flatpak,
        "os" | "ostree" => RefKind::Os,
        "appstream" | "appstream2" if refspec.remote_name().is_some() => RefKind::Flatpak,
        "appstream" | "appstream2" => {
            debug!("ignore locally generated ref {refspec}");
            RefKind::Other
        }
        _ => {
            warn!("cannot tell what ref {refspec} is for, dropping it");
            RefKind::Other
        }
    }
}

/// Partition every ref of repository by destination.
///
/// # Errors
///
/// - Return [`ClassifyError::OverlappingRemotes`] if a remote is listed as
///   both OS and Flatpak content.
/// - Return [`ClassifyError::Repo`] if the ref table cannot be read.
#[instrument(skip(repo, remotes), level = "debug")]
pub fn gather_refs(repo: &Repo, remotes: &RemoteSet) -> Result<Partition> {
    let overlap = remotes.overlap();
    if !overlap.is_empty() {
        return Err(ClassifyError::OverlappingRemotes(overlap));
    }

    let mut partition = Partition::default();
    for refspec in repo.list_refs()?.into_keys() {
        let kind = classify_refspec(&refspec, remotes);
        debug!("ref {refspec} is {kind}");
        match kind {
            RefKind::Os => partition.os.push(refspec),
            RefKind::Flatpak => partition.flatpak.push(refspec),
            RefKind::Other => partition.other.push(refspec),
        }
    }

    Ok(partition)
}

/// Classification error types.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// Remotes are claimed by both OS and Flatpak content.
    #[error("remotes {0:?} are marked as both os and flatpak content")]
    OverlappingRemotes(Vec<String>),

    /// Repository cannot be read.
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Friendly result alias :3
pub type Result<T, E = ClassifyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::{
        collections::HashSet,
        fs,
        io::{self, Write},
        path::Path,
        sync::{Arc, Mutex},
    };
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn classify_with_logs(refspec: &str) -> (RefKind, String) {
        let refspec: Refspec = refspec.parse().unwrap();
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(Level::WARN)
            .with_ansi(false)
            .without_time()
            .finish();
        let kind = tracing::subscriber::with_default(subscriber, || {
            classify_refspec(&refspec, &remotes())
        });

        (kind, logs.contents())
    }

    fn remotes() -> RemoteSet {
        RemoteSet::new(["eos"], ["flathub"])
    }

    fn write_ref(root: &Path, refspec: &str) -> anyhow::Result<()> {
        let refspec: Refspec = refspec.parse()?;
        let path = root.join(refspec.relative_path());
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, format!("{}\n", "0".repeat(64)))?;
        Ok(())
    }

    #[test_case("eos:os/eos/amd64/eos5", RefKind::Os; "os remote")]
    #[test_case("flathub:app/org.foo/x86_64/stable", RefKind::Flatpak; "flatpak remote")]
    #[test_case("eos:app/org.foo/x86_64/stable", RefKind::Os; "remote wins over prefix")]
    #[test_case("flathub:appstream2/x86_64", RefKind::Flatpak; "remote appstream")]
    #[test_case("gone:runtime/org.gnome.Platform/x86_64/45", RefKind::Flatpak; "stale remote runtime")]
    #[test_case("gone:ostree/1/1/0", RefKind::Os; "stale remote ostree")]
    #[test_case("gone:appstream/x86_64", RefKind::Flatpak; "stale remote appstream")]
    #[test_case("gone:mystery/thing", RefKind::Other; "stale remote unknown")]
    #[test_case("deploy/app/org.foo/x86_64/stable", RefKind::Flatpak; "local deploy")]
    #[test_case("os/eos/amd64/eos5", RefKind::Os; "local os")]
    #[test_case("appstream2/x86_64", RefKind::Other; "local appstream")]
    #[test_case("ostree-metadata", RefKind::Other; "local metadata")]
    #[test_case("eos:ostree-metadata", RefKind::Other; "remote metadata")]
    #[test_case("mystery/thing", RefKind::Other; "local unknown")]
    #[test]
    fn classify(refspec: &str, expect: RefKind) {
        let refspec: Refspec = refspec.parse().unwrap();
        pretty_assertions::assert_eq!(classify_refspec(&refspec, &remotes()), expect);
    }

    #[test]
    fn stale_remote_falls_back_with_warning() {
        let (kind, logs) = classify_with_logs("gone:app/org.foo/x86_64/stable");
        assert_eq!(kind, RefKind::Flatpak);
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("unknown remote \"gone\""), "{logs}");
    }

    #[test]
    fn known_remote_does_not_warn() {
        let (kind, logs) = classify_with_logs("flathub:app/org.foo/x86_64/stable");
        assert_eq!(kind, RefKind::Flatpak);
        assert_eq!(logs, "");
    }

    #[test]
    fn gather_remotes_by_option() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(
            dir.path().join("config"),
            indoc! {r#"
                [core]
                mode=bare

                [remote "flathub"]
                xa.disable=false

                [remote "eos"]
                xa.disable=true

                [remote "eos-apps"]
                url=https://ostree.endlessm.com/ostree/eos-apps
            "#},
        )?;
        let repo = Repo::open(dir.path())?;

        let remotes = gather_remotes(&repo, DEFAULT_OS_REMOTE_OPTION)?;
        assert_eq!(remotes.os().collect::<Vec<_>>(), vec!["eos"]);
        assert_eq!(remotes.flatpak().collect::<Vec<_>>(), vec!["eos-apps", "flathub"]);

        Ok(())
    }

    #[test]
    fn gather_refs_covers_every_ref_once() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("config"), "[core]\nmode=bare\n")?;
        let all = [
            "os/eos/amd64/eos5",
            "ostree-metadata",
            "appstream2/x86_64",
            "mystery/thing",
            "eos:os/eos/amd64/eos5",
            "eos:ostree-metadata",
            "flathub:app/org.foo/x86_64/stable",
            "flathub:appstream2/x86_64",
            "gone:runtime/org.gnome.Platform/x86_64/45",
        ];
        for refspec in all {
            write_ref(dir.path(), refspec)?;
        }
        let repo = Repo::open(dir.path())?;

        let partition = gather_refs(&repo, &remotes())?;
        let render = |refs: &[Refspec]| refs.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            render(&partition.os),
            vec!["os/eos/amd64/eos5", "eos:os/eos/amd64/eos5"]
        );
        assert_eq!(
            render(&partition.flatpak),
            vec![
                "flathub:app/org.foo/x86_64/stable",
                "flathub:appstream2/x86_64",
                "gone:runtime/org.gnome.Platform/x86_64/45",
            ]
        );
        assert_eq!(
            render(&partition.other),
            vec![
                "appstream2/x86_64",
                "mystery/thing",
                "ostree-metadata",
                "eos:ostree-metadata",
            ]
        );

        let mut seen = HashSet::new();
        for refspec in partition.os.iter().chain(&partition.flatpak).chain(&partition.other) {
            assert!(seen.insert(refspec.to_string()), "{refspec} classified twice");
        }
        let expect = all.iter().map(ToString::to_string).collect::<HashSet<_>>();
        assert_eq!(seen, expect);

        Ok(())
    }

    #[test]
    fn gather_refs_rejects_overlapping_remotes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("config"), "[core]\nmode=bare\n")?;
        let repo = Repo::open(dir.path())?;
        let remotes = RemoteSet::new(["eos", "shared"], ["flathub", "shared"]);

        let result = gather_refs(&repo, &remotes);
        match result {
            Err(ClassifyError::OverlappingRemotes(overlap)) => assert_eq!(overlap, vec!["shared"]),
            other => panic!("expected overlap error, got {other:?}"),
        }

        Ok(())
    }
}
