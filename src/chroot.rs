//! Chroot lifecycle management.
//!
//! Running the vendor installer against the extracted root filesystem needs
//! the host's device nodes and kernel pseudo-filesystems mounted inside it.
//! A leaked bind mount survives the process and corrupts the host's mount
//! table for every later run, so the mounts are owned by a [`ChrootSession`]:
//!
//! ```text
//! Unmounted ──acquire()──► Mounting ──► Mounted ──release()──► Unmounting ──► Unmounted
//! ```
//!
//! The pipeline releases the session as soon as the last stage needing it
//! returns, whether it succeeded or failed. The session also releases on
//! `Drop`, so a panic or an early `?` cannot leak mounts either.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::process::Cmd;

/// How one mount point is populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Bind-mount a host path.
    Bind(PathBuf),
    /// Fresh procfs.
    Proc,
    /// Fresh sysfs.
    Sysfs,
}

/// One entry of a [`MountSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Mount point relative to the chroot root.
    pub target: PathBuf,
}

impl MountSpec {
    fn bind(host: &str, target: &str) -> Self {
        Self {
            kind: MountKind::Bind(PathBuf::from(host)),
            target: PathBuf::from(target),
        }
    }
}

/// Ordered mounts belonging to one chroot root.
#[derive(Debug, Clone)]
pub struct MountSet {
    root: PathBuf,
    specs: Vec<MountSpec>,
}

impl MountSet {
    /// Device nodes, terminals, process info, kernel interfaces and /run,
    /// in the order they must be mounted.
    pub fn standard(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            specs: vec![
                MountSpec::bind("/dev", "dev"),
                MountSpec::bind("/dev/pts", "dev/pts"),
                MountSpec {
                    kind: MountKind::Proc,
                    target: PathBuf::from("proc"),
                },
                MountSpec {
                    kind: MountKind::Sysfs,
                    target: PathBuf::from("sys"),
                },
                MountSpec::bind("/run", "run"),
            ],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn specs(&self) -> &[MountSpec] {
        &self.specs
    }

    /// Absolute mount points in acquisition order.
    pub fn targets(&self) -> Vec<PathBuf> {
        self.specs.iter().map(|s| self.root.join(&s.target)).collect()
    }
}

/// Performs mount operations. The system implementation shells out to
/// `mount`/`umount`; tests substitute an in-memory table.
pub trait Mounter {
    fn is_mounted(&self, target: &Path) -> Result<bool>;
    fn mount(&mut self, spec: &MountSpec, target: &Path) -> Result<()>;
    fn unmount(&mut self, target: &Path) -> Result<()>;
}

/// Real mounts via util-linux.
#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let table = fs::read_to_string("/proc/self/mounts")
            .context("Failed to read /proc/self/mounts")?;
        let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        Ok(parse_mount_targets(&table).iter().any(|t| *t == target))
    }

    fn mount(&mut self, spec: &MountSpec, target: &Path) -> Result<()> {
        let cmd = match &spec.kind {
            MountKind::Bind(host) => Cmd::new("mount").arg("--bind").arg_path(host),
            MountKind::Proc => Cmd::new("mount").args(["-t", "proc", "proc"]),
            MountKind::Sysfs => Cmd::new("mount").args(["-t", "sysfs", "sysfs"]),
        };
        cmd.arg_path(target)
            .error_msg(format!("Failed to mount {}", target.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        let result = Cmd::new("umount").arg_path(target).allow_fail().run()?;
        if result.success() {
            return Ok(());
        }
        warn!(
            target = %target.display(),
            stderr = result.stderr_trimmed(),
            "umount failed, retrying lazily"
        );
        Cmd::new("umount")
            .arg("-l")
            .arg_path(target)
            .error_msg(format!("Failed to unmount {}", target.display()))
            .run()?;
        Ok(())
    }
}

/// Mount points listed in a `/proc/self/mounts` style table.
pub fn parse_mount_targets(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// Mount points of `table` at or below `dir`.
pub fn mounts_under(table: &str, dir: &Path) -> Vec<PathBuf> {
    parse_mount_targets(table)
        .into_iter()
        .filter(|t| t.starts_with(dir))
        .collect()
}

/// Recursively delete `dir`, refusing while anything is mounted inside it.
/// A leftover bind mount would make the delete reach the host's `/dev` or
/// `/run`.
pub fn remove_unmounted_tree(dir: &Path) -> Result<()> {
    let resolved =
        fs::canonicalize(dir).with_context(|| format!("Failed to resolve {}", dir.display()))?;
    let table = fs::read_to_string("/proc/self/mounts").with_context(|| {
        format!(
            "Cannot read /proc/self/mounts to confirm nothing is mounted under {}",
            dir.display()
        )
    })?;
    let live = mounts_under(&table, &resolved);
    if !live.is_empty() {
        let list: Vec<String> = live.iter().map(|p| p.display().to_string()).collect();
        bail!(
            "Refusing to delete {}: still mounted inside it: {}. Run `sudo umount -R {}` first.",
            dir.display(),
            list.join(", "),
            resolved.display()
        );
    }
    fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

/// Owner of one chroot's mount set.
pub struct ChrootSession {
    set: MountSet,
    mounter: Box<dyn Mounter>,
    state: SessionState,
    /// Targets this session mounted, in acquisition order.
    acquired: Vec<PathBuf>,
}

impl ChrootSession {
    pub fn new(set: MountSet, mounter: Box<dyn Mounter>) -> Self {
        Self {
            set,
            mounter,
            state: SessionState::Unmounted,
            acquired: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn root(&self) -> &Path {
        self.set.root()
    }

    /// Mount the set. A second call, or a call on a root whose first mount
    /// point is already active, is a no-op.
    pub fn acquire(&mut self) -> Result<()> {
        if self.state == SessionState::Mounted {
            debug!(root = %self.root().display(), "chroot already acquired");
            return Ok(());
        }

        let targets = self.set.targets();
        if let Some(first) = targets.first() {
            if self.mounter.is_mounted(first)? {
                info!(root = %self.root().display(), "chroot mounts already active, skipping acquire");
                self.state = SessionState::Mounted;
                return Ok(());
            }
        }

        self.state = SessionState::Mounting;
        let specs = self.set.specs().to_vec();
        for (spec, target) in specs.iter().zip(targets) {
            let step = fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create mount point {}", target.display()))
                .and_then(|_| self.mounter.mount(spec, &target));
            if let Err(e) = step {
                warn!(target = %target.display(), "mount failed, tearing down partial set");
                self.release();
                return Err(e);
            }
            debug!(target = %target.display(), "mounted");
            self.acquired.push(target);
        }

        self.state = SessionState::Mounted;
        info!(root = %self.root().display(), mounts = self.acquired.len(), "chroot acquired");
        Ok(())
    }

    /// Unmount the set in reverse order. Individual failures are logged and
    /// the teardown continues. Returns the number of mount points that could
    /// not be unmounted.
    pub fn release(&mut self) -> usize {
        if self.state == SessionState::Unmounted {
            return 0;
        }
        self.state = SessionState::Unmounting;

        let mut failures = 0;
        for target in self.set.targets().into_iter().rev() {
            let ours = self.acquired.contains(&target);
            let active = match self.mounter.is_mounted(&target) {
                Ok(active) => active,
                Err(e) => {
                    warn!(target = %target.display(), error = %e, "could not query mount state");
                    ours
                }
            };
            if !ours && !active {
                continue;
            }
            match self.mounter.unmount(&target) {
                Ok(()) => debug!(target = %target.display(), "unmounted"),
                Err(e) => {
                    failures += 1;
                    warn!(target = %target.display(), error = %format!("{:#}", e), "unmount failed");
                }
            }
        }

        self.acquired.clear();
        self.state = SessionState::Unmounted;
        if failures == 0 {
            info!(root = %self.root().display(), "chroot released");
        } else {
            warn!(root = %self.root().display(), failures, "chroot released with leftover mounts");
        }
        failures
    }

    /// A command that runs `program` inside the chroot.
    pub fn command(&self, program: &str) -> Result<Cmd> {
        if self.state != SessionState::Mounted {
            bail!("chroot at {} is not mounted", self.root().display());
        }
        Ok(Cmd::new("chroot").arg_path(self.root()).arg(program))
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.state != SessionState::Unmounted {
            self.release();
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    /// Shared record of what a [`FakeMounter`] did.
    #[derive(Debug, Default)]
    pub struct FakeTable {
        pub mounted: BTreeSet<PathBuf>,
        pub log: Vec<String>,
        /// Fail the n-th mount call (0-based).
        pub fail_mount_at: Option<usize>,
        /// Targets whose unmount fails.
        pub stuck: BTreeSet<PathBuf>,
        /// Every unmount fails.
        pub refuse_unmount: bool,
        mount_calls: usize,
    }

    /// In-memory mount table for tests.
    #[derive(Debug, Clone, Default)]
    pub struct FakeMounter {
        pub table: Rc<RefCell<FakeTable>>,
    }

    impl Mounter for FakeMounter {
        fn is_mounted(&self, target: &Path) -> Result<bool> {
            Ok(self.table.borrow().mounted.contains(target))
        }

        fn mount(&mut self, _spec: &MountSpec, target: &Path) -> Result<()> {
            let mut t = self.table.borrow_mut();
            let call = t.mount_calls;
            t.mount_calls += 1;
            if t.fail_mount_at == Some(call) {
                bail!("injected mount failure at {}", target.display());
            }
            t.mounted.insert(target.to_path_buf());
            t.log.push(format!("mount {}", target.display()));
            Ok(())
        }

        fn unmount(&mut self, target: &Path) -> Result<()> {
            let mut t = self.table.borrow_mut();
            if t.refuse_unmount || t.stuck.contains(target) {
                bail!("target is busy");
            }
            t.mounted.remove(target);
            t.log.push(format!("umount {}", target.display()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeMounter;
    use super::*;

    fn root() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_acquire_then_release_reverse_order() {
        let dir = root();
        let fake = FakeMounter::default();
        let mut session = ChrootSession::new(MountSet::standard(dir.path()), Box::new(fake.clone()));
        session.acquire().unwrap();
        assert_eq!(session.state(), SessionState::Mounted);
        assert_eq!(fake.table.borrow().mounted.len(), 5);

        assert_eq!(session.release(), 0);
        let t = fake.table.borrow();
        assert!(t.mounted.is_empty());
        let umounts: Vec<_> = t.log.iter().filter(|l| l.starts_with("umount")).cloned().collect();
        let expected: Vec<_> = MountSet::standard(dir.path())
            .targets()
            .into_iter()
            .rev()
            .map(|p| format!("umount {}", p.display()))
            .collect();
        assert_eq!(umounts, expected);
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let dir = root();
        let fake = FakeMounter::default();
        let mut session = ChrootSession::new(MountSet::standard(dir.path()), Box::new(fake.clone()));
        session.acquire().unwrap();
        session.acquire().unwrap();
        let mounts = fake.table.borrow().log.iter().filter(|l| l.starts_with("mount")).count();
        assert_eq!(mounts, 5);
        session.release();
    }

    #[test]
    fn test_already_active_root_is_skipped_but_released() {
        let dir = root();
        let fake = FakeMounter::default();
        let first = MountSet::standard(dir.path()).targets()[0].clone();
        fake.table.borrow_mut().mounted.insert(first.clone());

        let mut session = ChrootSession::new(MountSet::standard(dir.path()), Box::new(fake.clone()));
        session.acquire().unwrap();
        assert!(fake.table.borrow().log.is_empty());
        session.release();
        assert!(!fake.table.borrow().mounted.contains(&first));
    }

    #[test]
    fn test_partial_mount_failure_tears_down() {
        let dir = root();
        let fake = FakeMounter::default();
        fake.table.borrow_mut().fail_mount_at = Some(3);
        let mut session = ChrootSession::new(MountSet::standard(dir.path()), Box::new(fake.clone()));
        assert!(session.acquire().is_err());
        assert_eq!(session.state(), SessionState::Unmounted);
        assert!(fake.table.borrow().mounted.is_empty());
    }

    #[test]
    fn test_release_tolerates_stuck_mount() {
        let dir = root();
        let fake = FakeMounter::default();
        let set = MountSet::standard(dir.path());
        let proc_target = set.targets()[2].clone();
        fake.table.borrow_mut().stuck.insert(proc_target.clone());

        let mut session = ChrootSession::new(set, Box::new(fake.clone()));
        session.acquire().unwrap();
        assert_eq!(session.release(), 1);
        let t = fake.table.borrow();
        assert_eq!(t.mounted.len(), 1);
        assert!(t.mounted.contains(&proc_target));
    }

    #[test]
    fn test_early_return_releases() {
        let dir = root();
        let fake = FakeMounter::default();
        let run = |fake: FakeMounter| -> Result<()> {
            let mut session = ChrootSession::new(MountSet::standard(dir.path()), Box::new(fake));
            session.acquire()?;
            assert_eq!(session.state(), SessionState::Mounted);
            bail!("installer exploded")
        };
        assert!(run(fake.clone()).is_err());
        assert!(fake.table.borrow().mounted.is_empty());
    }

    #[test]
    fn test_drop_releases_on_panic() {
        let dir = root();
        let fake = FakeMounter::default();
        let path = dir.path().to_path_buf();
        let inner = fake.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut session = ChrootSession::new(MountSet::standard(&path), Box::new(inner));
            session.acquire().unwrap();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert!(fake.table.borrow().mounted.is_empty());
    }

    #[test]
    fn test_command_requires_mounted() {
        let dir = root();
        let session = ChrootSession::new(MountSet::standard(dir.path()), Box::new(FakeMounter::default()));
        assert!(session.command("/bin/true").is_err());
    }

    #[test]
    fn test_parse_mount_targets_unescapes() {
        let table = "proc /proc proc rw 0 0\n/dev/sda1 /mnt/with\\040space ext4 rw 0 0\n";
        let targets = parse_mount_targets(table);
        assert_eq!(targets, vec![PathBuf::from("/proc"), PathBuf::from("/mnt/with space")]);
    }

    #[test]
    fn test_mounts_under_matches_whole_components() {
        let table = "\
udev /work/rootfs/dev devtmpfs rw 0 0
proc /work/rootfs/proc proc rw 0 0
tmpfs /work/rootfs2/run tmpfs rw 0 0
tmpfs /run tmpfs rw 0 0
";
        let live = mounts_under(table, Path::new("/work/rootfs"));
        assert_eq!(
            live,
            vec![PathBuf::from("/work/rootfs/dev"), PathBuf::from("/work/rootfs/proc")]
        );
        assert!(mounts_under(table, Path::new("/work/iso-tree")).is_empty());
    }

    #[test]
    fn test_remove_unmounted_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("rootfs");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/hostname"), "etc\n").unwrap();
        remove_unmounted_tree(&tree).unwrap();
        assert!(!tree.exists());
    }

    #[test]
    fn test_remove_refuses_live_mount() {
        // /proc is always a mount point on Linux.
        let err = remove_unmounted_tree(Path::new("/proc")).unwrap_err();
        assert!(err.to_string().contains("Refusing to delete /proc"));
    }
}
