//! Shared test utilities for emcomm-iso integration tests.
//!
//! A full build shells out to 7z, unsquashfs, mksquashfs, xorriso and
//! chroot. [`StubTools`] puts shell-script stand-ins for those on `PATH` that
//! produce just enough of an image for the pipeline to run, and log every
//! call so tests can assert on them.

#![allow(dead_code)]

use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

use emcomm_iso::chroot::{MountSpec, Mounter};
use emcomm_iso::config::{BuildConfig, CliOverrides};
use emcomm_iso::release::{ReleaseRecord, ReleaseSource, ResolvedRelease, TagRecord};

pub const BASE_IMAGE_URL: &str = "http://127.0.0.1:9/ubuntu-22.04.5-desktop-amd64.iso";
pub const BASE_IMAGE_NAME: &str = "ubuntu-22.04.5-desktop-amd64.iso";

/// Test environment rooted in a temporary project directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Project directory (cache/, work/, output/, logs/ live here)
    pub base_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().join("project");
        fs::create_dir_all(&base_dir).expect("Failed to create project dir");
        Self {
            _temp_dir: temp_dir,
            base_dir,
        }
    }

    /// Configuration from explicit variables. The base image URL points at
    /// a closed port so nothing is ever fetched.
    pub fn config(&self, pairs: &[(&str, &str)], cli: &CliOverrides) -> BuildConfig {
        let mut vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.entry("EMCOMM_BASE_IMAGE_URL".to_string())
            .or_insert_with(|| BASE_IMAGE_URL.to_string());
        BuildConfig::from_vars(&self.base_dir, &vars, cli).expect("Failed to build config")
    }

    /// Place a base image and a vendor payload in the cache so a build never
    /// touches the network.
    pub fn populate_cache(&self, config: &BuildConfig, release: &ResolvedRelease) {
        fs::create_dir_all(&config.cache_dir).expect("Failed to create cache dir");
        fs::write(config.cache_dir.join(BASE_IMAGE_NAME), b"base image")
            .expect("Failed to write base image");
        write_payload(
            &config.cache_dir.join(release.payload_filename()),
            &format!("emcomm-tools-{}", release.tag),
        );
    }
}

/// Gzipped tarball shaped like a GitHub source archive: one top directory
/// holding `install.sh` and the vendor's template tree.
pub fn write_payload(path: &Path, top: &str) {
    let file = fs::File::create(path).expect("Failed to create payload");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut add = |name: &str, body: &[u8], mode: u32| {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}/{}", top, name), body)
            .expect("Failed to append payload entry");
    };
    add("install.sh", b"#!/bin/bash\necho installing\n", 0o644);
    add(
        "conf/template.d/user/station.conf",
        b"CALLSIGN={{CALLSIGN}}\nGRID={{GRID}}\n",
        0o644,
    );

    builder
        .into_inner()
        .expect("Failed to finish tar")
        .finish()
        .expect("Failed to finish gzip");
}

// =============================================================================
// Release metadata
// =============================================================================

/// In-memory release metadata.
#[derive(Default)]
pub struct FixedSource {
    pub releases: Vec<ReleaseRecord>,
    pub tags: Vec<TagRecord>,
}

impl FixedSource {
    /// One published release `tag`.
    pub fn published(tag: &str) -> Self {
        Self {
            releases: vec![ReleaseRecord {
                tag_name: tag.to_string(),
                name: Some(format!("Release {}", tag)),
                published_at: Some("2025-01-10T00:00:00Z".to_string()),
                tarball_url: format!("http://127.0.0.1:9/tarball/{}", tag),
                draft: false,
                prerelease: false,
            }],
            tags: vec![TagRecord {
                name: tag.to_string(),
                tarball_url: format!("http://127.0.0.1:9/tarball/{}", tag),
            }],
        }
    }
}

impl ReleaseSource for FixedSource {
    fn latest_release(&self) -> Result<Option<ReleaseRecord>> {
        Ok(self.releases.first().cloned())
    }

    fn release_for_tag(&self, tag: &str) -> Result<Option<ReleaseRecord>> {
        Ok(self.releases.iter().find(|r| r.tag_name == tag).cloned())
    }

    fn tags(&self) -> Result<Vec<TagRecord>> {
        Ok(self.tags.clone())
    }
}

// =============================================================================
// Mounts
// =============================================================================

/// What a [`RecordingMounter`] saw.
#[derive(Debug, Default)]
pub struct MountLog {
    pub active: BTreeSet<PathBuf>,
    pub events: Vec<String>,
}

/// In-memory mount table shared between the test and the pipeline.
#[derive(Clone, Default)]
pub struct RecordingMounter {
    pub log: Rc<RefCell<MountLog>>,
}

impl Mounter for RecordingMounter {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.log.borrow().active.contains(target))
    }

    fn mount(&mut self, _spec: &MountSpec, target: &Path) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.active.insert(target.to_path_buf());
        log.events.push(format!("mount {}", target.display()));
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.active.remove(target);
        log.events.push(format!("umount {}", target.display()));
        Ok(())
    }
}

// =============================================================================
// Host tools
// =============================================================================

/// Stub host tools on `PATH`. The previous `PATH` comes back on drop.
pub struct StubTools {
    _dir: TempDir,
    pub bin: PathBuf,
    pub calls: PathBuf,
    saved_path: Option<OsString>,
}

impl StubTools {
    pub fn install() -> Self {
        let dir = TempDir::new().expect("Failed to create stub dir");
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).expect("Failed to create stub bin dir");
        let calls = dir.path().join("calls.log");

        let log = format!("echo \"$(basename \"$0\") $*\" >> '{}'\n", calls.display());
        let stubs: [(&str, &str); 9] = [
            ("7z", SEVEN_Z),
            ("unsquashfs", UNSQUASHFS),
            ("mksquashfs", MKSQUASHFS),
            ("xorriso", XORRISO),
            ("chroot", "exit 0\n"),
            ("mount", "exit 0\n"),
            ("umount", "exit 0\n"),
            ("dconf", "exit 0\n"),
            ("openssl", OPENSSL),
        ];
        for (name, body) in stubs {
            let path = bin.join(name);
            fs::write(&path, format!("#!/bin/sh\n{}{}", log, body))
                .expect("Failed to write stub");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("Failed to chmod stub");
        }

        let saved_path = std::env::var_os("PATH");
        let mut paths = vec![bin.clone()];
        if let Some(existing) = &saved_path {
            paths.extend(std::env::split_paths(existing));
        }
        let joined = std::env::join_paths(paths).expect("Failed to join PATH");
        std::env::set_var("PATH", joined);

        Self {
            _dir: dir,
            bin,
            calls,
            saved_path,
        }
    }

    /// Logged invocations, one per line: `<tool> <args>`.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<String> {
        let prefix = format!("{} ", tool);
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }
}

impl Drop for StubTools {
    fn drop(&mut self) {
        match &self.saved_path {
            Some(p) => std::env::set_var("PATH", p),
            None => std::env::remove_var("PATH"),
        }
    }
}

/// `7z x -y <image> -o<dir>`: a casper layout with a GRUB menu.
const SEVEN_Z: &str = r#"for a in "$@"; do
  case "$a" in -o*) out="${a#-o}" ;; esac
done
mkdir -p "$out/casper" "$out/boot/grub" "$out/.disk" "$out/[BOOT]"
printf 'hsqs' > "$out/casper/filesystem.squashfs"
printf 'Ubuntu 22.04.5 LTS "Jammy Jellyfish" - Release amd64\n' > "$out/.disk/info"
printf 'eltorito' > "$out/[BOOT]/1-Boot-NoEmul.img"
cat > "$out/boot/grub/grub.cfg" <<'EOF'
menuentry "Try or Install Ubuntu" {
	set gfxpayload=keep
	linux	/casper/vmlinuz  --- quiet splash
	initrd	/casper/initrd
}
EOF
"#;

/// `unsquashfs -d <dir> -f <image>`: a tiny root filesystem.
const UNSQUASHFS: &str = r#"dest="$2"
mkdir -p "$dest/etc" "$dest/usr/bin" "$dest/tmp"
printf '127.0.0.1 localhost\n127.0.1.1 ubuntu\n' > "$dest/etc/hosts"
printf 'ubuntu\n' > "$dest/etc/hostname"
printf 'root:x:0:\nsudo:x:27:\ndialout:x:20:\naudio:x:29:\n' > "$dest/etc/group"
"#;

/// `mksquashfs <rootfs> <image> ...`
const MKSQUASHFS: &str = r#"printf 'hsqs-rebuilt' > "$2"
"#;

/// `xorriso -indev <image> -report_el_torito as_mkisofs` prints boot
/// options; `xorriso -as mkisofs ... -o <out> ...` writes the image.
const XORRISO: &str = r#"if [ "$1" = "-indev" ]; then
  echo "-V 'Ubuntu 22.04.5 LTS amd64'"
  echo "--modification-date='2024091115381100'"
  echo "-c '/boot.catalog'"
  echo "-b '/boot/grub/i386-pc/eltorito.img'"
  echo "-no-emul-boot"
  exit 0
fi
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
printf 'ISO9660' > "$out"
"#;

/// `openssl passwd -6 -stdin`
const OPENSSL: &str = r#"read -r _plain
echo '$6$stubsalt$stubhash'
"#;

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}

/// Assert that a file does not exist.
pub fn assert_file_not_exists(path: &Path) {
    assert!(!path.exists(), "Expected file to NOT exist: {}", path.display());
}

/// Assert that a file contains a specific string.
pub fn assert_file_contains(path: &Path, content: &str) {
    let file_content = fs::read_to_string(path)
        .unwrap_or_else(|_| panic!("Failed to read file: {}", path.display()));
    assert!(
        file_content.contains(content),
        "File {} does not contain '{}'\nActual content:\n{}",
        path.display(),
        content,
        file_content
    );
}
