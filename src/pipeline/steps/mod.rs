//! The standard customization stages, in execution order.

mod app_templates;
mod autoinstall;
mod backups;
mod desktop;
mod identity;
mod licenses;
mod network;
mod rebuild;
mod release_label;
mod user;
mod vendor;

pub use app_templates::AppTemplates;
pub use autoinstall::Autoinstall;
pub use backups::Backups;
pub use desktop::Desktop;
pub use identity::Identity;
pub use licenses::Licenses;
pub use network::{keyfile_name, Network, CONNECTIONS_DIR};
pub use rebuild::{ImageRebuild, RootfsRebuild};
pub use release_label::{ReleaseLabel, DISK_INFO, RELEASE_FILE};
pub use user::User;
pub use vendor::{InstallMode, VendorCleanup, VendorInstall, VendorPayload, VENDOR_STAGING};

use super::Stage;

/// Every stage of a full build, in the fixed order they run.
///
/// 1. `release-label`
/// 2. `identity`
/// 3. `network`
/// 4. `desktop` (not in minimal builds)
/// 5. `vendor-payload`
/// 6. `vendor-install` (chroot)
/// 7. `user` (chroot)
/// 8. `app-templates`
/// 9. `licenses`
/// 10. `backups` (not in minimal builds)
/// 11. `vendor-cleanup`
/// 12. `autoinstall` (when enabled)
/// 13. `rootfs-rebuild`
/// 14. `image-rebuild`
pub fn standard_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(ReleaseLabel),
        Box::new(Identity),
        Box::new(Network),
        Box::new(Desktop),
        Box::new(VendorPayload),
        Box::new(VendorInstall),
        Box::new(User),
        Box::new(AppTemplates),
        Box::new(Licenses),
        Box::new(Backups),
        Box::new(VendorCleanup),
        Box::new(Autoinstall),
        Box::new(RootfsRebuild),
        Box::new(ImageRebuild),
    ]
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::config::{BuildConfig, CliOverrides};
    use crate::extract::ExtractedImage;
    use crate::pipeline::BuildContext;
    use crate::release::ResolvedRelease;
    use std::collections::{BTreeMap, HashMap};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use walkdir::WalkDir;

    /// A scratch build with an empty rootfs and ISO tree.
    pub struct Scratch {
        pub dir: tempfile::TempDir,
        pub config: BuildConfig,
        pub release: ResolvedRelease,
        pub image: ExtractedImage,
        pub base_image: PathBuf,
        pub payload: PathBuf,
    }

    impl Scratch {
        pub fn new(pairs: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let vars: HashMap<String, String> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let config = BuildConfig::from_vars(dir.path(), &vars, &CliOverrides::default()).unwrap();
            let image = ExtractedImage {
                iso_tree: config.iso_tree(),
                rootfs: config.rootfs(),
                squashfs: config.iso_tree().join("casper/filesystem.squashfs"),
            };
            fs::create_dir_all(image.rootfs.join("etc")).unwrap();
            fs::create_dir_all(image.rootfs.join("usr")).unwrap();
            fs::create_dir_all(image.iso_tree.join("casper")).unwrap();
            let base_image = dir.path().join("cache/base.iso");
            let payload = dir.path().join("cache/payload.tar.gz");
            Self {
                dir,
                config,
                release: ResolvedRelease {
                    tag: "R5".into(),
                    name: "Release 5".into(),
                    published_at: Some("2025-01-10T00:00:00Z".into()),
                    payload_url: "https://example.invalid/R5.tar.gz".into(),
                },
                image,
                base_image,
                payload,
            }
        }

        pub fn ctx(&self) -> BuildContext<'_> {
            BuildContext {
                config: &self.config,
                release: &self.release,
                image: &self.image,
                base_image: &self.base_image,
                payload: &self.payload,
            }
        }

        pub fn rootfs(&self) -> &Path {
            &self.image.rootfs
        }
    }

    /// Contents and modes of every file under `root`.
    pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, (Vec<u8>, u32)> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                let mode = e.metadata().unwrap().permissions().mode() & 0o7777;
                (rel, (fs::read(e.path()).unwrap(), mode))
            })
            .collect()
    }
}
