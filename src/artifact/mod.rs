//! Image rebuild: recompress the customized root filesystem and regenerate
//! the bootable image.
//!
//! - `squashfs` - root filesystem image, `filesystem.size`, `md5sum.txt`
//! - `iso` - hybrid BIOS/UEFI image with the base image's boot records

pub mod iso;
pub mod squashfs;

pub use iso::{build_iso, parse_boot_report};
pub use squashfs::{rebuild_squashfs, write_filesystem_size, write_md5sums};
