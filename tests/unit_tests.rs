//! Unit tests for emcomm-iso's pure decision logic.
//!
//! These exercise template patching, partition classification, swap sizing
//! and release naming through the public API, without a build tree or any
//! external tools.

use emcomm_iso::config::PartitionInputs;
use emcomm_iso::partition::{
    classify, parse_lsblk, resolve, swap_size_gib, DiskLayout, LayoutClass, ObservedPartition,
    PartitionError, PartitionStrategy, GIB,
};
use emcomm_iso::preseed::{has_autoinstall_flags, patch_boot_entries};
use emcomm_iso::release::ResolvedRelease;
use emcomm_iso::template::{patch, Anchor, PatchSpec, PlaceholderSyntax, Template};
use proptest::prelude::*;

// =============================================================================
// Template patching
// =============================================================================

#[derive(Debug, Clone)]
enum Part {
    Text(String),
    Token(String),
}

fn template_text() -> impl Strategy<Value = String> {
    let part = prop_oneof![
        "[a-z =#:/.]{0,8}".prop_map(Part::Text),
        "[A-Z_]{1,8}".prop_map(Part::Token),
    ];
    prop::collection::vec(prop::collection::vec(part, 0..5), 1..10).prop_map(|lines| {
        let mut out = String::new();
        for line in lines {
            for part in line {
                match part {
                    Part::Text(t) => out.push_str(&t),
                    Part::Token(name) => out.push_str(&format!("{{{{{}}}}}", name)),
                }
            }
            out.push('\n');
        }
        out
    })
}

fn directives() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Z]{1,6}=[a-z0-9]{1,6}", 0..4)
}

fn placeholders(text: &str) -> Vec<String> {
    Template::parse(text, PlaceholderSyntax::default()).placeholders()
}

proptest! {
    #[test]
    fn prop_patch_preserves_placeholders(text in template_text(), dirs in directives()) {
        let spec = PatchSpec::new("#", Anchor::End, dirs);
        let patched = patch(&text, &spec, PlaceholderSyntax::default()).unwrap();
        prop_assert_eq!(placeholders(&patched), placeholders(&text));
    }

    #[test]
    fn prop_patch_is_idempotent(text in template_text(), dirs in directives()) {
        let spec = PatchSpec::new("#", Anchor::End, dirs);
        let once = patch(&text, &spec, PlaceholderSyntax::default()).unwrap();
        let twice = patch(&once, &spec, PlaceholderSyntax::default()).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_empty_patch_restores_original(text in template_text(), dirs in directives()) {
        let syntax = PlaceholderSyntax::default();
        let patched = patch(&text, &PatchSpec::new("#", Anchor::End, dirs), syntax).unwrap();
        let restored = patch(&patched, &PatchSpec::new("#", Anchor::End, Vec::new()), syntax).unwrap();
        prop_assert_eq!(restored, text);
    }

    #[test]
    fn prop_render_reproduces_input(text in template_text()) {
        prop_assert_eq!(Template::parse(&text, PlaceholderSyntax::default()).render(), text);
    }
}

#[test]
fn test_direwolf_template_keeps_tokens() {
    let template = "\
ADEVICE plughw:{{AUDIO_CARD}},0
CHANNEL 0
MYCALL {{CALLSIGN}}
";
    let spec = PatchSpec::new(
        "#",
        Anchor::After("ADEVICE".into()),
        vec!["AGWPORT 8000".into(), "KISSPORT 8001".into()],
    );
    let patched = patch(template, &spec, PlaceholderSyntax::default()).unwrap();
    assert_eq!(
        patched,
        "\
ADEVICE plughw:{{AUDIO_CARD}},0
# BEGIN emcomm-iso generated
AGWPORT 8000
KISSPORT 8001
# END emcomm-iso generated
CHANNEL 0
MYCALL {{CALLSIGN}}
"
    );
}

// =============================================================================
// Partition strategy
// =============================================================================

fn part(path: &str, gib: u64, fstype: Option<&str>) -> ObservedPartition {
    ObservedPartition {
        path: path.to_string(),
        size_bytes: gib * GIB,
        fstype: fstype.map(str::to_string),
        parttype: None,
    }
}

fn disk(gib: u64, partitions: Vec<ObservedPartition>) -> DiskLayout {
    DiskLayout {
        device: "/dev/sda".to_string(),
        size_bytes: gib * GIB,
        table: if partitions.is_empty() { None } else { Some("gpt".to_string()) },
        partitions,
    }
}

#[test]
fn test_layout_classification_table() {
    let cases: Vec<(&str, DiskLayout, LayoutClass)> = vec![
        ("blank disk", disk(256, vec![]), LayoutClass::Empty),
        (
            "windows with room",
            disk(
                512,
                vec![part("/dev/sda1", 1, Some("vfat")), part("/dev/sda2", 200, Some("ntfs"))],
            ),
            LayoutClass::ForeignWithFreeSpace,
        ),
        (
            "windows filling the disk",
            disk(
                256,
                vec![part("/dev/sda1", 1, Some("vfat")), part("/dev/sda2", 250, Some("ntfs"))],
            ),
            LayoutClass::Complex,
        ),
        (
            "previous linux install",
            disk(
                256,
                vec![
                    part("/dev/sda1", 1, Some("vfat")),
                    part("/dev/sda2", 4, Some("swap")),
                    part("/dev/sda3", 250, Some("ext4")),
                ],
            ),
            LayoutClass::Compatible,
        ),
        (
            "dual boot",
            disk(
                512,
                vec![part("/dev/sda1", 100, Some("ntfs")), part("/dev/sda2", 100, Some("ext4"))],
            ),
            LayoutClass::Complex,
        ),
        (
            "encrypted volume",
            disk(256, vec![part("/dev/sda1", 250, Some("crypto_LUKS"))]),
            LayoutClass::Complex,
        ),
    ];

    for (name, layout, expected) in cases {
        assert_eq!(classify(&layout), expected, "{}", name);
    }
}

#[test]
fn test_swap_sizing_bounds() {
    assert_eq!(swap_size_gib(8, None), 2);
    assert_eq!(swap_size_gib(12, None), 3);
    assert_eq!(swap_size_gib(20, None), 4);
    assert_eq!(swap_size_gib(2000, None), 4);
    assert_eq!(swap_size_gib(0, None), 2);
    assert_eq!(swap_size_gib(20, Some(16)), 16);
    assert_eq!(swap_size_gib(20, Some(0)), 0);
}

proptest! {
    #[test]
    fn prop_swap_within_bounds(available in 0u64..100_000) {
        let swap = swap_size_gib(available, None);
        prop_assert!((2..=4).contains(&swap));
    }
}

#[test]
fn test_blank_disk_needs_erase_confirmation() {
    let layout = disk(256, vec![]);
    let err = resolve(&layout, &PartitionInputs::default()).unwrap_err();
    assert!(matches!(err, PartitionError::DestructiveUnconfirmed { .. }));

    let inputs = PartitionInputs {
        confirm_erase: true,
        ..Default::default()
    };
    let plan = resolve(&layout, &inputs).unwrap();
    assert_eq!(plan.strategy, PartitionStrategy::EntireDisk);
    assert_eq!(plan.swap_gib, 4);
    assert_eq!(plan.root_gib, 252);
}

#[test]
fn test_lsblk_probe_to_plan() {
    let json = r#"{"blockdevices": [{
        "name": "sda", "path": "/dev/sda", "size": 274877906944, "type": "disk",
        "fstype": null, "parttype": null, "pttype": "gpt",
        "children": [
            {"name": "sda1", "path": "/dev/sda1", "size": "536870912", "type": "part",
             "fstype": "vfat", "parttype": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b", "pttype": "gpt"},
            {"name": "sda2", "path": "/dev/sda2", "size": 268435456000, "type": "part",
             "fstype": "ext4", "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4", "pttype": "gpt"}
        ]
    }]}"#;
    let layout = parse_lsblk(json).unwrap();
    assert_eq!(classify(&layout), LayoutClass::Compatible);

    let plan = resolve(&layout, &PartitionInputs::default()).unwrap();
    assert_eq!(plan.strategy, PartitionStrategy::ReusePartition);
    assert_eq!(plan.target_partition.as_deref(), Some("/dev/sda2"));
    assert_eq!(plan.swap_gib, 4);
}

// =============================================================================
// Boot entries
// =============================================================================

#[test]
fn test_grub_menu_patched_once() {
    let grub = "\
menuentry \"Try or Install Ubuntu\" {
\tlinux\t/casper/vmlinuz  --- quiet splash
\tinitrd\t/casper/initrd
}
menuentry \"Ubuntu (safe graphics)\" {
\tlinux\t/casper/vmlinuz  nomodeset --- quiet splash
\tinitrd\t/casper/initrd
}
";
    let (patched, changed) = patch_boot_entries(grub);
    assert_eq!(changed, 2);
    assert!(has_autoinstall_flags(&patched));
    assert!(!has_autoinstall_flags(grub));

    let (again, changed) = patch_boot_entries(&patched);
    assert_eq!(changed, 0);
    assert_eq!(again, patched);
}

// =============================================================================
// Release naming
// =============================================================================

#[test]
fn test_release_derived_names() {
    let release = ResolvedRelease {
        tag: "emcomm-tools-os-community-20250401-r5-final-5.0.0".to_string(),
        name: "R5 Final".to_string(),
        published_at: None,
        payload_url: "https://example.invalid/tarball".to_string(),
    };
    assert_eq!(
        release.image_filename(),
        "emcomm-tools-os-community-20250401-r5-final-5.0.0-custom.iso"
    );
    assert_eq!(
        release.payload_filename(),
        "emcomm-tools-emcomm-tools-os-community-20250401-r5-final-5.0.0.tar.gz"
    );
    let label = release.volume_label();
    assert!(label.len() <= 32);
    assert!(label.starts_with("ETC_EMCOMM_TOOLS"));
    assert!(!label.contains('-'));
    assert!(!label.contains('.'));
}
