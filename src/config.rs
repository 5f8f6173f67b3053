//! Build configuration.
//!
//! Reads configuration from a .env file and environment variables, then
//! applies command-line overrides. Environment variables take precedence over
//! .env, and flags take precedence over both. The result is a single
//! immutable [`BuildConfig`] handed by reference to every stage.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::partition::PartitionStrategy;

/// Default base installer image.
pub const DEFAULT_BASE_IMAGE_URL: &str =
    "https://releases.ubuntu.com/22.04.5/ubuntu-22.04.5-desktop-amd64.iso";

/// Default GitHub repository publishing the vendor payload.
pub const DEFAULT_VENDOR_REPO: &str = "thetechprepper/emcomm-tools-os-community";

/// Default hostname stamped into the image.
pub const DEFAULT_HOSTNAME: &str = "emcomm-tools";

/// Upper bound on numbered `EMCOMM_WIFI_<n>_SSID` entries.
const MAX_WIFI_NETWORKS: usize = 16;

/// Which upstream release to build from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Most recent formally published release.
    Stable,
    /// Most recent tag, published or not.
    Latest,
    /// Exact caller-supplied tag.
    Tag(String),
}

impl fmt::Display for ReleaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseMode::Stable => write!(f, "stable"),
            ReleaseMode::Latest => write!(f, "latest"),
            ReleaseMode::Tag(tag) => write!(f, "tag:{}", tag),
        }
    }
}

impl ReleaseMode {
    /// Build a mode from the `stable|latest|tag` keyword plus an optional tag.
    pub fn parse(mode: &str, tag: Option<&str>) -> Result<Self> {
        match (mode.trim().to_ascii_lowercase().as_str(), tag) {
            ("stable", _) => Ok(ReleaseMode::Stable),
            ("latest", _) => Ok(ReleaseMode::Latest),
            ("tag", Some(t)) if !t.trim().is_empty() => Ok(ReleaseMode::Tag(t.trim().to_string())),
            ("tag", _) => bail!("release mode 'tag' requires a tag name"),
            (other, _) => bail!("unknown release mode '{}' (expected stable, latest or tag)", other),
        }
    }
}

/// One WiFi network to pre-provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: String,
    /// WPA passphrase; `None` for an open network.
    pub psk: Option<String>,
}

/// Values describing the operator and their station.
#[derive(Debug, Clone, Default)]
pub struct OperatorInputs {
    pub callsign: Option<String>,
    pub grid_square: Option<String>,
    pub fullname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub hostname: String,
    pub locale: String,
    pub timezone: String,
    pub keyboard_layout: String,
    pub wifi: Vec<WifiNetwork>,
    /// Product name (lowercase) to registration key.
    pub license_keys: BTreeMap<String, String>,
    pub dark_mode: bool,
    pub text_scale: Option<String>,
}

/// Inputs steering the unattended installer's disk handling.
#[derive(Debug, Clone, Default)]
pub struct PartitionInputs {
    /// Device to inspect at build time (e.g. `/dev/sda`).
    pub target_disk: Option<String>,
    /// Explicit strategy; wins over auto-detection.
    pub strategy_override: Option<PartitionStrategy>,
    /// Explicit swap size in GiB; wins over the computed value.
    pub swap_gib_override: Option<u64>,
    /// Operator confirmed that erasing the whole disk is acceptable.
    pub confirm_erase: bool,
}

/// Flags from the command line. `None`/`false` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub release: Option<ReleaseMode>,
    pub minimal: bool,
    pub dry_run: bool,
    pub strict_verify: bool,
    pub autoinstall: bool,
    pub confirm_erase: bool,
    pub target_disk: Option<String>,
    pub partition: Option<PartitionStrategy>,
    pub swap_gib: Option<u64>,
}

/// Immutable per-run configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub base_dir: PathBuf,
    pub release_mode: ReleaseMode,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub minimal: bool,
    pub dry_run: bool,
    pub strict_verify: bool,
    /// Generate the unattended-install descriptor and patch boot entries.
    pub autoinstall: bool,
    pub base_image_url: String,
    pub vendor_repo: String,
    pub github_token: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub operator: OperatorInputs,
    pub partition: PartitionInputs,
}

impl BuildConfig {
    /// Load configuration from `<base_dir>/.env`, the process environment and
    /// command-line overrides.
    pub fn load(base_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        let mut vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            let iter = dotenvy::from_path_iter(&env_path)
                .with_context(|| format!("Failed to read {}", env_path.display()))?;
            for item in iter {
                let (key, value) =
                    item.with_context(|| format!("Malformed line in {}", env_path.display()))?;
                vars.insert(key, value);
            }
        }

        // Environment variables override .env file
        for (key, value) in std::env::vars() {
            vars.insert(key, value);
        }

        Self::from_vars(base_dir, &vars, cli)
    }

    /// Build the configuration from an explicit variable map.
    pub fn from_vars(
        base_dir: &Path,
        vars: &HashMap<String, String>,
        cli: &CliOverrides,
    ) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str| get(key).map(|v| parse_bool(&v)).unwrap_or(false);
        let dir = |key: &str, default: &str| {
            get(key)
                .map(|s| {
                    let path = expand_home(&s);
                    if path.is_absolute() {
                        path
                    } else {
                        base_dir.join(path)
                    }
                })
                .unwrap_or_else(|| base_dir.join(default))
        };

        let release_mode = match &cli.release {
            Some(mode) => mode.clone(),
            // A tag on its own implies tag mode, as `--tag` does.
            None => match (get("EMCOMM_RELEASE"), get("EMCOMM_TAG")) {
                (None, Some(tag)) => ReleaseMode::parse("tag", Some(&tag))?,
                (mode, tag) => ReleaseMode::parse(mode.as_deref().unwrap_or("stable"), tag.as_deref())?,
            },
        };

        let mut wifi = Vec::new();
        for n in 1..=MAX_WIFI_NETWORKS {
            if let Some(ssid) = get(&format!("EMCOMM_WIFI_{}_SSID", n)) {
                wifi.push(WifiNetwork {
                    ssid,
                    psk: get(&format!("EMCOMM_WIFI_{}_PSK", n)),
                });
            }
        }

        let mut license_keys = BTreeMap::new();
        for (key, value) in vars {
            if let Some(product) = key.strip_prefix("EMCOMM_LICENSE_") {
                let value = value.trim();
                if !product.is_empty() && !value.is_empty() {
                    license_keys.insert(product.to_ascii_lowercase(), value.to_string());
                }
            }
        }

        let operator = OperatorInputs {
            callsign: get("EMCOMM_CALLSIGN").map(|c| c.to_ascii_uppercase()),
            grid_square: get("EMCOMM_GRID_SQUARE"),
            fullname: get("EMCOMM_FULLNAME"),
            username: get("EMCOMM_USERNAME"),
            password: get("EMCOMM_PASSWORD"),
            hostname: get("EMCOMM_HOSTNAME").unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            locale: get("EMCOMM_LOCALE").unwrap_or_else(|| "en_US.UTF-8".to_string()),
            timezone: get("EMCOMM_TIMEZONE").unwrap_or_else(|| "Etc/UTC".to_string()),
            keyboard_layout: get("EMCOMM_KEYBOARD").unwrap_or_else(|| "us".to_string()),
            wifi,
            license_keys,
            dark_mode: flag("EMCOMM_DARK_MODE"),
            text_scale: get("EMCOMM_TEXT_SCALE"),
        };
        validate_hostname(&operator.hostname)?;

        let strategy_override = match &cli.partition {
            Some(s) => Some(*s),
            None => get("EMCOMM_PARTITION")
                .map(|s| PartitionStrategy::from_str(&s))
                .transpose()?,
        };
        let swap_gib_override = match cli.swap_gib {
            Some(n) => Some(n),
            None => get("EMCOMM_SWAP_GIB")
                .map(|s| {
                    s.parse::<u64>()
                        .with_context(|| format!("EMCOMM_SWAP_GIB is not a number: {}", s))
                })
                .transpose()?,
        };

        let partition = PartitionInputs {
            target_disk: cli.target_disk.clone().or_else(|| get("EMCOMM_TARGET_DISK")),
            strategy_override,
            swap_gib_override,
            confirm_erase: cli.confirm_erase || flag("EMCOMM_CONFIRM_ERASE"),
        };

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            release_mode,
            cache_dir: dir("EMCOMM_CACHE_DIR", "cache"),
            work_dir: dir("EMCOMM_WORK_DIR", "work"),
            output_dir: dir("EMCOMM_OUTPUT_DIR", "output"),
            log_dir: dir("EMCOMM_LOG_DIR", "logs"),
            minimal: cli.minimal || flag("EMCOMM_MINIMAL"),
            dry_run: cli.dry_run || flag("EMCOMM_DRY_RUN"),
            strict_verify: cli.strict_verify || flag("EMCOMM_STRICT_VERIFY"),
            autoinstall: cli.autoinstall || flag("EMCOMM_AUTOINSTALL"),
            base_image_url: get("EMCOMM_BASE_IMAGE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_IMAGE_URL.to_string()),
            vendor_repo: get("EMCOMM_VENDOR_REPO")
                .unwrap_or_else(|| DEFAULT_VENDOR_REPO.to_string()),
            github_token: get("GITHUB_TOKEN"),
            backup_dir: get("EMCOMM_BACKUP_DIR").map(|s| expand_home(&s)),
            operator,
            partition,
        })
    }

    /// Extracted top-level ISO tree.
    pub fn iso_tree(&self) -> PathBuf {
        self.work_dir.join("iso-tree")
    }

    /// Extracted root filesystem.
    pub fn rootfs(&self) -> PathBuf {
        self.work_dir.join("rootfs")
    }

    /// Print configuration for `show config`. Secrets are masked.
    pub fn print(&self) {
        let mask = |v: &Option<String>| match v {
            Some(_) => "********".to_string(),
            None => "(unset)".to_string(),
        };
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());

        println!("Configuration:");
        println!("  RELEASE:         {}", self.release_mode);
        println!("  BASE_IMAGE_URL:  {}", self.base_image_url);
        println!("  VENDOR_REPO:     {}", self.vendor_repo);
        println!("  CACHE_DIR:       {}", self.cache_dir.display());
        println!("  WORK_DIR:        {}", self.work_dir.display());
        println!("  OUTPUT_DIR:      {}", self.output_dir.display());
        println!("  LOG_DIR:         {}", self.log_dir.display());
        println!("  MINIMAL:         {}", self.minimal);
        println!("  DRY_RUN:         {}", self.dry_run);
        println!("  STRICT_VERIFY:   {}", self.strict_verify);
        println!("  AUTOINSTALL:     {}", self.autoinstall);
        println!("Operator:");
        println!("  CALLSIGN:        {}", show(&self.operator.callsign));
        println!("  GRID_SQUARE:     {}", show(&self.operator.grid_square));
        println!("  FULLNAME:        {}", show(&self.operator.fullname));
        println!("  USERNAME:        {}", show(&self.operator.username));
        println!("  PASSWORD:        {}", mask(&self.operator.password));
        println!("  HOSTNAME:        {}", self.operator.hostname);
        println!("  WIFI NETWORKS:   {}", self.operator.wifi.len());
        println!("  LICENSE KEYS:    {}", self.operator.license_keys.len());
        println!("Partitioning:");
        println!("  TARGET_DISK:     {}", show(&self.partition.target_disk));
        println!(
            "  STRATEGY:        {}",
            self.partition
                .strategy_override
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(auto)".to_string())
        );
        println!("  CONFIRM_ERASE:   {}", self.partition.confirm_erase);
    }
}

/// Expand a leading `~/` to the invoking user's home directory.
fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// RFC 1123 label rules, which is all /etc/hostname needs.
fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 63
        && !hostname.starts_with('-')
        && !hostname.ends_with('-')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        bail!("invalid hostname '{}'", hostname);
    }
    Ok(())
}
