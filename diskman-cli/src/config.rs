// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use diskman_types::{DEFAULT_ALIGNMENT_BYTES, TableFormat};
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "diskman";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            3 => Self::Debug,
            _ => Self::Trace,
        }
    }

    pub fn to_index(self) -> usize {
        match self {
            Self::Error => 0,
            Self::Warn => 1,
            Self::Info => 2,
            Self::Debug => 3,
            Self::Trace => 4,
        }
    }

    /// Raise the level by `steps` (one per `-v`)
    pub fn louder(self, steps: u8) -> Self {
        Self::from_index(self.to_index() + usize::from(steps))
    }

    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: LoggingLevel,
    pub log_to_disk: bool,

    /// Table format `init` writes when none is given
    pub default_format: TableFormat,

    /// Logical sector size assumed for plain image files
    pub sector_size: Option<u32>,

    /// Boundary automatic partition placement aligns to
    pub alignment_bytes: u64,

    /// Where staging journals are kept instead of next to image files
    pub journal_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LoggingLevel::Warn,
            log_to_disk: false,
            default_format: TableFormat::Gpt,
            sector_size: None,
            alignment_bytes: DEFAULT_ALIGNMENT_BYTES,
            journal_dir: None,
        }
    }
}

impl Config {
    /// Load `path`, or the per-user config file when no path is given.
    ///
    /// A missing per-user file means defaults; a missing explicit file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()));
            }
        };

        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.alignment_bytes == 0 {
            anyhow::bail!("alignment_bytes must be greater than zero");
        }
        if let Some(size) = config.sector_size
            && (size < 512 || !size.is_power_of_two())
        {
            anyhow::bail!("sector_size {size} is not a power of two >= 512");
        }
        Ok(config)
    }

    /// Journal location for `device`.
    ///
    /// Image files keep a sidecar next to them; block devices use the state
    /// directory.
    pub fn journal_path(&self, device: &Path) -> PathBuf {
        let name = format!("{}.journal", journal_name(device));
        if let Some(dir) = &self.journal_dir {
            return dir.join(name);
        }

        if device.is_file() {
            let mut sidecar = device.as_os_str().to_owned();
            sidecar.push(".diskman-journal");
            return PathBuf::from(sidecar);
        }

        state_dir().join("journals").join(name)
    }
}

/// Flatten a device path into a file name ("/dev/sda" -> "dev-sda")
fn journal_name(device: &Path) -> String {
    let flat: String = device
        .to_string_lossy()
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect();
    if flat.is_empty() { "device".to_string() } else { flat }
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join(APP_DIR).join("config.toml"));
    }
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml")
    })
}

pub(crate) fn state_dir() -> PathBuf {
    if let Some(xdg_state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(xdg_state).join(APP_DIR);
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local").join("state").join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn parses_every_setting() {
        let config = Config::parse(
            r#"
            log_level = "debug"
            log_to_disk = true
            default_format = "dos"
            sector_size = 4096
            alignment_bytes = 4096
            journal_dir = "/var/lib/diskman"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, LoggingLevel::Debug);
        assert!(config.log_to_disk);
        assert_eq!(config.default_format, TableFormat::Dos);
        assert_eq!(config.sector_size, Some(4096));
        assert_eq!(config.alignment_bytes, 4096);
        assert_eq!(
            config.journal_path(Path::new("/dev/sda")),
            PathBuf::from("/var/lib/diskman/dev-sda.journal")
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::parse("alignment_bytes = 0").is_err());
        assert!(Config::parse("sector_size = 1000").is_err());
        assert!(Config::parse("log_level = \"loud\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "default_format = \"dos\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.default_format, TableFormat::Dos);
        assert_eq!(config.log_level, LoggingLevel::Warn);
    }

    #[test]
    fn image_files_get_a_sidecar_journal() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, b"").unwrap();

        let config = Config::default();
        assert_eq!(
            config.journal_path(&image),
            dir.path().join("disk.img.diskman-journal")
        );
    }

    #[test]
    fn verbosity_raises_the_level() {
        assert_eq!(LoggingLevel::Warn.louder(1), LoggingLevel::Info);
        assert_eq!(LoggingLevel::Warn.louder(9), LoggingLevel::Trace);
    }
}
