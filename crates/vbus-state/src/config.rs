use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use vbus_hw::{CanFrameType, HardwareFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverBackend {
    Mock,
    Slcan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VbsConfig {
    pub state_path: PathBuf,
    pub can: CanConfig,
    pub j1708: J1708Config,
}

impl Default for VbsConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("vbs-state.json"),
            can: CanConfig::default(),
            j1708: J1708Config::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    pub backend: DriverBackend,
    pub port: String,
    pub bitrate_kbps: u32,
    pub listen_only: bool,
    pub discard_on_open: bool,
    pub diagnostics: bool,
    pub filters: Vec<FilterConfig>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            backend: DriverBackend::Mock,
            port: "/dev/ttyACM0".to_string(),
            bitrate_kbps: 250,
            listen_only: false,
            discard_on_open: false,
            diagnostics: true,
            filters: Vec::new(),
        }
    }
}

impl CanConfig {
    /// `None` when no filters are configured, so bring-up skips filter installation.
    pub fn hardware_filters(&self) -> anyhow::Result<Option<Vec<HardwareFilter>>> {
        if self.filters.is_empty() {
            return Ok(None);
        }
        self.filters
            .iter()
            .enumerate()
            .map(|(i, f)| f.to_filter().with_context(|| format!("filter #{i}")))
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Ids as `0x` hex or decimal strings.
    pub ids: Vec<String>,
    pub mask: String,
    #[serde(default = "default_frame_type")]
    pub frame_type: CanFrameType,
}

fn default_frame_type() -> CanFrameType {
    CanFrameType::Standard
}

impl FilterConfig {
    pub fn to_filter(&self) -> anyhow::Result<HardwareFilter> {
        let ids = self
            .ids
            .iter()
            .map(|s| parse_number(s).with_context(|| format!("invalid id: {s}")))
            .collect::<anyhow::Result<Vec<u32>>>()?;
        let mask =
            parse_number(&self.mask).with_context(|| format!("invalid mask: {}", self.mask))?;
        HardwareFilter::new(ids, mask, self.frame_type).with_context(|| {
            format!(
                "filter out of range for {:?} ids: {:?} mask {}",
                self.frame_type, self.ids, self.mask
            )
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct J1708Config {
    pub enabled: bool,
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_number(s: &str) -> Option<u32> {
    let t = s.trim();
    match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => t.parse::<u32>().ok(),
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<VbsConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    let cfg: VbsConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    cfg.can
        .hardware_filters()
        .with_context(|| format!("validating filters: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_forms() {
        assert_eq!(parse_number("0x7FF"), Some(0x7FF));
        assert_eq!(parse_number(" 0X18fef100 "), Some(0x18FE_F100));
        assert_eq!(parse_number("250"), Some(250));
        assert_eq!(parse_number("0xZZ"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn full_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vbs.yaml");
        fs::write(
            &path,
            r#"
state_path: /data/vbs/state.json
can:
  backend: slcan
  port: /dev/ttyUSB1
  bitrate_kbps: 500
  listen_only: true
  filters:
    - ids: ["0x100", "0x200"]
      mask: "0x7FF"
    - ids: ["0x7DF"]
      mask: "0x7FF"
      frame_type: extended
j1708:
  enabled: true
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.state_path, PathBuf::from("/data/vbs/state.json"));
        assert_eq!(cfg.can.backend, DriverBackend::Slcan);
        assert_eq!(cfg.can.bitrate_kbps, 500);
        assert!(cfg.can.listen_only);
        assert!(cfg.can.diagnostics);
        assert!(cfg.j1708.enabled);
        let filters = cfg.can.hardware_filters().unwrap().unwrap();
        assert_eq!(filters[0].ids(), &[0x100, 0x200]);
        assert_eq!(filters[1].frame_type(), CanFrameType::Extended);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: VbsConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.can.bitrate_kbps, 250);
        assert_eq!(cfg.can.backend, DriverBackend::Mock);
        assert!(cfg.can.hardware_filters().unwrap().is_none());
        assert!(!cfg.j1708.enabled);
    }

    #[test]
    fn bad_filter_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vbs.yaml");
        fs::write(
            &path,
            "can:\n  filters:\n    - ids: [\"0x800\"]\n      mask: \"0x7FF\"\n",
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }
}
