use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_LINK_HOST: &str = "127.0.0.1";
pub const DEFAULT_LINK_PORT: u16 = 7777;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PaletteName {
    #[default]
    Green,
    Gray,
    Pocket,
}

impl PaletteName {
    pub fn colors(self) -> [u32; 4] {
        match self {
            Self::Green => lunaboy_core::ppu::DEFAULT_PALETTE,
            Self::Gray => [0x00FFFFFF, 0x00AAAAAA, 0x00555555, 0x00000000],
            Self::Pocket => [0x00C4CFA1, 0x008B956D, 0x004D533C, 0x001F1F1F],
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Green => Self::Gray,
            Self::Gray => Self::Pocket,
            Self::Pocket => Self::Green,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bootrom_path: Option<PathBuf>,
    pub scale: u32,
    pub palette: PaletteName,
    pub link_host: String,
    pub link_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootrom_path: None,
            scale: 3,
            palette: PaletteName::default(),
            link_host: DEFAULT_LINK_HOST.to_string(),
            link_port: DEFAULT_LINK_PORT,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("lunaboy").join("config.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("lunaboy")
            .join("config.toml");
    }

    PathBuf::from("lunaboy.toml")
}

/// Resolve a `--connect` argument against the configured defaults: a bare
/// flag targets the configured host and port, a bare host gets the
/// configured port. Returns `None` when the port does not parse.
pub fn resolve_link_target(arg: Option<&str>, cfg: &Config) -> Option<(String, u16)> {
    match arg {
        Some(target) => match target.rsplit_once(':') {
            Some((host, port)) => port.parse().ok().map(|p| (host.to_string(), p)),
            None => Some((target.to_string(), cfg.link_port)),
        },
        None => Some((cfg.link_host.clone(), cfg.link_port)),
    }
}

pub fn load_from_file(path: &PathBuf) -> Config {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Config::default(),
    };

    match toml::from_str::<Config>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_from_file(&PathBuf::from("/nonexistent/lunaboy.toml"));
        assert_eq!(cfg.scale, 3);
        assert_eq!(cfg.link_port, DEFAULT_LINK_PORT);
    }

    #[test]
    fn palette_names_round_trip() {
        let cfg: Config = toml::from_str("palette = \"pocket\"").unwrap();
        assert_eq!(cfg.palette, PaletteName::Pocket);
    }

    #[test]
    fn palette_cycle_covers_all() {
        let start = PaletteName::Green;
        assert_eq!(start.next().next().next(), start);
    }

    #[test]
    fn bare_connect_flag_uses_configured_host_and_port() {
        let cfg: Config = toml::from_str("link_host = \"10.0.0.2\"\nlink_port = 9000").unwrap();
        assert_eq!(
            resolve_link_target(None, &cfg),
            Some(("10.0.0.2".to_string(), 9000))
        );
    }

    #[test]
    fn host_only_target_uses_configured_port() {
        let cfg = Config::default();
        assert_eq!(
            resolve_link_target(Some("example.net"), &cfg),
            Some(("example.net".to_string(), DEFAULT_LINK_PORT))
        );
        assert_eq!(
            resolve_link_target(Some("example.net:9000"), &cfg),
            Some(("example.net".to_string(), 9000))
        );
    }

    #[test]
    fn bad_port_in_target_is_rejected() {
        let cfg = Config::default();
        assert_eq!(resolve_link_target(Some("host:war"), &cfg), None);
    }
}
