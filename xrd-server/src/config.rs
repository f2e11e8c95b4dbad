// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use tracing::trace;

lazy_static! {
    static ref DEFAULT_CFG: parsed::Config =
        toml::from_str(include_str!("../xrd.default.toml")).unwrap();
}

/// Serde representations of the configuration files.
mod parsed {
    use converge::Converge;
    use serde::Deserialize;
    use std::num::NonZeroU32;

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    pub(super) struct Config {
        #[converge(nest)]
        pub(super) service: Option<ServiceConfig>,
        #[converge(nest)]
        pub(super) display: Option<DisplayConfig>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct ServiceConfig {
        pub(super) socket: Option<String>,
        pub(super) socket_systemd: Option<bool>,
        pub(super) max_clients: Option<NonZeroU32>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize, Converge)]
    #[serde(deny_unknown_fields)]
    pub(super) struct DisplayConfig {
        pub(super) refresh_hz: Option<f64>,
        pub(super) view_width: Option<NonZeroU32>,
        pub(super) view_height: Option<NonZeroU32>,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub service: ServiceConfig,
    pub display: DisplayConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// None means $XDG_RUNTIME_DIR/xrd/xrd.sock.
    pub socket: Option<PathBuf>,
    pub socket_systemd: bool,
    pub max_clients: NonZeroU32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    pub refresh_hz: f64,
    pub view_width: u32,
    pub view_height: u32,
}

impl DisplayConfig {
    pub fn frame_period_ns(&self) -> i64 {
        (1_000_000_000.0 / self.refresh_hz) as i64
    }
}

/// Debug overrides, read from the environment. Each key has a default;
/// setting the key overrides it for the process lifetime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DebugConfig {
    /// `XRD_TRACE` (bool, default off): raise the default log directive to
    /// `xrd=trace`.
    pub trace: bool,
    /// `XRD_VERBOSE_LIFECYCLE` (bool, default off): log every session
    /// state transition at info instead of debug.
    pub verbose_lifecycle: bool,
    /// `XRD_DEBUG_VIEWS` (bool, default off): log per-view parameters at
    /// instance creation.
    pub debug_views: bool,
    /// `XRD_DEBUG_SPACES` (bool, default off): log tracking-origin offsets
    /// at instance creation.
    pub debug_spaces: bool,
    /// `XRD_IPD_MM` (millimeters, default 63.0): interpupillary distance
    /// reported for the simulated HMD.
    pub ipd_mm: f64,
    /// `XRD_WAIT_FRAME_SLEEP_MS` (default 0): extra sleep injected into
    /// every `wait_frame` reply, for client-side pacing experiments.
    pub wait_frame_sleep_ms: u64,
    /// `XRD_FOV_OVERRIDE` (four comma-separated radians `l,r,u,d`, default
    /// unset): override the per-eye field of view.
    pub fov_override: Option<[f32; 4]>,
}

impl DebugConfig {
    pub fn from_env() -> Self {
        Self {
            trace: env_bool("XRD_TRACE"),
            verbose_lifecycle: env_bool("XRD_VERBOSE_LIFECYCLE"),
            debug_views: env_bool("XRD_DEBUG_VIEWS"),
            debug_spaces: env_bool("XRD_DEBUG_SPACES"),
            ipd_mm: env_parse("XRD_IPD_MM").unwrap_or(63.0),
            wait_frame_sleep_ms: env_parse("XRD_WAIT_FRAME_SLEEP_MS").unwrap_or(0),
            fov_override: env_fov("XRD_FOV_OVERRIDE"),
        }
    }
}

impl Config {
    pub fn new(path: Option<&PathBuf>) -> anyhow::Result<Config> {
        let file = path.map(|p| p.to_owned()).or_else(locate_default_config);

        let cfg = if let Some(file) = file {
            let content = std::fs::read_to_string(&file)?;
            let parsed: parsed::Config = toml::from_str(&content)
                .context(format!("parsing configuration file {}", file.display()))?;

            Some(parsed)
        } else {
            None
        };

        let this = Self::build(cfg)?;
        this.validate()?;

        Ok(this)
    }

    fn build(cfg: Option<parsed::Config>) -> anyhow::Result<Self> {
        let defaults = DEFAULT_CFG.clone();

        let input = if let Some(cfg) = cfg {
            use converge::Converge;
            cfg.converge(defaults)
        } else {
            defaults
        };

        // Only values present in the default config are unwrapped here,
        // which is verified by a test.
        let service = input.service.unwrap();
        let display = input.display.unwrap();

        let socket = match service.socket.unwrap() {
            s if s.is_empty() => None,
            s => Some(PathBuf::from(s)),
        };

        let this = Config {
            service: ServiceConfig {
                socket,
                socket_systemd: service.socket_systemd.unwrap(),
                max_clients: service.max_clients.unwrap(),
            },
            display: DisplayConfig {
                refresh_hz: display.refresh_hz.unwrap(),
                view_width: display.view_width.unwrap().get(),
                view_height: display.view_height.unwrap().get(),
            },
            debug: DebugConfig::from_env(),
        };

        trace!("using config: {:#?}", this);

        Ok(this)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.display.refresh_hz.is_finite() || self.display.refresh_hz <= 0.0 {
            bail!("invalid refresh rate: {}", self.display.refresh_hz);
        }

        if self.display.refresh_hz > 1000.0 {
            bail!("refresh rate too high: {}", self.display.refresh_hz);
        }

        Ok(())
    }

    /// Resolves the socket path, creating parent directories as needed.
    pub fn socket_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.service.socket {
            return Ok(path.clone());
        }

        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let dir = runtime_dir.join("xrd");
        std::fs::create_dir_all(&dir)
            .context(format!("creating runtime dir {}", dir.display()))?;

        Ok(dir.join("xrd.sock"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build(None).expect("failed to build default config")
    }
}

fn locate_default_config() -> Option<PathBuf> {
    let path = Path::new("/etc/xrd/xrd.toml");
    path.exists().then(|| path.to_owned())
}

fn env_bool(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => false,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_fov(name: &str) -> Option<[f32; 4]> {
    let raw = std::env::var(name).ok()?;
    let parts: Vec<f32> = raw
        .split(',')
        .map(|p| p.trim().parse())
        .collect::<Result<_, _>>()
        .ok()?;

    match parts.as_slice() {
        [l, r, u, d] => Some([*l, *r, *u, *d]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_from_str(s: &str) -> anyhow::Result<Config> {
        let input: parsed::Config = toml::from_str(s)?;
        Config::build(Some(input))
    }

    #[test]
    fn default_is_complete() {
        let config = Config::default();
        config.validate().expect("default config is valid");
        assert_eq!(config.service.max_clients.get(), 64);
        assert_eq!(config.display.refresh_hz, 90.0);
    }

    #[test]
    fn frame_period() {
        let config = Config::default();
        assert_eq!(config.display.frame_period_ns(), 11_111_111);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let config = config_from_str(
            r#"
            [display]
            refresh_hz = 120.0
            "#,
        )
        .unwrap();

        assert_eq!(config.display.refresh_hz, 120.0);
        assert_eq!(config.display.view_width, 1832);
        assert_eq!(config.service.socket, None);
    }

    #[test]
    fn bogus_refresh_rejected() {
        let config = config_from_str(
            r#"
            [display]
            refresh_hz = 0.0
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
