//! Remote platform detection
//!
//! One-shot `uname -s` probe classified by substring match. A static
//! per-host override map is consulted first. Probe failures degrade to
//! `Unknown` and are logged; detection never aborts a resolve.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ssh::{ExecOptions, SshClient};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Unknown,
}

impl Platform {
    /// Classify `uname -s` output. MinGW/MSYS/Cygwin environments count
    /// as Windows.
    pub fn from_uname(output: &str) -> Self {
        let upper = output.trim().to_uppercase();
        if upper.contains("LINUX") {
            Platform::Linux
        } else if upper.contains("DARWIN") {
            Platform::MacOs
        } else if upper.contains("MINGW")
            || upper.contains("MSYS")
            || upper.contains("CYGWIN")
            || upper.contains("WINDOWS")
        {
            Platform::Windows
        } else {
            Platform::Unknown
        }
    }
}

/// Static per-host platform overrides, consulted before any probe.
#[derive(Debug, Clone, Default)]
pub struct PlatformOverrides {
    map: HashMap<String, Platform>,
}

impl PlatformOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, platform: Platform) {
        self.map.insert(host.into(), platform);
    }

    pub fn get(&self, host: &str) -> Option<Platform> {
        self.map.get(host).copied()
    }
}

/// Determine the remote platform for the client's host.
pub async fn detect_platform(client: &SshClient, overrides: &PlatformOverrides) -> Platform {
    let host = &client.config().host;
    if let Some(platform) = overrides.get(host) {
        debug!(%host, ?platform, "platform known from override map");
        return platform;
    }

    let options = ExecOptions {
        timeout: Some(PROBE_TIMEOUT),
        ..Default::default()
    };
    match client.exec("uname", &["-s"], options).await {
        Ok(output) => {
            let platform = Platform::from_uname(&output.stdout);
            debug!(%host, ?platform, uname = output.stdout.trim(), "platform probed");
            platform
        }
        Err(err) => {
            warn!(%host, "platform probe failed, treating as unknown: {}", err);
            Platform::Unknown
        }
    }
}
