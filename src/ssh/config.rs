//! SSH connection configuration
//!
//! `SshConfig` is immutable after construction; anything that varies per
//! operation goes through a `ConfigOverlay` so concurrent operations never
//! observe each other's overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Configuration for one SSH destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for the destination. When unset the destination is passed
    /// bare and the ssh binary falls back to the local user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Identity file passed via `-i`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Connection timeout in seconds (default: 60)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Extra raw options appended after the built-in ones, in order
    #[serde(default)]
    pub extra_options: Vec<String>,

    /// The ssh client binary to invoke (default: `ssh`). Allows wrapper
    /// scripts or absolute paths.
    #[serde(default = "default_program")]
    pub program: PathBuf,
}

impl SshConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
            extra_options: Vec::new(),
            program: default_program(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_extra_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Check the invariants that must hold before any process is spawned.
    pub fn validate(&self) -> Result<(), SshError> {
        if self.host.trim().is_empty() {
            return Err(SshError::InvalidConfig("host must not be empty".into()));
        }
        Ok(())
    }

    /// The destination argument: `user@host`, or a bare `host` when no
    /// username is configured.
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Produce a new config with the overlay's fields applied. The base
    /// config is left untouched; extra options are appended, not replaced.
    pub fn overlaid(&self, overlay: &ConfigOverlay) -> SshConfig {
        let mut config = self.clone();
        if let Some(username) = &overlay.username {
            config.username = Some(username.clone());
        }
        if let Some(port) = overlay.port {
            config.port = port;
        }
        if let Some(identity_file) = &overlay.identity_file {
            config.identity_file = Some(identity_file.clone());
        }
        if let Some(secs) = overlay.connect_timeout_secs {
            config.connect_timeout_secs = secs;
        }
        if let Some(program) = &overlay.program {
            config.program = program.clone();
        }
        config
            .extra_options
            .extend(overlay.extra_options.iter().cloned());
        config
    }
}

/// Per-operation configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Appended to the base config's extra options
    #[serde(default)]
    pub extra_options: Vec<String>,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_program() -> PathBuf {
    PathBuf::from("ssh")
}
