//! CLI argument construction for the ssh binary
//!
//! Pure functions of the configuration, so the exact invocation is testable
//! without spawning anything. Layout matches the external contract:
//! `ssh [options...] [user@]host [remote-command]` for exec and
//! `ssh [options...] -N -L <local>:<target> [user@]host` for tunnels.

use super::config::SshConfig;
use super::tunnel::TunnelTarget;

/// Keep-alive probe interval sent to the server.
const SERVER_ALIVE_INTERVAL_SECS: u32 = 60;

/// Missed keep-alives tolerated before the connection is considered dead.
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

/// Options shared by every invocation: connection timeout, keep-alive and
/// non-interactive batch mode, then identity, non-default port and any
/// configured raw options.
pub fn connection_args(config: &SshConfig) -> Vec<String> {
    let mut args = vec![
        "-o".into(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
        "-o".into(),
        format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL_SECS),
        "-o".into(),
        format!("ServerAliveCountMax={}", SERVER_ALIVE_COUNT_MAX),
        "-o".into(),
        "BatchMode=yes".into(),
    ];

    if let Some(identity) = &config.identity_file {
        args.push("-i".into());
        args.push(identity.display().to_string());
    }

    if config.port != 22 {
        args.push("-p".into());
        args.push(config.port.to_string());
    }

    args.extend(config.extra_options.iter().cloned());
    args
}

/// Arguments for a one-shot remote command. `-T` disables pseudo-terminal
/// allocation; the remote command is passed as a single trailing argument.
pub fn exec_args(config: &SshConfig, remote_command: &str) -> Vec<String> {
    let mut args = vec!["-T".into()];
    args.extend(connection_args(config));
    args.push(config.destination());
    args.push(remote_command.to_string());
    args
}

/// Arguments for a persistent port-forwarding process: `-N` (no remote
/// command) plus a single `-L` forwarding spec.
pub fn tunnel_args(config: &SshConfig, local_port: u16, target: &TunnelTarget) -> Vec<String> {
    let mut args = connection_args(config);
    args.push("-N".into());
    args.push("-L".into());
    args.push(target.forward_spec(local_port));
    args.push(config.destination());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(args: &[String], flag: &str) -> usize {
        args.iter().filter(|a| a.as_str() == flag).count()
    }

    #[test]
    fn test_default_port_omits_p_flag() {
        let config = SshConfig::new("example.com").with_username("alice");
        let args = exec_args(&config, "true");
        assert_eq!(count(&args, "-p"), 0);
        assert_eq!(args[args.len() - 2], "alice@example.com");
    }

    #[test]
    fn test_non_default_port_has_one_p_flag() {
        let config = SshConfig::new("example.com").with_port(2222);
        let args = exec_args(&config, "true");
        assert_eq!(count(&args, "-p"), 1);
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
    }

    #[test]
    fn test_exec_args_layout() {
        let config = SshConfig::new("example.com").with_username("alice");
        let args = exec_args(&config, "uname -s");

        assert_eq!(args[0], "-T");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=60".to_string()));
        assert!(args.contains(&"ServerAliveInterval=60".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=3".to_string()));

        // destination followed by the remote command, both last
        assert_eq!(args[args.len() - 2], "alice@example.com");
        assert_eq!(args[args.len() - 1], "uname -s");
    }

    #[test]
    fn test_identity_and_extra_options_order() {
        let config = SshConfig::new("example.com")
            .with_identity_file("/home/alice/.ssh/id_ed25519")
            .with_extra_option("-o")
            .with_extra_option("StrictHostKeyChecking=no");
        let args = connection_args(&config);

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/alice/.ssh/id_ed25519");

        // extra options come after the built-ins
        let strict = args
            .iter()
            .position(|a| a == "StrictHostKeyChecking=no")
            .unwrap();
        assert!(strict > i);
    }

    #[test]
    fn test_tunnel_args_port_forward() {
        let config = SshConfig::new("example.com");
        let target = TunnelTarget::Port {
            address: "localhost".into(),
            port: 8000,
        };
        let args = tunnel_args(&config, 9000, &target);

        assert!(args.contains(&"-N".to_string()));
        let l = args.iter().position(|a| a == "-L").unwrap();
        assert_eq!(args[l + 1], "9000:localhost:8000");
        assert_eq!(args.last().unwrap(), "example.com");
    }

    #[test]
    fn test_tunnel_args_socket_forward() {
        let config = SshConfig::new("example.com");
        let target = TunnelTarget::Socket {
            path: "/run/devserver.sock".into(),
        };
        let args = tunnel_args(&config, 9000, &target);

        let l = args.iter().position(|a| a == "-L").unwrap();
        assert_eq!(args[l + 1], "9000:/run/devserver.sock");
    }
}
