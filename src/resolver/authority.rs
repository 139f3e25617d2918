//! Authority parsing
//!
//! Authorities look like `ssh-remote+<encoded destination>` where the
//! encoded part is a percent-encoded `[user@]host[:port]` destination.
//! `encode_authority` is the exact inverse of `parse_authority`, so
//! whatever a location history persisted round-trips.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The scheme tag this resolver answers for.
pub const AUTHORITY_SCHEME: &str = "ssh-remote";

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("authority has no '+' separator: {0}")]
    MissingSeparator(String),

    #[error("unexpected authority scheme: {0}")]
    UnexpectedScheme(String),

    #[error("destination is not valid percent-encoded UTF-8")]
    BadEncoding,

    #[error("destination has no host")]
    EmptyHost,

    #[error("destination has an unclosed '[' in the host")]
    UnclosedBracket,

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Decoded `[user@]host[:port]` destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Destination {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: None,
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
}

impl std::fmt::Display for Destination {
    /// Renders `[user@]host[:port]`, bracketing IPv6 hosts and omitting
    /// the default port.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.username {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Split an authority into scheme and encoded destination, check the
/// scheme, and decode the destination.
pub fn parse_authority(authority: &str) -> Result<Destination, AuthorityError> {
    let (scheme, encoded) = authority
        .split_once('+')
        .ok_or_else(|| AuthorityError::MissingSeparator(authority.to_string()))?;
    if scheme != AUTHORITY_SCHEME {
        return Err(AuthorityError::UnexpectedScheme(scheme.to_string()));
    }
    let decoded = percent_decode(encoded).ok_or(AuthorityError::BadEncoding)?;
    parse_destination(&decoded)
}

/// Encode a destination back into an authority string.
pub fn encode_authority(destination: &Destination) -> String {
    format!(
        "{}+{}",
        AUTHORITY_SCHEME,
        percent_encode(&destination.to_string())
    )
}

/// Parse a raw `[user@]host[:port]` destination.
///
/// The username is everything before the last `@`, so usernames
/// containing `@` survive. IPv6 hosts are written `[addr]` or
/// `[addr]:port`; a bare colon-riddled host with no brackets is also
/// accepted and treated as having the default port.
pub fn parse_destination(raw: &str) -> Result<Destination, AuthorityError> {
    let (username, rest) = match raw.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some((_, rest)) => (None, rest),
        None => (None, raw),
    };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (addr, tail) = bracketed
            .split_once(']')
            .ok_or(AuthorityError::UnclosedBracket)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => return Err(AuthorityError::InvalidPort(tail.to_string())),
        };
        (addr.to_string(), port)
    } else {
        match rest.rsplit_once(':') {
            // more than one colon means a bare IPv6 address, no port
            Some((head, _)) if head.contains(':') => (rest.to_string(), DEFAULT_SSH_PORT),
            Some((head, port)) => (head.to_string(), parse_port(port)?),
            None => (rest.to_string(), DEFAULT_SSH_PORT),
        }
    };

    if host.is_empty() {
        return Err(AuthorityError::EmptyHost);
    }
    Ok(Destination {
        host,
        port,
        username,
    })
}

fn parse_port(raw: &str) -> Result<u16, AuthorityError> {
    raw.parse::<u16>()
        .map_err(|_| AuthorityError::InvalidPort(raw.to_string()))
}

/// Percent-encode everything outside the unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(input: &str) -> Option<String> {
    let mut out = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hi = char::from(bytes[i + 1]).to_digit(16)?;
            let lo = char::from(bytes[i + 2]).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority_basic() {
        let dest = parse_authority("ssh-remote+alice%40example.com").unwrap();
        assert_eq!(dest.host, "example.com");
        assert_eq!(dest.port, 22);
        assert_eq!(dest.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_parse_authority_wrong_scheme() {
        assert_eq!(
            parse_authority("wsl-remote+example.com"),
            Err(AuthorityError::UnexpectedScheme("wsl-remote".into()))
        );
    }

    #[test]
    fn test_parse_authority_no_separator() {
        assert!(matches!(
            parse_authority("example.com"),
            Err(AuthorityError::MissingSeparator(_))
        ));
    }

    #[test]
    fn test_parse_authority_bad_percent_encoding() {
        assert_eq!(
            parse_authority("ssh-remote+alice%4"),
            Err(AuthorityError::BadEncoding)
        );
        assert_eq!(
            parse_authority("ssh-remote+alice%zz"),
            Err(AuthorityError::BadEncoding)
        );
    }

    #[test]
    fn test_parse_destination_forms() {
        assert_eq!(
            parse_destination("example.com").unwrap(),
            Destination::new("example.com")
        );
        assert_eq!(
            parse_destination("example.com:2222").unwrap(),
            Destination::new("example.com").with_port(2222)
        );
        assert_eq!(
            parse_destination("alice@example.com:2222").unwrap(),
            Destination::new("example.com")
                .with_port(2222)
                .with_username("alice")
        );
    }

    #[test]
    fn test_parse_destination_ipv6() {
        assert_eq!(
            parse_destination("[::1]:2222").unwrap(),
            Destination::new("::1").with_port(2222)
        );
        assert_eq!(
            parse_destination("alice@[fe80::1]").unwrap(),
            Destination::new("fe80::1").with_username("alice")
        );
        // bare v6 without brackets gets the default port
        assert_eq!(
            parse_destination("fe80::1").unwrap(),
            Destination::new("fe80::1")
        );
    }

    #[test]
    fn test_parse_destination_errors() {
        assert_eq!(parse_destination("@"), Err(AuthorityError::EmptyHost));
        assert_eq!(
            parse_destination("[::1"),
            Err(AuthorityError::UnclosedBracket)
        );
        assert_eq!(
            parse_destination("example.com:notaport"),
            Err(AuthorityError::InvalidPort("notaport".into()))
        );
        assert_eq!(
            parse_destination("example.com:"),
            Err(AuthorityError::InvalidPort("".into()))
        );
    }

    #[test]
    fn test_authority_round_trip() {
        let cases = [
            Destination::new("example.com"),
            Destination::new("example.com")
                .with_port(2222)
                .with_username("alice"),
            Destination::new("::1").with_port(2222),
            Destination::new("fe80::1").with_username("a@b"),
        ];
        for dest in cases {
            let authority = encode_authority(&dest);
            assert_eq!(parse_authority(&authority).unwrap(), dest, "{}", authority);
        }
    }

    #[test]
    fn test_encode_authority_escapes() {
        let dest = Destination::new("example.com").with_username("alice");
        assert_eq!(encode_authority(&dest), "ssh-remote+alice%40example.com");
    }
}
