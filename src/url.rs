//! Stream URL holder.
//!
//! Streams are created from URLs of the form
//! `scheme://host[:port][/path][?args]`. The holder keeps the decomposed
//! pieces so the ctrl surface can get and set them independently and
//! reassemble the string form on demand.

use std::fmt;
use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Scheme of a stream URL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// `file://` local file path.
    File,
    /// `http://` or `https://`.
    Http,
    /// `sock://` raw TCP or UDP endpoint.
    Sock,
    /// `data://` inline base64 payload.
    Data,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Http => "http",
            Scheme::Sock => "sock",
            Scheme::Data => "data",
        }
    }
}

/// A decomposed stream URL.
#[derive(Clone, Debug)]
pub struct Url {
    scheme: Scheme,
    ssl: bool,
    host: String,
    port: u16,
    path: String,
    args: Option<String>,
    // data: payload, kept verbatim (base64)
    payload: Option<String>,
}

impl Url {
    /// Parses a stream URL.
    pub fn parse(s: &str) -> io::Result<Url> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid(format!("url missing scheme: {}", s)))?;

        let (scheme, ssl) = match scheme_str {
            "file" => (Scheme::File, false),
            "http" => (Scheme::Http, false),
            "https" => (Scheme::Http, true),
            "sock" => (Scheme::Sock, false),
            "ssl" => (Scheme::Sock, true),
            "data" => (Scheme::Data, false),
            _ => return Err(invalid(format!("unknown scheme: {}", scheme_str))),
        };

        if scheme == Scheme::Data {
            return Ok(Url {
                scheme,
                ssl,
                host: String::new(),
                port: 0,
                path: String::new(),
                args: None,
                payload: Some(rest.to_string()),
            });
        }

        if scheme == Scheme::File {
            let (path, args) = split_args(rest);
            return Ok(Url {
                scheme,
                ssl,
                host: String::new(),
                port: 0,
                path: expand_home(path),
                args,
            payload: None,
            });
        }

        let (authority, tail) = match rest.find(['/', '?']) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (path, args) = split_args(tail);
        let (host, port) = split_port(authority)?;
        let port = match port {
            Some(port) => port,
            None => match (scheme, ssl) {
                (Scheme::Http, false) => 80,
                (Scheme::Http, true) => 443,
                _ => return Err(invalid(format!("url missing port: {}", s))),
            },
        };

        Ok(Url {
            scheme,
            ssl,
            host: host.to_string(),
            port,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            args,
            payload: None,
        })
    }

    /// The URL scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// True when the URL requests TLS (`https://`).
    pub fn is_ssl(&self) -> bool {
        self.ssl
    }

    /// Sets or clears the TLS request.
    pub fn set_ssl(&mut self, ssl: bool) {
        self.ssl = ssl;
    }

    /// Host component; empty for `file:` and `data:`.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
    }

    /// Port component; 0 when absent.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Path component. For `file:` URLs `~` has already been expanded.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = if self.scheme == Scheme::File {
            expand_home(path)
        } else {
            path.to_string()
        };
    }

    /// The raw query string, without the leading `?`.
    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }

    /// Looks up `key=` in the query string and returns its value.
    pub fn arg(&self, key: &str) -> Option<&str> {
        let args = self.args.as_deref()?;
        for pair in args.split('&') {
            if let Some(value) = pair.strip_prefix(key) {
                if let Some(value) = value.strip_prefix('=') {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Decodes the inline payload of a `data:` URL.
    pub fn data_payload(&self) -> Option<Vec<u8>> {
        let payload = self.payload.as_deref()?;
        BASE64.decode(payload).ok()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Data => write!(fmt, "data://{}", self.payload.as_deref().unwrap_or("")),
            Scheme::File => {
                write!(fmt, "file://{}", self.path)?;
                if let Some(args) = &self.args {
                    write!(fmt, "?{}", args)?;
                }
                Ok(())
            }
            scheme => {
                let scheme = match (scheme, self.ssl) {
                    (Scheme::Http, true) => "https",
                    (Scheme::Sock, true) => "ssl",
                    (scheme, _) => scheme.as_str(),
                };
                write!(fmt, "{}://{}:{}{}", scheme, self.host, self.port, self.path)?;
                if let Some(args) = &self.args {
                    write!(fmt, "?{}", args)?;
                }
                Ok(())
            }
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn split_args(s: &str) -> (&str, Option<String>) {
    match s.split_once('?') {
        Some((path, args)) => (path, Some(args.to_string())),
        None => (s, None),
    }
}

fn split_port(authority: &str) -> io::Result<(&str, Option<u16>)> {
    // Bracketed IPv6 literal.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(format!("bad ipv6 literal: {}", authority)))?;
        return match tail.strip_prefix(':') {
            Some(port) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("bad port in url: {}", authority)))?;
                Ok((host, Some(port)))
            }
            None => Ok((host, None)),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid(format!("bad port in url: {}", authority)))?;
            Ok((host, Some(port)))
        }
        None => Ok((authority, None)),
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_default();
        if !home.is_empty() {
            return format!("{}{}", home, rest);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sock_url() {
        let url = Url::parse("sock://127.0.0.1:9090/?udp=").unwrap();
        assert_eq!(url.scheme(), Scheme::Sock);
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 9090);
        assert_eq!(url.arg("udp"), Some(""));
        assert_eq!(url.arg("tcp"), None);
        assert!(!url.is_ssl());
    }

    #[test]
    fn parses_http_default_ports() {
        let url = Url::parse("http://example.com/index.html").unwrap();
        assert_eq!(url.port(), 80);
        assert_eq!(url.path(), "/index.html");

        let url = Url::parse("https://example.com").unwrap();
        assert_eq!(url.port(), 443);
        assert!(url.is_ssl());
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn parses_file_url_with_home() {
        std::env::set_var("HOME", "/home/ruki");
        let url = Url::parse("file://~/a.txt").unwrap();
        assert_eq!(url.path(), "/home/ruki/a.txt");

        let url = Url::parse("file:///tmp/b.txt").unwrap();
        assert_eq!(url.path(), "/tmp/b.txt");
    }

    #[test]
    fn decodes_data_payload() {
        let url = Url::parse("data://aGVsbG8=").unwrap();
        assert_eq!(url.data_payload().unwrap(), b"hello");
    }

    #[test]
    fn round_trips_display() {
        let url = Url::parse("sock://10.0.0.1:80/?tcp=").unwrap();
        assert_eq!(url.to_string(), "sock://10.0.0.1:80/?tcp=");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(Url::parse("nourl").is_err());
        assert!(Url::parse("gopher://x:1/").is_err());
        assert!(Url::parse("sock://1.2.3.4:notaport/").is_err());
    }
}
