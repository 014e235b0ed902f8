// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! URL decomposition and recomposition. Parsing is a greedy left-to-right
//! extraction — protocol, then auth, then fragment, query and path from
//! the tail — with whatever remains taken as the host. Only the hostname
//! is mandatory; `href` can always be rebuilt from the parts.
//!
//! This is deliberately not a general WHATWG parser; it handles the URL
//! and DSN shapes the runtime consumes (see <https://url.spec.whatwg.org/>
//! for the naming).

use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: Option<String>,
    pub password: Option<String>,
    /// `username[:password]` exactly as written.
    pub joined: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    /// Always present on a successful parse.
    pub hostname: String,
    pub port: Option<String>,
    /// `hostname[:port]`.
    pub joined: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathInfo {
    pub pathname: Option<String>,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Query string including the leading `?`.
    pub search: Option<String>,
    /// `pathname[search]`.
    pub joined: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlInfo {
    /// Scheme including the trailing colon, e.g. `https:`.
    pub protocol: Option<String>,
    /// `[protocol//]host[:port]`.
    pub origin: String,
    pub auth: AuthInfo,
    pub host: HostInfo,
    pub path: PathInfo,
    /// Fragment including the leading `#`.
    pub hash: Option<String>,
    /// The URL rebuilt from its parts.
    pub href: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlParseError {
    #[error("url is empty")]
    Empty,
    #[error("'{0}' does not contain a host")]
    MissingHost(String),
}

/// Decomposes `url` into [UrlInfo]. Fails only when no hostname remains
/// after the other components are stripped.
pub fn parse_href(url: &str) -> Result<UrlInfo, UrlParseError> {
    if url.is_empty() {
        return Err(UrlParseError::Empty);
    }

    let mut info = UrlInfo::default();
    let mut rest = url;

    // Protocol: everything up to and including "//".
    if let Some(idx) = rest.find("//") {
        if idx > 0 {
            info.protocol = Some(rest[..idx].to_owned());
        }
        rest = &rest[idx + 2..];
    }

    // Auth: everything up to '@'.
    if let Some(idx) = rest.find('@') {
        let auth = &rest[..idx];
        rest = &rest[idx + 1..];
        if !auth.is_empty() {
            match auth.split_once(':') {
                Some((user, password)) => {
                    info.auth.username = Some(user.to_owned());
                    info.auth.password = Some(password.to_owned());
                }
                None => info.auth.username = Some(auth.to_owned()),
            }
            info.auth.joined = Some(auth.to_owned());
        }
    }

    // Fragment: from the last '#' to the end.
    if let Some(idx) = rest.rfind('#') {
        info.hash = Some(rest[idx..].to_owned());
        rest = &rest[..idx];
    }

    // Search and query: from '?' to the end.
    if let Some(idx) = rest.find('?') {
        info.path.search = Some(rest[idx..].to_owned());
        info.path.query = Some(rest[idx + 1..].to_owned());
        rest = &rest[..idx];
    }

    // Pathname: from the first '/' to the end.
    if let Some(idx) = rest.find('/') {
        info.path.pathname = Some(rest[idx..].to_owned());
        rest = &rest[..idx];
    }
    info.path.joined = match (&info.path.pathname, &info.path.search) {
        (Some(path), Some(search)) => Some(format!("{path}{search}")),
        (Some(path), None) => Some(path.clone()),
        (None, Some(search)) => Some(search.clone()),
        (None, None) => None,
    };

    // The remainder is the host; the hostname half is mandatory.
    if rest.is_empty() {
        tracing::debug!(url, "url has no host component");
        return Err(UrlParseError::MissingHost(url.to_owned()));
    }
    info.host.joined = rest.to_owned();
    match rest.split_once(':') {
        Some((hostname, port)) => {
            if hostname.is_empty() {
                tracing::debug!(url, "url has no host component");
                return Err(UrlParseError::MissingHost(url.to_owned()));
            }
            info.host.hostname = hostname.to_owned();
            info.host.port = Some(port.to_owned());
        }
        None => info.host.hostname = rest.to_owned(),
    }

    info.origin = match &info.protocol {
        Some(protocol) => format!("{protocol}//{}", info.host.joined),
        None => info.host.joined.clone(),
    };
    info.href = build_href(&info);
    Ok(info)
}

/// Rebuilds `[protocol//][auth@][host][path][hash]` from parts.
pub fn build_href(info: &UrlInfo) -> String {
    let mut href = String::new();
    if let Some(protocol) = &info.protocol {
        href.push_str(protocol);
        href.push_str("//");
    }
    if let Some(auth) = &info.auth.joined {
        href.push_str(auth);
        href.push('@');
    }
    href.push_str(&info.host.joined);
    if let Some(path) = &info.path.joined {
        href.push_str(path);
    }
    if let Some(hash) = &info.hash {
        href.push_str(hash);
    }
    href
}
