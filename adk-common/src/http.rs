// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing helpers for raw HTTP/1.x header lines as delivered by the
//! transport's header callback: the status line, and individual
//! `Name: value` lines.

/// Extracts the status code from a response status line
/// (`HTTP/1.1 200 OK`). Returns `None` for anything else.
pub fn parse_status_line(line: &[u8]) -> Option<u16> {
    let text = core::str::from_utf8(line).ok()?;
    let text = text.trim();
    if !text.starts_with("HTTP/") {
        return None;
    }
    let code = text.split_ascii_whitespace().nth(1)?;
    code.parse().ok()
}

/// Returns the value of header `name` if `line` is that header
/// (case-insensitive), trimmed of surrounding whitespace and the line
/// terminator. Quotes are preserved; an ETag keeps its exact form.
pub fn parse_header_value<'l>(name: &str, line: &'l [u8]) -> Option<&'l str> {
    let text = core::str::from_utf8(line).ok()?;
    let (key, value) = text.split_once(':')?;
    if !key.trim().eq_ignore_ascii_case(name) {
        return None;
    }
    Some(value.trim())
}

/// Parses a numeric header value such as `Content-Length` or
/// `Retry-After`.
pub fn parse_numeric_header(name: &str, line: &[u8]) -> Option<u64> {
    parse_header_value(name, line)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 304 Not Modified"), Some(304));
        assert_eq!(parse_status_line(b"ETag: \"abc\""), None);
        assert_eq!(parse_status_line(b""), None);
    }

    #[test]
    fn header_values() {
        assert_eq!(parse_header_value("ETag", b"ETag: \"v1-logo\"\r\n"), Some("\"v1-logo\""));
        assert_eq!(parse_header_value("etag", b"ETAG: bare"), Some("bare"));
        assert_eq!(parse_header_value("ETag", b"Content-Length: 10"), None);
        assert_eq!(parse_header_value("ETag", b"no colon here"), None);
    }

    #[test]
    fn numeric_headers() {
        assert_eq!(parse_numeric_header("Content-Length", b"Content-Length: 8192\r\n"), Some(8192));
        assert_eq!(parse_numeric_header("Retry-After", b"Retry-After: 5"), Some(5));
        assert_eq!(parse_numeric_header("Content-Length", b"Content-Length: soon"), None);
    }
}
