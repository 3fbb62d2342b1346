// Copyright 2025 The stoker authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 request state machine.
//!
//! Line-oriented parser over CRLF-delimited input drawn from the
//! connection's read buffer. State advances strictly forward through
//! request line, headers and body; a request that stops short of a full
//! line simply reports that it needs more bytes and keeps its state.

use std::collections::HashMap;
use std::fmt::Display;
use std::mem;
use std::str;

use tracing::{debug, error};

use crate::buffer::Buffer;
use crate::db::UserStore;

/// Paths that receive an implicit `.html` suffix.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

/// Request method. Anything else is rejected as a bad request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.3
    Post,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// Parser position within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for the request line.
    RequestLine,
    /// Collecting header lines.
    Header,
    /// Collecting the body.
    Body,
    /// A complete request has been parsed.
    Finish,
}

/// Outcome of a parse pass, visible to the connection driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required; state is kept.
    Incomplete,
    /// A full request was parsed.
    Complete,
    /// The input is not a valid request.
    BadRequest,
    /// The parser was driven while already finished.
    InternalError,
}

/// A parsed (or in-progress) HTTP/1.1 request.
#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: Method,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    /// Creates a parser ready for a fresh request.
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: Method::Get,
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    /// Clears all parsed data for the next request on a kept-alive
    /// connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current parser state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Request method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Normalized request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP version as sent, e.g. `1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// A decoded form field, if the body carried one.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// True iff the client asked for keep-alive on HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.headers.get("Connection").map(String::as_str) == Some("keep-alive")
            && self.version == "1.1"
    }

    /// Consumes bytes from `buf`, advancing the state machine. Login and
    /// registration forms are checked against `store` as part of body
    /// handling.
    pub fn parse(&mut self, buf: &mut Buffer, store: &dyn UserStore) -> ParseStatus {
        if self.state == ParseState::Finish {
            return ParseStatus::InternalError;
        }
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = find_crlf(buf.peek()) else {
                        return ParseStatus::Incomplete;
                    };
                    let Ok(line) = str::from_utf8(&buf.peek()[..end]).map(str::to_owned) else {
                        return ParseStatus::BadRequest;
                    };
                    if !self.parse_request_line(&line) {
                        return ParseStatus::BadRequest;
                    }
                    buf.retrieve_until(end + 2);
                    self.normalize_path();
                }
                ParseState::Header => {
                    let Some(end) = find_crlf(buf.peek()) else {
                        return ParseStatus::Incomplete;
                    };
                    if end == 0 {
                        buf.retrieve_until(2);
                        self.state = ParseState::Body;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    buf.retrieve_until(end + 2);
                    self.parse_header(&line);
                }
                ParseState::Body => return self.parse_body(buf, store),
                ParseState::Finish => return ParseStatus::Complete,
            }
        }
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let fields: Vec<&str> = line.split(' ').collect();
        let [method, path, version] = fields.as_slice() else {
            error!("bad request line: {line:?}");
            return false;
        };
        let method = match *method {
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => {
                error!("unsupported method: {other:?}");
                return false;
            }
        };
        if !path.starts_with('/') {
            error!("bad request target: {path:?}");
            return false;
        }
        let Some(version) = version.strip_prefix("HTTP/") else {
            error!("bad request version: {version:?}");
            return false;
        };
        self.method = method;
        self.path = (*path).to_owned();
        self.version = version.to_owned();
        self.state = ParseState::Header;
        true
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// A line without a colon ends the header section; the body follows.
    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers.insert(name.to_owned(), value.to_owned());
            }
            None => self.state = ParseState::Body,
        }
    }

    fn parse_body(&mut self, buf: &mut Buffer, store: &dyn UserStore) -> ParseStatus {
        if self.method == Method::Get {
            buf.retrieve_all();
            self.state = ParseState::Finish;
            return ParseStatus::Complete;
        }
        if buf.readable_bytes() > 0 {
            self.body.push_str(&buf.retrieve_all_to_string());
        }
        if self.is_urlencoded_form() {
            if self.body.len() < self.content_length() {
                return ParseStatus::Incomplete;
            }
            self.parse_form();
            if let Some(is_login) = self.form_endpoint() {
                let name = self.form.get("username").cloned().unwrap_or_default();
                let password = self.form.get("password").cloned().unwrap_or_default();
                self.path = if store.verify(&name, &password, is_login) {
                    "/welcome.html".to_owned()
                } else {
                    "/error.html".to_owned()
                };
            }
        }
        debug!("body parsed, {} bytes", self.body.len());
        self.state = ParseState::Finish;
        ParseStatus::Complete
    }

    fn is_urlencoded_form(&self) -> bool {
        self.method == Method::Post
            && self.headers.get("Content-Type").map(String::as_str)
                == Some("application/x-www-form-urlencoded")
    }

    /// A missing or unparsable Content-Length counts as zero.
    fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Form endpoints that trigger verification: registration and login.
    fn form_endpoint(&self) -> Option<bool> {
        match self.path.as_str() {
            "/register.html" => Some(false),
            "/login.html" => Some(true),
            _ => None,
        }
    }

    /// Splits the urlencoded body into key/value pairs. `+` decodes to a
    /// space and `%HH` to the byte with that hex value; unknown keys are
    /// preserved verbatim, and a trailing pair without a terminating `&`
    /// is still stored.
    fn parse_form(&mut self) {
        if self.body.is_empty() {
            return;
        }
        let bytes = self.body.clone().into_bytes();
        let mut key = String::new();
        let mut field = String::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'=' => key = mem::take(&mut field),
                b'+' => field.push(' '),
                b'&' => {
                    self.form.insert(mem::take(&mut key), mem::take(&mut field));
                }
                b'%' if i + 2 < bytes.len() => {
                    let decoded = hex_value(bytes[i + 1]) * 16 + hex_value(bytes[i + 2]);
                    field.push(decoded as char);
                    i += 2;
                }
                byte => field.push(byte as char),
            }
            i += 1;
        }
        if !key.is_empty() && !self.form.contains_key(&key) {
            self.form.insert(key, field);
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\r\n")
}

fn hex_value(byte: u8) -> u8 {
    match byte {
        b'A'..=b'F' => byte - b'A' + 10,
        b'a'..=b'f' => byte - b'a' + 10,
        _ => byte.wrapping_sub(b'0'),
    }
}

#[cfg(test)]
mod test {
    use super::{Method, ParseState, ParseStatus, Request};
    use crate::buffer::Buffer;
    use crate::db::UserStore;

    /// Store that accepts or rejects everything, recording nothing.
    struct FixedStore(bool);

    impl UserStore for FixedStore {
        fn verify(&self, _name: &str, _password: &str, _is_login: bool) -> bool {
            self.0
        }
    }

    fn parse(req: &mut Request, input: &[u8]) -> ParseStatus {
        let mut buf = Buffer::new(64);
        buf.append(input);
        req.parse(&mut buf, &FixedStore(true))
    }

    #[test]
    fn simple_get_parses_completely() {
        let mut req = Request::new();
        let status = parse(
            &mut req,
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
        );
        assert_eq!(ParseStatus::Complete, status);
        assert_eq!(Method::Get, req.method());
        assert_eq!("/index.html", req.path());
        assert_eq!("1.1", req.version());
        assert_eq!(ParseState::Finish, req.state());
    }

    #[test]
    fn root_path_becomes_index() {
        let mut req = Request::new();
        parse(&mut req, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!("/index.html", req.path());
    }

    #[test]
    fn known_pages_get_an_html_suffix() {
        for (raw, suffixed) in [
            ("/login", "/login.html"),
            ("/register", "/register.html"),
            ("/welcome", "/welcome.html"),
        ] {
            let mut req = Request::new();
            parse(&mut req, format!("GET {raw} HTTP/1.1\r\n\r\n").as_bytes());
            assert_eq!(suffixed, req.path());
        }
    }

    #[test]
    fn fragmented_input_keeps_state_between_calls() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        let store = FixedStore(true);

        buf.append(b"GET /index ");
        assert_eq!(ParseStatus::Incomplete, req.parse(&mut buf, &store));
        assert_eq!(ParseState::RequestLine, req.state());

        buf.append(b"HTTP/1.1\r\nConnection: keep-alive");
        assert_eq!(ParseStatus::Incomplete, req.parse(&mut buf, &store));
        assert_eq!(ParseState::Header, req.state());

        buf.append(b"\r\n\r\n");
        assert_eq!(ParseStatus::Complete, req.parse(&mut buf, &store));
        assert!(req.is_keep_alive());
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let mut req = Request::new();
        assert_eq!(ParseStatus::BadRequest, parse(&mut req, b"FOO bar baz\r\n\r\n"));
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut req = Request::new();
        assert_eq!(
            ParseStatus::BadRequest,
            parse(&mut req, b"DELETE /index.html HTTP/1.1\r\n\r\n")
        );
    }

    #[test]
    fn target_must_be_absolute() {
        let mut req = Request::new();
        assert_eq!(
            ParseStatus::BadRequest,
            parse(&mut req, b"GET index.html HTTP/1.1\r\n\r\n")
        );
    }

    #[test]
    fn header_values_may_carry_a_leading_space() {
        let mut req = Request::new();
        parse(&mut req, b"GET / HTTP/1.1\r\nHost:no-space\r\nAccept: text/html\r\n\r\n");
        assert_eq!(Some("no-space"), req.headers.get("Host").map(String::as_str));
        assert_eq!(
            Some("text/html"),
            req.headers.get("Accept").map(String::as_str)
        );
    }

    #[test]
    fn keep_alive_requires_version_1_1() {
        let mut req = Request::new();
        parse(&mut req, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn post_short_of_content_length_needs_more_bytes() {
        let mut req = Request::new();
        let mut buf = Buffer::new(128);
        let store = FixedStore(true);
        buf.append(
            b"POST /login.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 30\r\n\r\nusername=alice",
        );
        assert_eq!(ParseStatus::Incomplete, req.parse(&mut buf, &store));
        assert_eq!(ParseState::Body, req.state());

        buf.append(b"&password=secret");
        assert_eq!(ParseStatus::Complete, req.parse(&mut buf, &store));
        assert_eq!(Some("alice"), req.form_value("username"));
        assert_eq!(Some("secret"), req.form_value("password"));
    }

    #[test]
    fn post_without_content_length_treats_it_as_zero() {
        let mut req = Request::new();
        let status = parse(
            &mut req,
            b"POST /login.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\n",
        );
        assert_eq!(ParseStatus::Complete, status);
    }

    #[test]
    fn login_success_rewrites_to_welcome() {
        let mut req = Request::new();
        let mut buf = Buffer::new(128);
        buf.append(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 30\r\n\r\nusername=alice&password=secret",
        );
        assert_eq!(ParseStatus::Complete, req.parse(&mut buf, &FixedStore(true)));
        assert_eq!("/welcome.html", req.path());
    }

    #[test]
    fn login_failure_rewrites_to_error() {
        let mut req = Request::new();
        let mut buf = Buffer::new(128);
        buf.append(
            b"POST /login.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 30\r\n\r\nusername=alice&password=secret",
        );
        assert_eq!(ParseStatus::Complete, req.parse(&mut buf, &FixedStore(false)));
        assert_eq!("/error.html", req.path());
    }

    #[test]
    fn form_decoding_handles_plus_percent_and_trailing_pair() {
        let mut req = Request::new();
        let mut buf = Buffer::new(128);
        buf.append(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 24\r\n\r\na=1&b=hello+world&c=%2Fx",
        );
        req.parse(&mut buf, &FixedStore(true));
        assert_eq!(Some("1"), req.form_value("a"));
        assert_eq!(Some("hello world"), req.form_value("b"));
        assert_eq!(Some("/x"), req.form_value("c"));
    }

    #[test]
    fn unknown_form_keys_are_preserved() {
        let mut req = Request::new();
        let mut buf = Buffer::new(128);
        buf.append(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 13\r\n\r\nwhoknows=this",
        );
        req.parse(&mut buf, &FixedStore(true));
        assert_eq!(Some("this"), req.form_value("whoknows"));
    }

    #[test]
    fn get_request_discards_any_trailing_bytes() {
        let mut req = Request::new();
        let mut buf = Buffer::new(64);
        buf.append(b"GET / HTTP/1.1\r\n\r\nleftover");
        assert_eq!(ParseStatus::Complete, req.parse(&mut buf, &FixedStore(true)));
        assert_eq!(0, buf.readable_bytes());
    }

    #[test]
    fn parsing_a_finished_request_is_an_internal_error() {
        let mut req = Request::new();
        parse(&mut req, b"GET / HTTP/1.1\r\n\r\n");
        let mut buf = Buffer::new(16);
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(
            ParseStatus::InternalError,
            req.parse(&mut buf, &FixedStore(true))
        );
    }

    #[test]
    fn reset_returns_the_parser_to_its_initial_state() {
        let mut req = Request::new();
        parse(&mut req, b"GET /login HTTP/1.1\r\n\r\n");
        req.reset();
        assert_eq!(ParseState::RequestLine, req.state());
        assert_eq!("", req.path());
    }
}
