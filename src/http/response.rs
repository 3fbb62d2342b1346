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

//! HTTP/1.1 response assembler.
//!
//! Status line and headers land in the connection's write buffer; the file
//! body is mapped read-only and served as the second scatter segment, never
//! copied. On any resource error the builder degrades to a small inline
//! HTML body instead of aborting the connection.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use memmap2::Mmap;
use tracing::debug;

use crate::buffer::Buffer;

/// World-readable permission bit.
const OTHER_READ: u32 = 0o004;

fn reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// MIME type by file extension; anything unknown is plain text.
fn mime_for(path: &str) -> &'static str {
    let Some((_, extension)) = path.rsplit_once('.') else {
        return "text/plain";
    };
    match extension {
        "html" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "word" => "application/msword",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "au" => "audio/basic",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "text/javascript",
        _ => "text/plain",
    }
}

/// Builds one response per request; reused across requests on a kept-alive
/// connection.
#[derive(Debug)]
pub struct Response {
    code: Option<u16>,
    keep_alive: bool,
    src_dir: String,
    path: String,
    file: Option<Mmap>,
    file_len: u64,
}

impl Response {
    /// Creates an unset builder.
    pub fn new() -> Self {
        Self {
            code: None,
            keep_alive: false,
            src_dir: String::new(),
            path: String::new(),
            file: None,
            file_len: 0,
        }
    }

    /// Prepares the builder for a new response. Any previously mapped file
    /// is unmapped first.
    pub fn init(&mut self, src_dir: &str, path: &str, keep_alive: bool, code: u16) {
        debug_assert!(!src_dir.is_empty());
        self.unmap_file();
        self.code = Some(code);
        self.keep_alive = keep_alive;
        self.src_dir = src_dir.to_owned();
        self.path = path.to_owned();
        self.file_len = 0;
    }

    /// Assembles status line, headers and body framing into `buf` and maps
    /// the served file. A hinted error status skips the filesystem
    /// classification and goes straight to its error page.
    pub fn make(&mut self, buf: &mut Buffer) {
        if self.code.map_or(true, |code| code < 400) {
            match fs::metadata(self.full_path()) {
                Err(_) => self.code = Some(404),
                Ok(md) if md.is_dir() => self.code = Some(404),
                Ok(md) if md.permissions().mode() & OTHER_READ == 0 => self.code = Some(403),
                Ok(md) => {
                    if self.code.is_none() {
                        self.code = Some(200);
                    }
                    self.file_len = md.len();
                }
            }
        }
        self.swap_error_page();
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// Releases the mapped file. Safe to call repeatedly; the map is gone
    /// after the first call.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// The mapped body, when a non-empty file backs this response.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref().filter(|mapped| !mapped.is_empty())
    }

    /// Status code, once decided.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    fn full_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.src_dir, self.path))
    }

    fn swap_error_page(&mut self) {
        if let Some(page) = self.code.and_then(error_page) {
            self.path = page.to_owned();
            self.file_len = fs::metadata(self.full_path()).map(|md| md.len()).unwrap_or(0);
        }
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        let code = self.code.unwrap_or(400);
        let (code, phrase) = match reason(code) {
            Some(phrase) => (code, phrase),
            None => {
                self.code = Some(400);
                (400, "Bad Request")
            }
        };
        buf.append(format!("HTTP/1.1 {code} {phrase}\r\n").as_bytes());
    }

    fn add_headers(&self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime_for(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.full_path()) {
            Ok(file) => file,
            Err(_) => {
                self.error_body(buf, "File error");
                return;
            }
        };
        debug!("serving {}", self.full_path().display());
        // SAFETY: the map is read-only and private; concurrent truncation of
        // a served file is outside the server's contract.
        let mapped = match unsafe { Mmap::map(&file) } {
            Ok(mapped) => mapped,
            Err(_) => {
                self.error_body(buf, "File mmap error");
                return;
            }
        };
        self.file_len = mapped.len() as u64;
        self.file = Some(mapped);
        buf.append(format!("Content-length: {}\r\n\r\n", self.file_len).as_bytes());
    }

    /// Emits a minimal inline HTML body when the file cannot be served.
    fn error_body(&mut self, buf: &mut Buffer, message: &str) {
        self.unmap_file();
        self.file_len = 0;
        let code = self.code.unwrap_or(400);
        let phrase = reason(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"FFFFFF\">\
             {code} : {phrase}\n<p>{message}</p>\
             <hr><em>stoker</em></body></html>"
        );
        buf.append(format!("Content-length: {}\r\n", body.len()).as_bytes());
        buf.append(b"\r\n");
        buf.append(body.as_bytes());
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::{mime_for, reason, Response};
    use crate::buffer::Buffer;

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<html>home</html>").unwrap();
        fs::write(dir.path().join("404.html"), "<html>lost</html>").unwrap();
        dir
    }

    fn make(dir: &TempDir, path: &str, keep_alive: bool, code: u16) -> (Response, String) {
        let mut response = Response::new();
        let mut buf = Buffer::new(256);
        response.init(dir.path().to_str().unwrap(), path, keep_alive, code);
        response.make(&mut buf);
        let head = buf.retrieve_all_to_string();
        (response, head)
    }

    #[test]
    fn ok_response_maps_the_file_body() {
        let dir = site();
        let (response, head) = make(&dir, "/index.html", true, 200);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Content-length: 17\r\n\r\n"));
        assert_eq!(Some(&b"<html>home</html>"[..]), response.file());
    }

    #[test]
    fn missing_file_serves_the_404_page() {
        let dir = site();
        let (response, head) = make(&dir, "/nosuchfile", false, 200);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(Some(404), response.code());
        assert_eq!(Some(&b"<html>lost</html>"[..]), response.file());
    }

    #[test]
    fn directory_paths_are_not_served() {
        let dir = site();
        fs::create_dir(dir.path().join("secrets")).unwrap();
        let (response, head) = make(&dir, "/secrets", false, 200);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(Some(404), response.code());
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let dir = site();
        let guarded = dir.path().join("guarded.html");
        fs::write(&guarded, "private").unwrap();
        fs::set_permissions(&guarded, fs::Permissions::from_mode(0o640)).unwrap();
        let (response, _) = make(&dir, "/guarded.html", false, 200);
        assert_eq!(Some(403), response.code());
    }

    #[test]
    fn hinted_error_status_survives_an_existing_path() {
        let dir = site();
        fs::write(dir.path().join("400.html"), "<html>bad</html>").unwrap();
        let (response, head) = make(&dir, "", false, 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(Some(400), response.code());
        assert_eq!(Some(&b"<html>bad</html>"[..]), response.file());
    }

    #[test]
    fn unknown_status_code_collapses_to_400() {
        let dir = site();
        let (response, head) = make(&dir, "/index.html", false, 999);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(Some(400), response.code());
    }

    #[test]
    fn missing_error_page_falls_back_to_an_inline_body() {
        let dir = TempDir::new().unwrap();
        let (response, head) = make(&dir, "/nosuchfile", false, 200);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("404 : Not Found"));
        assert!(head.contains("<p>File error</p>"));
        assert!(response.file().is_none());
    }

    #[test]
    fn rebuild_unmaps_the_previous_file() {
        let dir = site();
        let mut response = Response::new();
        let mut buf = Buffer::new(256);
        response.init(dir.path().to_str().unwrap(), "/index.html", false, 200);
        response.make(&mut buf);
        assert!(response.file().is_some());
        response.init(dir.path().to_str().unwrap(), "/404.html", false, 200);
        assert!(response.file().is_none());
    }

    #[test]
    fn unmap_is_idempotent() {
        let dir = site();
        let (mut response, _) = make(&dir, "/index.html", false, 200);
        response.unmap_file();
        response.unmap_file();
        assert!(response.file().is_none());
    }

    #[test]
    fn reason_phrases_match_the_canonical_table() {
        assert_eq!(Some("OK"), reason(200));
        assert_eq!(Some("Bad Request"), reason(400));
        assert_eq!(Some("Forbidden"), reason(403));
        assert_eq!(Some("Not Found"), reason(404));
        assert_eq!(None, reason(500));
    }

    #[test]
    fn mime_table_covers_the_served_extensions() {
        assert_eq!("text/html", mime_for("/index.html"));
        assert_eq!("text/xml", mime_for("/feed.xml"));
        assert_eq!("application/xhtml+xml", mime_for("/page.xhtml"));
        assert_eq!("image/jpeg", mime_for("/cat.jpg"));
        assert_eq!("image/jpeg", mime_for("/cat.jpeg"));
        assert_eq!("video/mpeg", mime_for("/clip.mpg"));
        assert_eq!("application/x-gzip", mime_for("/bundle.gz"));
        assert_eq!("text/css", mime_for("/style.css"));
        assert_eq!("text/javascript", mime_for("/app.js"));
        assert_eq!("text/plain", mime_for("/README"));
        assert_eq!("text/plain", mime_for("/data.unknown"));
    }
}
