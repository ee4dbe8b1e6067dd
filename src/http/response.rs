//! Building responses for parsed requests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use buffer::Buffer;

use super::{content_type, Mapping, Status};

/// Permission bit for "readable by others".
const WORLD_READABLE: u32 = 0o004;

#[derive(Debug)]
pub struct Response {
    status: Status,
    hint: Option<Status>,
    keep_alive: bool,
    root: PathBuf,
    path: String,
    file: Option<Mapping>,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: Status::Ok,
            hint: None,
            keep_alive: false,
            root: PathBuf::new(),
            path: String::new(),
            file: None,
        }
    }

    /// Prepare for a new response, releasing the file mapped for the previous one.
    pub fn init(&mut self, root: &Path, path: &str, keep_alive: bool, hint: Option<Status>) {
        self.file = None;
        self.status = hint.unwrap_or(Status::Ok);
        self.hint = hint;
        self.keep_alive = keep_alive;
        self.root = root.to_path_buf();
        self.path = path.to_owned();
    }

    /// Write the status line and headers into `buffer`, mapping the document to be sent as the
    /// body. If the document cannot be mapped, a small html error page is written into the buffer
    /// instead.
    pub fn build(&mut self, buffer: &mut Buffer) {
        self.status = self.resolve_status();
        if let Some(page) = self.status.error_page() {
            self.path = page.to_owned();
        }

        self.add_status_line(buffer);
        self.add_headers(buffer);
        self.add_content(buffer);
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The mapped body, if there is one.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_ref().map(|mapping| mapping.as_slice())
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, |mapping| mapping.len())
    }

    /// Drop the mapped body early.
    pub fn release(&mut self) {
        self.file = None;
    }

    fn target(&self) -> PathBuf {
        self.root.join(self.path.trim_start_matches('/'))
    }

    /// Whether the request path stays below the document root. Only plain names are allowed, so
    /// `..` and absolute segments are refused before anything touches the disk.
    fn inside_root(&self) -> bool {
        Path::new(self.path.trim_start_matches('/'))
            .components()
            .all(|part| match part {
                Component::Normal(_) | Component::CurDir => true,
                _ => false,
            })
    }

    /// An error hint from the parser always wins. Otherwise the document on disk decides.
    fn resolve_status(&self) -> Status {
        if let Some(hint) = self.hint {
            if hint.is_error() {
                return hint;
            }
        }

        if !self.inside_root() {
            warn!("Refusing {:?}, it leaves the document root", self.path);
            return Status::NotFound;
        }

        match fs::metadata(self.target()) {
            Err(_) => Status::NotFound,
            Ok(ref meta) if meta.is_dir() => Status::NotFound,
            Ok(ref meta) if meta.permissions().mode() & WORLD_READABLE == 0 => Status::Forbidden,
            Ok(_) => self.hint.unwrap_or(Status::Ok),
        }
    }

    fn add_status_line(&self, buffer: &mut Buffer) {
        buffer.append_str(&format!(
            "HTTP/1.1 {} {} \r\n",
            self.status.code(),
            self.status.reason()
        ));
    }

    fn add_headers(&self, buffer: &mut Buffer) {
        buffer.append_str("Connection: ");
        if self.keep_alive {
            buffer.append_str("keep-alive\r\n");
            buffer.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buffer.append_str("close\r\n");
        }
        buffer.append_str(&format!("Content-Type: {}\r\n", content_type(&self.path)));
    }

    fn add_content(&mut self, buffer: &mut Buffer) {
        let target = self.target();
        let len = match fs::metadata(&target) {
            Ok(meta) => meta.len(),
            Err(_) => return self.add_error_content(buffer, "File does not exist!"),
        };

        if len == 0 {
            buffer.append_str("Content-Length: 0\r\n\r\n");
            return;
        }

        debug!("Mapping {:?}", target);
        match Mapping::open(&target) {
            Ok(mapping) => {
                buffer.append_str(&format!("Content-Length: {}\r\n\r\n", mapping.len()));
                self.file = Some(mapping);
            }
            Err(e) => {
                warn!("Could not map {:?}: {}", target, e);
                self.add_error_content(buffer, "File does not exist!");
            }
        }
    }

    fn add_error_content(&self, buffer: &mut Buffer, message: &str) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p>\
             <hr><em>web-server</em></body></html>",
            self.status.code(),
            self.status.reason(),
            message
        );
        buffer.append_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        buffer.append_str(&body);
    }
}
