//! Incremental request parsing.
//!
//! A request is consumed a line at a time from the readable region of a `Buffer`. Whenever a
//! full line is not yet available parsing stops, and picks up where it left off once more bytes
//! have been read into the buffer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use buffer::Buffer;
use credentials::CredentialStore;

/// Paths that are served from the html document of the same name.
const DEFAULT_PAGES: &[&str] = &["/index", "/register", "/login", "/welcome", "/video", "/picture"];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// The position of the parser within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

/// Outcome of feeding the buffer to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed before the request is complete.
    Incomplete,
    /// A whole request has been parsed.
    Complete,
    /// The request line was malformed. There is no recovering from this.
    Failed,
}

pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    post: HashMap<String, String>,
    users: Arc<dyn CredentialStore>,
}

impl Request {
    pub fn new(users: Arc<dyn CredentialStore>) -> Self {
        Request {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            post: HashMap::new(),
            users,
        }
    }

    /// Forget the previous request, ready to parse the next one.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    /// Consume as much of the buffer as forms complete lines of the request.
    pub fn parse(&mut self, buffer: &mut Buffer) -> Progress {
        while buffer.readable() > 0 && self.state != ParseState::Finished {
            if self.state == ParseState::Body {
                if !self.parse_body(buffer) {
                    return Progress::Incomplete;
                }
                continue;
            }

            let end = match buffer.find_crlf() {
                Some(end) => end,
                None => return Progress::Incomplete,
            };
            let line = String::from_utf8_lossy(&buffer.peek()[..end]).into_owned();
            let remaining = buffer.readable();
            buffer.retrieve_until(end + 2);

            match self.state {
                ParseState::RequestLine => {
                    if !self.parse_request_line(&line) {
                        return Progress::Failed;
                    }
                    self.parse_path();
                }
                ParseState::Headers => {
                    if !self.parse_header(&line) {
                        self.state = self.after_headers(remaining);
                    }
                }
                _ => unreachable!(),
            }
        }

        if self.state == ParseState::Finished {
            debug!("[{}], [{}], [{}]", self.method, self.path, self.version);
            Progress::Complete
        } else {
            Progress::Incomplete
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|value| &value[..])
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A decoded form field from the body of a POST request.
    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(|value| &value[..])
    }

    /// Keep-alive is only honoured for HTTP/1.1 clients that asked for it.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }

    /// `METHOD SP PATH SP "HTTP/" VERSION`
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(protocol), None) if protocol.starts_with("HTTP/") => {
                self.method = method.to_owned();
                self.path = path.to_owned();
                self.version = protocol["HTTP/".len()..].to_owned();
                self.state = ParseState::Headers;
                true
            }
            _ => {
                warn!("Malformed request line {:?}", line);
                false
            }
        }
    }

    fn parse_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if DEFAULT_PAGES.contains(&&self.path[..]) {
            self.path.push_str(".html");
        }
    }

    /// `KEY ":" SP? VALUE`. Returns false for any other line, which ends the headers.
    fn parse_header(&mut self, line: &str) -> bool {
        match line.find(':') {
            Some(colon) => {
                let rest = &line[colon + 1..];
                let value = if rest.starts_with(' ') { &rest[1..] } else { rest };
                self.headers.insert(line[..colon].to_owned(), value.to_owned());
                true
            }
            None => false,
        }
    }

    /// Where to go once the headers are done. `remaining` counts the readable bytes from the
    /// start of the line that ended them.
    fn after_headers(&self, remaining: usize) -> ParseState {
        match self.content_length() {
            Some(0) => ParseState::Finished,
            Some(_) => ParseState::Body,
            None if remaining <= 2 => ParseState::Finished,
            None => ParseState::Body,
        }
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// The body is a single line, or exactly `Content-Length` bytes when that header was sent.
    /// Returns false while the body has not fully arrived.
    fn parse_body(&mut self, buffer: &mut Buffer) -> bool {
        match self.content_length() {
            Some(len) => {
                if buffer.readable() < len {
                    return false;
                }
                self.body = buffer.peek()[..len].to_vec();
                buffer.retrieve(len);
            }
            None => match buffer.find_crlf() {
                Some(end) => {
                    self.body = buffer.peek()[..end].to_vec();
                    buffer.retrieve_until(end + 2);
                }
                None => {
                    self.body = buffer.peek().to_vec();
                    let len = buffer.readable();
                    buffer.retrieve(len);
                }
            },
        }

        debug!("Body: {:?}, len: {}", String::from_utf8_lossy(&self.body), self.body.len());
        self.parse_post();
        self.state = ParseState::Finished;
        true
    }

    fn parse_post(&mut self) {
        if self.method != "POST" || self.header("Content-Type") != Some(FORM_URLENCODED) {
            return;
        }

        self.post = decode_form(&self.body);

        let is_login = match &self.path[..] {
            "/register.html" => false,
            "/login.html" => true,
            _ => return,
        };

        let verified = {
            let username = self.post("username").unwrap_or("");
            let password = self.post("password").unwrap_or("");
            self.users.verify_or_register(username, password, is_login)
        };

        self.path = if verified {
            "/welcome.html".to_owned()
        } else {
            "/error.html".to_owned()
        };
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &String::from_utf8_lossy(&self.body))
            .finish()
    }
}

/// Decode an `application/x-www-form-urlencoded` body.
///
/// `+` becomes a space and `%XX` becomes the byte it encodes. Later duplicates of a key replace
/// earlier ones.
pub fn decode_form(body: &[u8]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for pair in body.split(|&byte| byte == b'&') {
        if pair.is_empty() {
            continue;
        }
        let mut halves = pair.splitn(2, |&byte| byte == b'=');
        let key = decode_component(halves.next().unwrap_or(b""));
        let value = decode_component(halves.next().unwrap_or(b""));
        fields.insert(key, value);
    }
    fields
}

fn decode_component(raw: &[u8]) -> String {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => decoded.push(b' '),
            b'%' if i + 2 < raw.len() => match (hex(raw[i + 1]), hex(raw[i + 2])) {
                (Some(high), Some(low)) => {
                    decoded.push(high << 4 | low);
                    i += 2;
                }
                _ => decoded.push(b'%'),
            },
            byte => decoded.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
