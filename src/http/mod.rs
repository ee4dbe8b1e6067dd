//! The small subset of HTTP/1.x spoken by the server.

mod mapped;
pub use self::mapped::Mapping;

mod request;
pub use self::request::{decode_form, ParseState, Progress, Request};

mod response;
pub use self::response::Response;

/// The statuses the server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
        }
    }

    /// The document served in place of the requested one.
    pub fn error_page(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => Some("/400.html"),
            Status::Forbidden => Some("/403.html"),
            Status::NotFound => Some("/404.html"),
        }
    }

    pub fn is_error(self) -> bool {
        self != Status::Ok
    }
}

/// Content types by file suffix.
const MIME_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/nsword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// Look up the content type of a path by its suffix, defaulting to plain text.
pub fn content_type(path: &str) -> &'static str {
    path.rfind('.')
        .and_then(|dot| {
            let suffix = &path[dot..];
            MIME_TYPES
                .iter()
                .find(|&&(known, _)| known == suffix)
                .map(|&(_, mime)| mime)
        })
        .unwrap_or("text/plain")
}
