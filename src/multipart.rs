//! Incremental multipart/form-data stream parser
//!
//! Batch downloads arrive as one multipart response with a file per part.
//! The parser consumes the stream in whatever increments the transport
//! delivers, spilling part bodies straight to disk; only a small tail is
//! buffered so a boundary split across reads is still recognized.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use memchr::memmem;

use crate::error::{Result, SyncError};

const CRLF: &[u8] = b"\r\n";
const DASH: &[u8] = b"--";
const HEADER_SEP: &[u8] = b"\r\n\r\n";

// A part header larger than this is rejected as malformed.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Extracts the boundary token from a `Content-Type` header value such as
/// `multipart/form-data; boundary=aBc123`. Quoted boundaries are unquoted.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (_, rest) = content_type.split_once("boundary=")?;
    let rest = rest.trim();
    let boundary = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next().unwrap_or("").to_string()
    } else {
        rest.split(';').next().unwrap_or(rest).trim().to_string()
    };
    if boundary.is_empty() {
        None
    } else {
        Some(boundary)
    }
}

/// First free `<path>_conflict_copy<n>` alongside `path`, smallest `n`
/// starting at zero. The suffix goes after the extension, so
/// `data.gpkg` becomes `data.gpkg_conflict_copy0`.
pub fn conflict_copy_path(path: &Path) -> PathBuf {
    let mut n = 0u32;
    loop {
        let mut os = path.as_os_str().to_os_string();
        os.push(format!("_conflict_copy{n}"));
        let candidate = PathBuf::from(os);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Joins an untrusted server-supplied path under `root`, refusing absolute
/// paths and any `..` traversal.
pub(crate) fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for comp in Path::new(rel).components() {
        match comp {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            _ => {
                return Err(SyncError::Parse(format!(
                    "refusing to write part outside project directory: '{rel}'"
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SyncError::Parse("part filename is empty".into()));
    }
    Ok(root.join(clean))
}

fn filename_from_headers(block: &[u8]) -> Result<Option<String>> {
    let text = std::str::from_utf8(block)
        .map_err(|_| SyncError::Parse("part header is not valid UTF-8".into()))?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        return Ok(match value.split_once("filename=\"") {
            Some((_, rest)) => {
                let Some((fname, _)) = rest.split_once('"') else {
                    return Err(SyncError::Parse("unterminated filename in part header".into()));
                };
                if fname.is_empty() {
                    None
                } else {
                    Some(fname.to_string())
                }
            }
            // A plain form field; its body is consumed and dropped.
            None => None,
        });
    }
    Err(SyncError::Parse("part without content-disposition header".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the first boundary; bytes here are discarded.
    Preamble,
    /// Between a boundary and the blank line ending the part headers.
    Header,
    /// Inside a part body, copying to the sink.
    Body,
}

enum Sink {
    Idle,
    File { file: File, rel: String },
    Discard,
}

pub struct MultipartStreamParser {
    /// `--boundary`
    delim: Vec<u8>,
    /// `\r\n--boundary`, the separator between a body and the next boundary.
    body_marker: Vec<u8>,
    root: PathBuf,
    overwrite: bool,
    buf: Vec<u8>,
    state: State,
    sink: Sink,
    written: Vec<String>,
    finished: bool,
}

impl MultipartStreamParser {
    pub fn new(boundary: &str, root: &Path, overwrite: bool) -> Self {
        let delim = [DASH, boundary.as_bytes()].concat();
        let body_marker = [CRLF, delim.as_slice()].concat();
        MultipartStreamParser {
            delim,
            body_marker,
            root: root.to_path_buf(),
            overwrite,
            buf: Vec::new(),
            state: State::Preamble,
            sink: Sink::Idle,
            written: Vec::new(),
            finished: false,
        }
    }

    /// Builds a parser from the response `Content-Type`, which must carry
    /// a boundary parameter.
    pub fn from_content_type(content_type: &str, root: &Path, overwrite: bool) -> Result<Self> {
        let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
            SyncError::Parse(format!("no multipart boundary in '{content_type}'"))
        })?;
        Ok(Self::new(&boundary, root, overwrite))
    }

    /// Consumes the next increment of the stream. Increment size is
    /// arbitrary; a boundary may arrive split across any number of calls.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.buf.extend_from_slice(bytes);
        self.process()
    }

    /// Signals end of stream. Errors unless the terminal boundary was seen
    /// with no part left open. Returns the relative paths written, in
    /// stream order.
    pub fn finish(self) -> Result<Vec<String>> {
        if !self.finished {
            return Err(SyncError::Parse("multipart stream ended mid-part".into()));
        }
        Ok(self.written)
    }

    fn process(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::Preamble => {
                    let Some(pos) = memmem::find(&self.buf, &self.delim) else {
                        // Keep only what could still turn into a boundary.
                        let keep = (self.delim.len() - 1).min(self.buf.len());
                        self.buf.drain(..self.buf.len() - keep);
                        return Ok(());
                    };
                    let after = pos + self.delim.len();
                    if self.buf.len() < after + 2 {
                        self.buf.drain(..pos);
                        return Ok(());
                    }
                    let next2: &[u8] = &self.buf[after..after + 2];
                    if next2 == DASH {
                        // Degenerate body with zero parts.
                        self.finished = true;
                        self.buf.clear();
                        return Ok(());
                    } else if next2 == CRLF {
                        self.buf.drain(..after + 2);
                        self.state = State::Header;
                    } else {
                        // Preamble text that merely contains the token.
                        self.buf.drain(..pos + 1);
                    }
                }
                State::Header => {
                    let Some(pos) = memmem::find(&self.buf, HEADER_SEP) else {
                        if self.buf.len() > MAX_HEADER_BYTES {
                            return Err(SyncError::Parse("part header too large".into()));
                        }
                        return Ok(());
                    };
                    let filename = filename_from_headers(&self.buf[..pos])?;
                    self.open_sink(filename)?;
                    self.buf.drain(..pos + HEADER_SEP.len());
                    self.state = State::Body;
                }
                State::Body => {
                    let marker_len = self.body_marker.len();
                    match memmem::find(&self.buf, &self.body_marker) {
                        Some(pos) => {
                            let after = pos + marker_len;
                            if self.buf.len() < after + 2 {
                                // Can't yet tell terminal from separator;
                                // flush what is certainly body and wait.
                                self.write_body(pos)?;
                                self.buf.drain(..pos);
                                return Ok(());
                            }
                            let next2: &[u8] = &self.buf[after..after + 2];
                            if next2 == CRLF {
                                self.write_body(pos)?;
                                self.close_sink();
                                self.buf.drain(..after + 2);
                                self.state = State::Header;
                            } else if next2 == DASH {
                                self.write_body(pos)?;
                                self.close_sink();
                                self.finished = true;
                                self.buf.clear();
                                return Ok(());
                            } else {
                                // Body content that happens to look like a
                                // boundary; copy one byte and rescan.
                                self.write_body(pos + 1)?;
                                self.buf.drain(..pos + 1);
                            }
                        }
                        None => {
                            // Hold back enough bytes to cover a boundary
                            // split across increments; flush the rest.
                            let hold = self.delim.len() + 8;
                            if self.buf.len() > hold {
                                let cut = self.buf.len() - hold;
                                self.write_body(cut)?;
                                self.buf.drain(..cut);
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn open_sink(&mut self, filename: Option<String>) -> Result<()> {
        let Some(rel) = filename else {
            self.sink = Sink::Discard;
            return Ok(());
        };
        let dest = safe_join(&self.root, &rel)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            if self.overwrite {
                fs::remove_file(&dest)?;
            } else {
                fs::rename(&dest, conflict_copy_path(&dest))?;
            }
        }
        let file = File::create(&dest)?;
        self.sink = Sink::File { file, rel };
        Ok(())
    }

    fn write_body(&mut self, upto: usize) -> Result<()> {
        if upto == 0 {
            return Ok(());
        }
        if let Sink::File { file, .. } = &mut self.sink {
            file.write_all(&self.buf[..upto])?;
        }
        Ok(())
    }

    fn close_sink(&mut self) {
        if let Sink::File { rel, .. } = std::mem::replace(&mut self.sink, Sink::Idle) {
            self.written.push(rel);
        }
    }
}
