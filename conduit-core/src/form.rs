//! Form extraction: multipart and url-encoded bodies
//!
//! A form body is parsed at most once per request into a [`FormState`]:
//! a multi-valued parameter map plus the content type first seen for each
//! field. File parts are written to a private directory owned by the
//! request's [`RequestResources`], which removes them once the request is
//! finished (or dropped half-way through binding).

use crate::error::FormError;
use crate::http::{Request, media_type_essence};
use crate::media::{APPLICATION_FORM_URLENCODED, APPLICATION_OCTET_STREAM, MULTIPART_FORM_DATA, TEXT_PLAIN};
use bytes::Bytes;
use memchr::memmem;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, trace, warn};

/// An uploaded file stored on disk for the lifetime of the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormFile {
    /// Client-supplied file name, sanitised
    pub file_name: String,

    /// Content type declared for the part
    pub content_type: String,

    /// Location of the stored file
    pub path: PathBuf,

    /// Size in bytes
    pub size: u64,
}

impl FormFile {
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            file_name: self.file_name.clone(),
            content_type: self.content_type.clone(),
            size: self.size,
        }
    }
}

/// Metadata of an uploaded file without access to its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

/// One value of a form field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File(FormFile),
}

impl FormValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormValue::Text(text) => Some(text),
            FormValue::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FormFile> {
        match self {
            FormValue::File(file) => Some(file),
            FormValue::Text(_) => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FormValue::File(_))
    }
}

/// Multi-valued parameter map; values keep their arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParams {
    values: HashMap<String, Vec<FormValue>>,
}

impl FormParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `a=1&b=2&a=3`, keeping repeated keys
    pub fn from_urlencoded(input: &[u8]) -> Result<Self, FormError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(input)?;
        let mut params = Self::new();
        for (key, value) in pairs {
            params.push(key, FormValue::Text(value));
        }
        Ok(params)
    }

    pub fn push(&mut self, name: impl Into<String>, value: FormValue) {
        self.values.entry(name.into()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&[FormValue]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.get(name)?.iter().find_map(FormValue::as_text)
    }

    /// Text values of a field, files skipped
    pub fn texts(&self, name: &str) -> Vec<String> {
        self.get(name)
            .unwrap_or_default()
            .iter()
            .filter_map(FormValue::as_text)
            .map(str::to_owned)
            .collect()
    }

    pub fn files(&self, name: &str) -> Vec<FormFile> {
        self.get(name)
            .unwrap_or_default()
            .iter()
            .filter_map(FormValue::as_file)
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Limits applied while extracting a form body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormLimits {
    pub max_parts: usize,
    pub max_bytes: Option<usize>,
}

impl Default for FormLimits {
    fn default() -> Self {
        Self {
            max_parts: 1000,
            max_bytes: None,
        }
    }
}

/// Parsed form of one request
#[derive(Debug, Clone, Default)]
pub struct FormState {
    params: FormParams,
    content_types: HashMap<String, String>,
}

impl FormState {
    /// Parse the body of `request` if it is a multipart or url-encoded form.
    ///
    /// Any other body yields an empty state.
    pub fn extract(
        request: &Request,
        limits: FormLimits,
        resources: &mut RequestResources,
    ) -> Result<Self, FormError> {
        let Some(content_type) = request.content_type() else {
            return Ok(Self::default());
        };
        let media_type = media_type_essence(content_type);
        if media_type != MULTIPART_FORM_DATA && media_type != APPLICATION_FORM_URLENCODED {
            return Ok(Self::default());
        }

        if let Some(limit) = limits.max_bytes {
            let actual = request.body_len();
            if actual > limit {
                return Err(FormError::TooLarge { limit, actual });
            }
        }

        let body = request.full_body();
        if media_type == APPLICATION_FORM_URLENCODED {
            return Ok(Self {
                params: FormParams::from_urlencoded(&body)?,
                content_types: HashMap::new(),
            });
        }

        let parser = MultipartParser::from_content_type(content_type)?.with_max_parts(limits.max_parts);
        let mut state = Self::default();
        for item in parser.parts(&body) {
            let item = item?;
            state
                .content_types
                .entry(item.name.clone())
                .or_insert_with(|| item.content_type.clone());

            let value = if item.is_file() {
                FormValue::File(resources.store_upload(&item)?)
            } else {
                let text = String::from_utf8(item.data.to_vec()).map_err(|_| {
                    FormError::Malformed(format!("field {} is not valid UTF-8", item.name))
                })?;
                FormValue::Text(text)
            };
            state.params.push(item.name, value);
        }

        debug!(
            fields = state.params.len(),
            files = resources.tracked_files().len(),
            "Parsed multipart form"
        );
        Ok(state)
    }

    pub fn params(&self) -> &FormParams {
        &self.params
    }

    pub fn into_params(self) -> FormParams {
        self.params
    }

    /// Content type of the first part seen for `name`
    pub fn content_type(&self, name: &str) -> Option<&str> {
        self.content_types.get(name).map(String::as_str)
    }
}

/// One part of a multipart body
#[derive(Debug, Clone)]
pub struct FormItem<'a> {
    pub name: String,
    pub file_name: Option<String>,
    /// Lower-cased media type, `text/plain` when the part declares none
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub data: &'a [u8],
}

impl FormItem<'_> {
    pub fn is_file(&self) -> bool {
        self.file_name.is_some() || self.content_type == APPLICATION_OCTET_STREAM
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// `multipart/form-data` parser
#[derive(Debug, Clone)]
pub struct MultipartParser {
    boundary: String,
    max_parts: usize,
}

impl MultipartParser {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            max_parts: FormLimits::default().max_parts,
        }
    }

    /// Take the boundary from a `Content-Type` header value
    pub fn from_content_type(content_type: &str) -> Result<Self, FormError> {
        let boundary = header_params(content_type)
            .into_iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("boundary"))
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty())
            .ok_or(FormError::MissingBoundary)?;
        Ok(Self::new(boundary))
    }

    pub fn with_max_parts(mut self, max_parts: usize) -> Self {
        self.max_parts = max_parts;
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Lazily iterate over the parts of `body`
    pub fn parts<'a>(&self, body: &'a [u8]) -> FormParamIterator<'a> {
        let delimiter = format!("\r\n--{}", self.boundary).into_bytes();
        FormParamIterator {
            body,
            finder: memmem::Finder::new(&delimiter).into_owned(),
            delimiter,
            pos: None,
            parsed: 0,
            max_parts: self.max_parts,
            finished: false,
        }
    }

    /// Parse every part eagerly
    pub fn parse<'a>(&self, body: &'a [u8]) -> Result<Vec<FormItem<'a>>, FormError> {
        self.parts(body).collect()
    }
}

/// Multipart body handed to handlers that walk the parts themselves
#[derive(Debug, Clone)]
pub struct MultipartBody {
    parser: MultipartParser,
    body: Bytes,
}

impl MultipartBody {
    pub fn from_request(request: &Request, limits: FormLimits) -> Result<Self, FormError> {
        let content_type = request.content_type().unwrap_or_default();
        if media_type_essence(content_type) != MULTIPART_FORM_DATA {
            return Err(FormError::Malformed(format!(
                "expected {MULTIPART_FORM_DATA}, got '{content_type}'"
            )));
        }
        Ok(Self {
            parser: MultipartParser::from_content_type(content_type)?
                .with_max_parts(limits.max_parts),
            body: request.full_body(),
        })
    }

    pub fn boundary(&self) -> &str {
        self.parser.boundary()
    }

    pub fn iter(&self) -> FormParamIterator<'_> {
        self.parser.parts(&self.body)
    }
}

/// Lazy iterator over multipart parts; stops after the first error
pub struct FormParamIterator<'a> {
    body: &'a [u8],
    finder: memmem::Finder<'static>,
    /// `\r\n--boundary`
    delimiter: Vec<u8>,
    /// Position right after the last boundary seen
    pos: Option<usize>,
    parsed: usize,
    max_parts: usize,
    finished: bool,
}

impl<'a> FormParamIterator<'a> {
    fn advance(&mut self) -> Result<Option<FormItem<'a>>, FormError> {
        let mut pos = match self.pos {
            Some(pos) => pos,
            None => {
                // The first boundary may open the body without a leading CRLF
                let opening = &self.delimiter[2..];
                let start = memmem::find(self.body, opening)
                    .ok_or_else(|| FormError::Malformed("missing opening boundary".into()))?;
                start + opening.len()
            }
        };

        let rest = &self.body[pos..];
        if rest.starts_with(b"--") {
            return Ok(None);
        }
        let line_end = memmem::find(rest, b"\r\n")
            .ok_or_else(|| FormError::Malformed("boundary line is not terminated".into()))?;
        if rest[..line_end].iter().any(|b| !matches!(b, b' ' | b'\t')) {
            return Err(FormError::Malformed("unexpected data after boundary".into()));
        }
        pos += line_end + 2;

        if self.parsed >= self.max_parts {
            return Err(FormError::TooManyParts {
                limit: self.max_parts,
            });
        }

        let (headers_end, content_start) = if self.body[pos..].starts_with(b"\r\n") {
            (pos, pos + 2)
        } else {
            let end = memmem::find(&self.body[pos..], b"\r\n\r\n")
                .ok_or_else(|| FormError::Malformed("part headers are not terminated".into()))?;
            (pos + end, pos + end + 4)
        };
        let headers = parse_part_headers(&self.body[pos..headers_end])?;

        let content_end = self
            .finder
            .find(&self.body[content_start..])
            .map(|offset| content_start + offset)
            .ok_or_else(|| FormError::Malformed("part is not terminated by a boundary".into()))?;
        self.pos = Some(content_end + self.delimiter.len());
        self.parsed += 1;

        let mut name = None;
        let mut file_name = None;
        let mut content_type = TEXT_PLAIN.to_string();
        for (key, value) in &headers {
            if key.eq_ignore_ascii_case("content-disposition") {
                for (param, param_value) in header_params(value) {
                    if param.eq_ignore_ascii_case("name") {
                        name = Some(param_value);
                    } else if param.eq_ignore_ascii_case("filename") {
                        file_name = Some(param_value);
                    }
                }
            } else if key.eq_ignore_ascii_case("content-type") {
                content_type = media_type_essence(value);
            }
        }
        let name = name
            .ok_or_else(|| FormError::Malformed("part has no field name".into()))?;

        trace!(field = %name, file = file_name.is_some(), "Multipart part");
        Ok(Some(FormItem {
            name,
            file_name,
            content_type,
            headers,
            data: &self.body[content_start..content_end],
        }))
    }
}

impl<'a> Iterator for FormParamIterator<'a> {
    type Item = Result<FormItem<'a>, FormError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn parse_part_headers(raw: &[u8]) -> Result<Vec<(String, String)>, FormError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| FormError::Malformed("part headers are not valid UTF-8".into()))?;
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| FormError::Malformed(format!("invalid part header: {line}")))
        })
        .collect()
}

/// `key=value` parameters after the first `;` of a header value; quoted
/// values may contain `;`
fn header_params(value: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .skip(1)
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Final path component of a client-supplied file name, or `None` when
/// nothing usable is left
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Scratch files owned by one request.
///
/// The directory is created below the configured temp root on the first
/// upload. [`RequestResources::cleanup`] removes everything; dropping the
/// value does the same.
#[derive(Debug)]
pub struct RequestResources {
    temp_root: PathBuf,
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
}

impl RequestResources {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            dir: None,
            files: Vec::new(),
        }
    }

    pub fn temp_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn tracked_files(&self) -> &[PathBuf] {
        &self.files
    }

    fn ensure_dir(&mut self) -> io::Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.path().to_path_buf());
        }
        std::fs::create_dir_all(&self.temp_root)?;
        let dir = tempfile::Builder::new()
            .prefix("request-")
            .tempdir_in(&self.temp_root)?;
        let path = dir.path().to_path_buf();
        debug!(dir = %path.display(), "Created request temp directory");
        self.dir = Some(dir);
        Ok(path)
    }

    /// Write a file part into the request directory and track it
    pub fn store_upload(&mut self, item: &FormItem<'_>) -> io::Result<FormFile> {
        let dir = self.ensure_dir()?;
        let file_name = item
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .or_else(|| sanitize_file_name(&item.name))
            .unwrap_or_else(|| "upload".to_string());

        let mut path = dir.join(&file_name);
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("{suffix}-{file_name}"));
            suffix += 1;
        }

        std::fs::write(&path, item.data)?;
        trace!(path = %path.display(), bytes = item.data.len(), "Stored uploaded file");
        self.files.push(path.clone());

        Ok(FormFile {
            file_name,
            content_type: item.content_type.clone(),
            path,
            size: item.data.len() as u64,
        })
    }

    /// Delete tracked files and the request directory
    pub fn cleanup(&mut self) -> io::Result<()> {
        let mut first_error = None;
        for path in self.files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => trace!(path = %path.display(), "Removed temp file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(dir = %path.display(), error = %e, "Failed to remove request temp directory");
                first_error.get_or_insert(e);
            } else {
                debug!(dir = %path.display(), "Removed request temp directory");
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for RequestResources {
    fn drop(&mut self) {
        if self.dir.is_some() || !self.files.is_empty() {
            let _ = self.cleanup();
        }
    }
}
