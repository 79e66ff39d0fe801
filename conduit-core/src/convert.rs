//! Parameter converters
//!
//! A [`ParamConverter`] turns the raw value(s) found for a parameter into
//! the typed [`Arg`] a handler expects. Converters are chosen when the
//! resource model is built, so binding never has to inspect types at
//! request time.

use crate::form::{FileInfo, FormFile};
use crate::media::MediaTypeConverter;
use crate::value::{Arg, TypeKey};
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::io::{Cursor, Read};
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

/// Readable stream over a parameter value, a file part or the body
pub type ByteStream = Box<dyn Read + Send>;

/// Why a raw value could not be converted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertFailure {
    /// Nothing to convert and the target requires a value
    Missing,
    Invalid(String),
}

impl ConvertFailure {
    pub fn invalid(reason: impl Display) -> Self {
        ConvertFailure::Invalid(reason.to_string())
    }
}

pub trait ParamConverter: Send + Sync {
    /// Type of the produced value
    fn target(&self) -> TypeKey;

    /// Convert raw string values; `None` when the request carries none
    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure>;

    /// Convert uploaded files. `None` means the target cannot take files and
    /// the caller should fall back to the text path.
    fn convert_files(&self, _files: &[FormFile]) -> Option<Result<Arg, ConvertFailure>> {
        None
    }

    /// Convert a body (or a form part) through its media-type converter
    fn convert_body(
        &self,
        _media: &dyn MediaTypeConverter,
        body: &[u8],
    ) -> Result<Arg, ConvertFailure> {
        let text = std::str::from_utf8(body).map_err(ConvertFailure::invalid)?;
        self.convert(Some(&[text.to_owned()]))
    }
}

fn first(raw: Option<&[String]>) -> Option<&str> {
    raw.and_then(|values| values.first()).map(String::as_str)
}

struct Scalar<T>(PhantomData<fn() -> T>);

impl<T> ParamConverter for Scalar<T>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    fn target(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure> {
        let value = first(raw).ok_or(ConvertFailure::Missing)?;
        value
            .parse::<T>()
            .map(Arg::new)
            .map_err(ConvertFailure::invalid)
    }
}

/// Required value parsed with `FromStr`
pub fn scalar<T>() -> Arc<dyn ParamConverter>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    Arc::new(Scalar::<T>(PhantomData))
}

/// Required `String`
pub fn text() -> Arc<dyn ParamConverter> {
    scalar::<String>()
}

struct Optional<T>(PhantomData<fn() -> T>);

impl<T> ParamConverter for Optional<T>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    fn target(&self) -> TypeKey {
        TypeKey::of::<Option<T>>()
    }

    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure> {
        match first(raw) {
            None => Ok(Arg::new(None::<T>)),
            Some(value) => value
                .parse::<T>()
                .map(|v| Arg::new(Some(v)))
                .map_err(ConvertFailure::invalid),
        }
    }
}

/// `Option<T>`: `None` instead of a missing-parameter failure
pub fn optional<T>() -> Arc<dyn ParamConverter>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    Arc::new(Optional::<T>(PhantomData))
}

struct List<T>(PhantomData<fn() -> T>);

impl<T> ParamConverter for List<T>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    fn target(&self) -> TypeKey {
        TypeKey::of::<Vec<T>>()
    }

    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure> {
        raw.unwrap_or_default()
            .iter()
            .map(|value| value.parse::<T>().map_err(ConvertFailure::invalid))
            .collect::<Result<Vec<T>, _>>()
            .map(Arg::new)
    }
}

/// `Vec<T>` of every value; empty when none
pub fn list<T>() -> Arc<dyn ParamConverter>
where
    T: FromStr + Send + 'static,
    T::Err: Display,
{
    Arc::new(List::<T>(PhantomData))
}

struct Bean<T>(PhantomData<fn() -> T>);

impl<T> ParamConverter for Bean<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn target(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure> {
        let value = first(raw).ok_or(ConvertFailure::Missing)?;
        // A JSON document when the value parses as one, a plain string otherwise
        let tree = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
        serde_json::from_value::<T>(tree)
            .map(Arg::new)
            .map_err(ConvertFailure::invalid)
    }

    fn convert_body(
        &self,
        media: &dyn MediaTypeConverter,
        body: &[u8],
    ) -> Result<Arg, ConvertFailure> {
        let tree = media.to_value(body).map_err(ConvertFailure::invalid)?;
        serde_json::from_value::<T>(tree)
            .map(Arg::new)
            .map_err(ConvertFailure::invalid)
    }
}

/// Any `DeserializeOwned` type, decoded by the media-type converter
pub fn bean<T>() -> Arc<dyn ParamConverter>
where
    T: DeserializeOwned + Send + 'static,
{
    Arc::new(Bean::<T>(PhantomData))
}

struct Stream;

impl ParamConverter for Stream {
    fn target(&self) -> TypeKey {
        TypeKey::of::<ByteStream>()
    }

    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure> {
        let value = first(raw).ok_or(ConvertFailure::Missing)?;
        let stream: ByteStream = Box::new(Cursor::new(value.as_bytes().to_vec()));
        Ok(Arg::new(stream))
    }

    fn convert_files(&self, files: &[FormFile]) -> Option<Result<Arg, ConvertFailure>> {
        let file = files.first()?;
        Some(
            file.open()
                .map(|f| Arg::new(Box::new(f) as ByteStream))
                .map_err(ConvertFailure::invalid),
        )
    }

    fn convert_body(
        &self,
        _media: &dyn MediaTypeConverter,
        body: &[u8],
    ) -> Result<Arg, ConvertFailure> {
        let stream: ByteStream = Box::new(Cursor::new(body.to_vec()));
        Ok(Arg::new(stream))
    }
}

/// [`ByteStream`] over a file part, a text value or the whole body
pub fn byte_stream() -> Arc<dyn ParamConverter> {
    Arc::new(Stream)
}

/// Converters that only accept file parts
struct FileTarget<T> {
    make: fn(&[FormFile]) -> Option<T>,
}

impl<T: Send + 'static> ParamConverter for FileTarget<T> {
    fn target(&self) -> TypeKey {
        TypeKey::of::<T>()
    }

    fn convert(&self, raw: Option<&[String]>) -> Result<Arg, ConvertFailure> {
        match raw {
            None => Err(ConvertFailure::Missing),
            Some(_) => Err(ConvertFailure::Invalid("value is not a file".into())),
        }
    }

    fn convert_files(&self, files: &[FormFile]) -> Option<Result<Arg, ConvertFailure>> {
        Some((self.make)(files).map(Arg::new).ok_or(ConvertFailure::Missing))
    }
}

/// [`FileInfo`] of the first file of a field
pub fn file_info() -> Arc<dyn ParamConverter> {
    Arc::new(FileTarget::<FileInfo> {
        make: |files| files.first().map(FormFile::info),
    })
}

/// The first [`FormFile`] of a field
pub fn form_file() -> Arc<dyn ParamConverter> {
    Arc::new(FileTarget::<FormFile> {
        make: |files| files.first().cloned(),
    })
}

/// Every [`FormFile`] of a field
pub fn form_files() -> Arc<dyn ParamConverter> {
    Arc::new(FileTarget::<Vec<FormFile>> {
        make: |files| Some(files.to_vec()),
    })
}
