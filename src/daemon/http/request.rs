//! HTTP requests.

use std::fmt;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::BodyStream;
use hyper::Method;
use hyper::body::Body;
use hyper::header::CONTENT_TYPE;
use log::debug;
use multer::{Constraints, Multipart, SizeLimit};
use percent_encoding::percent_decode;
use crate::commons::error::Error;
use crate::constants::{FORM_FIELD_FILE, FORM_FIELD_PIN};
use crate::daemon::signer::Pin;
use super::response::HttpResponse;
use super::server::HttpServer;


//------------ HyperRequest --------------------------------------------------

/// A type alias for the request we receive from Hyper.
pub type HyperRequest = hyper::Request<hyper::body::Incoming>;


//------------ Request -------------------------------------------------------

/// A request together with the server processing it.
pub struct Request<'a> {
    /// The underlying raw request.
    request: HyperRequest,

    /// The server providing access to the signer.
    server: &'a HttpServer,
}

impl<'a> Request<'a> {
    pub fn new(request: HyperRequest, server: &'a HttpServer) -> Self {
        Self { request, server }
    }

    /// Checks whether the request is a GET or returns an error response.
    pub fn check_get(&self) -> Result<(), HttpResponse> {
        match *self.request.method() {
            Method::GET | Method::HEAD => Ok(()),
            _ => Err(HttpResponse::method_not_allowed()),
        }
    }

    /// Checks whether the request is a POST or returns an error response.
    pub fn check_post(&self) -> Result<(), HttpResponse> {
        match *self.request.method() {
            Method::POST => Ok(()),
            _ => Err(HttpResponse::method_not_allowed()),
        }
    }

    /// Returns the current request path.
    pub fn path(&self) -> Result<RequestPath, InvalidPath> {
        RequestPath::from_request(self)
    }

    /// Reads the body as a signing form.
    ///
    /// The body must be `multipart/form-data` with a non-empty `file` and
    /// a non-empty `pin` field. Other fields are ignored.
    ///
    /// If the Content-Length header already tells us that the body is too
    /// big, we return [`Error::PostTooBig`] without reading anything.
    /// Otherwise the limit is enforced while the body is parsed.
    pub async fn read_sign_form(
        self
    ) -> Result<(&'a HttpServer, SignForm), Error> {
        let limit = self.server.config().post_limit_sign;
        if self.request.body().size_hint().lower() > limit {
            return Err(Error::PostTooBig)
        }

        let boundary = self.request.headers().get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| multer::parse_boundary(value).ok())
            .ok_or_else(|| {
                Error::invalid_form("expected a multipart/form-data body")
            })?;

        let stream = BodyStream::new(self.request.into_body())
            .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) });
        let mut multipart = Multipart::with_constraints(
            stream,
            boundary,
            Constraints::new().size_limit(
                SizeLimit::new().whole_stream(limit)
            ),
        );

        let mut file = None;
        let mut pin = None;
        while let Some(field) = multipart.next_field().await.map_err(
            form_error
        )? {
            match field.name() {
                Some(FORM_FIELD_FILE) => {
                    if file.is_some() {
                        return Err(duplicate_field(FORM_FIELD_FILE))
                    }
                    let name = field.file_name().and_then(base_name);
                    let content = field.bytes().await.map_err(form_error)?;
                    file = Some((name, content));
                }
                Some(FORM_FIELD_PIN) => {
                    if pin.is_some() {
                        return Err(duplicate_field(FORM_FIELD_PIN))
                    }
                    pin = Some(field.text().await.map_err(form_error)?);
                }
                other => {
                    debug!("Ignoring form field {:?}", other);
                }
            }
        }

        let (file_name, content) = file.ok_or_else(|| {
            Error::invalid_form(format!("missing field '{FORM_FIELD_FILE}'"))
        })?;
        if content.is_empty() {
            return Err(Error::invalid_form(format!(
                "the '{FORM_FIELD_FILE}' field must not be empty"
            )))
        }
        let pin = Pin::new(pin.ok_or_else(|| {
            Error::invalid_form(format!("missing field '{FORM_FIELD_PIN}'"))
        })?)?;

        Ok((self.server, SignForm { file_name, content, pin }))
    }
}


//------------ SignForm ------------------------------------------------------

/// The content of a signing request.
#[derive(Debug)]
pub struct SignForm {
    /// The file name given by the client, without any directories.
    pub file_name: Option<String>,

    /// The binary to sign.
    pub content: Bytes,

    pub pin: Pin,
}


//------------ RequestPath ---------------------------------------------------

/// The percent-decoded path of a request’s URI.
#[derive(Debug, Clone)]
pub struct RequestPath {
    path: String,
}

impl RequestPath {
    fn from_request(request: &Request<'_>) -> Result<Self, InvalidPath> {
        let path = percent_decode(
            request.request.uri().path().as_bytes()
        ).decode_utf8().map_err(|_| InvalidPath)?.into_owned();
        Ok(Self { path })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn iter(&self) -> PathIter<'_> {
        PathIter::new(self.as_str())
    }
}

impl AsRef<str> for RequestPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}


//------------ PathIter ------------------------------------------------------

/// An iterator over the segments of a request path.
#[derive(Debug)]
pub struct PathIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> PathIter<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            remaining: Some(path.strip_prefix('/').unwrap_or(path))
        }
    }

    /// Checks that the path has been exhausted.
    ///
    /// Returns a 404 error response if it isn’t.
    pub fn check_exhausted(&self) -> Result<(), HttpResponse> {
        if self.remaining.is_some() {
            Err(HttpResponse::not_found())
        }
        else {
            Ok(())
        }
    }
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        match remaining.find('/') {
            Some(slash) => {
                self.remaining = Some(&remaining[slash + 1..]);
                Some(&remaining[..slash])
            }
            None => {
                self.remaining = None;
                Some(remaining)
            }
        }
    }
}


//------------ InvalidPath ---------------------------------------------------

/// The request path was not valid UTF-8 after percent-decoding.
#[derive(Clone, Copy, Debug)]
pub struct InvalidPath;

impl fmt::Display for InvalidPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid request path")
    }
}


//------------ Helpers -------------------------------------------------------

fn form_error(err: multer::Error) -> Error {
    match err {
        multer::Error::StreamSizeExceeded { .. }
        | multer::Error::FieldSizeExceeded { .. } => Error::PostTooBig,
        multer::Error::StreamReadFailed(_) => Error::PostCannotRead,
        err => Error::invalid_form(err),
    }
}

fn duplicate_field(name: &str) -> Error {
    Error::invalid_form(format!("field '{name}' given more than once"))
}

/// Returns the last component of a client provided file name.
///
/// Clients may send paths with either kind of separator. Returns `None` if
/// nothing usable remains.
fn base_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    }
    else {
        Some(name.to_string())
    }
}


//============ Tests =========================================================
