use std::io;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::{HeaderMap, StatusCode};
use hyper::body::Frame;
use hyper::header::{
    CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use crate::commons::error::Error;
use crate::constants::RESPONSE_CHUNK_SIZE;
use crate::daemon::scratch::ScratchPair;


/// The characters escaped in an RFC 5987 encoded file name.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!').remove(b'#').remove(b'$').remove(b'&').remove(b'+')
    .remove(b'-').remove(b'.').remove(b'^').remove(b'_').remove(b'`')
    .remove(b'|').remove(b'~');


//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy)]
enum ContentType {
    Binary,
    Json,
    Text,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            ContentType::Binary => "application/octet-stream",
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
        }
    }
}


//------------ HyperResponse -------------------------------------------------

pub type HyperResponseBody = UnsyncBoxBody<Bytes, io::Error>;
pub type HyperResponse = hyper::Response<HyperResponseBody>;


//----------- Response -------------------------------------------------------

struct Response {
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
    cause: Option<Error>,
}

impl Response {
    fn new(status: StatusCode) -> Self {
        Response {
            status,
            content_type: ContentType::Text.as_str(),
            body: Bytes::default(),
            cause: None,
        }
    }

    fn finalize(self) -> HttpResponse {
        let body: HyperResponseBody = if self.body.is_empty() {
            Empty::new().map_err(|never| match never {}).boxed_unsync()
        }
        else {
            Full::new(self.body).map_err(|never| match never {}).boxed_unsync()
        };

        let mut response = hyper::Response::new(body);
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            CONTENT_TYPE, HeaderValue::from_static(self.content_type)
        );

        let mut r = HttpResponse::new(response);
        if let Some(cause) = self.cause {
            r.set_cause(cause);
        }
        r
    }
}

//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse {
    response: HyperResponse,
    cause: Option<Error>,
}

impl HttpResponse {
    pub fn new(response: HyperResponse) -> Self {
        HttpResponse { response, cause: None }
    }

    pub fn into_hyper(self) -> HyperResponse {
        self.response
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    /// When logging it can be useful to have the original cause to log rather
    /// than the HTTP response body.
    pub fn set_cause(&mut self, error: Error) {
        self.cause = Some(error);
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    /// Streams a signed file back to the client.
    ///
    /// The scratch pair travels with the body and is dropped, removing the
    /// scratch files, once the last chunk has been read or the client has
    /// gone away.
    pub fn signed_file(
        pair: ScratchPair, file: File, len: u64, file_name: &str,
    ) -> Self {
        let stream = futures_util::stream::unfold(
            Some((file, pair)),
            |state| async move {
                let (mut file, pair) = state?;
                let mut buf = BytesMut::with_capacity(RESPONSE_CHUNK_SIZE);
                match file.read_buf(&mut buf).await {
                    Ok(0) => None,
                    Ok(_) => {
                        Some((Ok(Frame::data(buf.freeze())), Some((file, pair))))
                    }
                    // Ends the stream after reporting the error.
                    Err(err) => Some((Err(err), None)),
                }
            }
        );

        let mut response = hyper::Response::new(
            StreamBody::new(stream).boxed_unsync()
        );
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE, HeaderValue::from_static(ContentType::Binary.as_str())
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        if let Ok(value) = HeaderValue::try_from(
            content_disposition(file_name)
        ) {
            headers.insert(CONTENT_DISPOSITION, value);
        }
        HttpResponse::new(response)
    }

    pub fn response_from_error(error: Error) -> Self {
        let status = error.status();
        let body = error.to_error_response().to_string();
        Response {
            status,
            content_type: ContentType::Json.as_str(),
            body: body.into(),
            cause: Some(error),
        }.finalize()
    }

    pub fn ok() -> Self {
        Response::new(StatusCode::OK).finalize()
    }

    pub fn not_found() -> Self {
        Response::new(StatusCode::NOT_FOUND).finalize()
    }

    pub fn method_not_allowed() -> Self {
        Response::new(StatusCode::METHOD_NOT_ALLOWED).finalize()
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns the Content-Disposition value for an attachment.
///
/// Names that are plain printable ASCII are given as they are. Anything
/// else gets an ASCII fallback plus the RFC 5987 encoded original.
fn content_disposition(file_name: &str) -> String {
    let plain = file_name.chars().all(|ch| {
        ch.is_ascii_graphic() && ch != '"' && ch != '\\' || ch == ' '
    });
    if plain {
        format!("attachment; filename=\"{file_name}\"")
    }
    else {
        let fallback: String = file_name.chars().map(|ch| {
            if ch.is_ascii_graphic() && ch != '"' && ch != '\\' { ch }
            else { '_' }
        }).collect();
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            utf8_percent_encode(file_name, FILENAME_ENCODE_SET)
        )
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;
    use http_body_util::BodyExt;
    use crate::daemon::scratch::ScratchStore;
    use super::*;

    #[test]
    fn plain_file_names_are_quoted() {
        assert_eq!(
            content_disposition("setup 1.2.exe"),
            "attachment; filename=\"setup 1.2.exe\""
        );
    }

    #[test]
    fn other_file_names_are_encoded() {
        assert_eq!(
            content_disposition("über\"app.exe"),
            "attachment; filename=\"_ber_app.exe\"; \
             filename*=UTF-8''%C3%BCber%22app.exe"
        );
    }

    #[test]
    fn error_response_is_json() {
        let res = HttpResponse::response_from_error(Error::PostTooBig);
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(), "application/json"
        );
        assert!(matches!(res.cause(), Some(Error::PostTooBig)));
    }

    #[tokio::test]
    async fn signed_file_streams_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let pair = ScratchStore::new(dir.path().to_path_buf(), ".exe")
            .acquire_input(Bytes::from_static(b"unsigned")).await.unwrap();
        let content = vec![7u8; RESPONSE_CHUNK_SIZE * 2 + 17];
        fs::write(pair.output(), &content).unwrap();
        let file = File::open(pair.output()).await.unwrap();

        let res = HttpResponse::signed_file(
            pair, file, content.len() as u64, "app.exe"
        );
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(CONTENT_LENGTH).unwrap(),
            &content.len().to_string()
        );
        assert_eq!(
            res.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"app.exe\""
        );

        // Still there while the body has not been sent.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);

        let body = res.into_hyper().into_body().collect().await.unwrap();
        assert_eq!(body.to_bytes().as_ref(), content.as_slice());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dropped_body_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let pair = ScratchStore::new(dir.path().to_path_buf(), ".exe")
            .acquire_input(Bytes::from_static(b"unsigned")).await.unwrap();
        fs::write(pair.output(), b"signed").unwrap();
        let file = File::open(pair.output()).await.unwrap();

        let res = HttpResponse::signed_file(pair, file, 6, "app.exe");
        drop(res);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
