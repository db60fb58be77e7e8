//! Dispatching of HTTP requests.

use crate::commons::error::Error;
use super::request::{PathIter, Request};
use super::response::HttpResponse;


//------------ DispatchError -------------------------------------------------

/// An error occured during dispatch.
///
/// This error type exists so you can use the question mark operator for all
/// sorts of things during dispatch to minimize clutter. Both ready made
/// responses and errors are turned into the response sent to the client.
#[derive(Debug)]
pub enum DispatchError {
    Response(HttpResponse),
}

impl DispatchError {
    pub fn into_response(self) -> HttpResponse {
        match self {
            DispatchError::Response(response) => response,
        }
    }
}

impl From<HttpResponse> for DispatchError {
    fn from(src: HttpResponse) -> Self {
        Self::Response(src)
    }
}

impl From<Error> for DispatchError {
    fn from(src: Error) -> Self {
        Self::Response(HttpResponse::response_from_error(src))
    }
}


//------------ / -------------------------------------------------------------

pub async fn dispatch_request(
    request: Request<'_>,
    mut path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    match path.next() {
        Some("health") => health(request, path),
        Some("sign") => sign(request, path).await,
        _ => Ok(HttpResponse::not_found())
    }
}


//------------ /health -------------------------------------------------------

fn health(
    request: Request<'_>, path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    path.check_exhausted()?;
    request.check_get()?;
    Ok(HttpResponse::ok())
}


//------------ /sign ---------------------------------------------------------

async fn sign(
    request: Request<'_>, path: PathIter<'_>,
) -> Result<HttpResponse, DispatchError> {
    path.check_exhausted()?;
    request.check_post()?;
    let (server, form) = request.read_sign_form().await?;
    Ok(server.sign(form).await?)
}
