//! The HTTP server side of the signing service.

use std::convert::Infallible;
use std::sync::Arc;
use hyper::Method;
use log::{debug, error, info, warn};
use tokio::fs::File;
use crate::commons::error::{Error, IoError};
use crate::config::Config;
use crate::daemon::scratch::ScratchStore;
use crate::daemon::signer::{CodeSigner, KeyId};
use super::dispatch::dispatch_request;
use super::request::{HyperRequest, Request, SignForm};
use super::response::{HttpResponse, HyperResponse};


//------------ HttpServer ----------------------------------------------------

/// Everything needed to answer requests.
pub struct HttpServer {
    config: Arc<Config>,
    scratch: ScratchStore,
    signer: CodeSigner,
}

impl HttpServer {
    pub fn new(config: Arc<Config>) -> Self {
        HttpServer {
            scratch: ScratchStore::from_config(&config),
            signer: CodeSigner::new(config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Processes a single request.
    pub async fn process_request(
        &self, request: HyperRequest
    ) -> Result<HyperResponse, Infallible> {
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();

        let request = Request::new(request, self);
        let response = match request.path() {
            Ok(path) => {
                match dispatch_request(request, path.iter()).await {
                    Ok(response) => response,
                    Err(err) => err.into_response(),
                }
            }
            Err(_) => HttpResponse::not_found(),
        };

        log_response(&method, &uri_path, &response);
        Ok(response.into_hyper())
    }

    /// Signs and verifies the binary of a form.
    ///
    /// On success, the response streams back the signed binary. The scratch
    /// files are removed when this function fails or, on success, after the
    /// response has been sent.
    pub async fn sign(&self, form: SignForm) -> Result<HttpResponse, Error> {
        let SignForm { file_name, content, pin } = form;
        let key_id = KeyId::from_config(&self.config)?;

        let download_name = file_name.unwrap_or_else(|| {
            format!("signed{}", self.config.scratch_suffix)
        });
        debug!("Received {} ({} bytes)", download_name, content.len());

        let pair = self.scratch.acquire_input(content).await?;
        self.signer.sign(&pair, &key_id, &pin).await?;
        self.signer.verify(&pair).await?;

        let file = File::open(pair.output()).await.map_err(|err| {
            IoError::new("Cannot open signed file", err)
        })?;
        let len = file.metadata().await.map_err(|err| {
            IoError::new("Cannot read signed file size", err)
        })?.len();

        info!("Signed {} ({} bytes)", download_name, len);
        Ok(HttpResponse::signed_file(pair, file, len, &download_name))
    }
}


//------------ Helpers -------------------------------------------------------

fn log_response(method: &Method, path: &str, response: &HttpResponse) {
    let status = response.status();
    match response.cause() {
        Some(cause) if status.is_server_error() => {
            error!("{} {} {}: {}", method, path, status.as_u16(), cause)
        }
        Some(cause) => {
            warn!("{} {} {}: {}", method, path, status.as_u16(), cause)
        }
        None => {
            debug!("{} {} {}", method, path, status.as_u16())
        }
    }
}
