extern crate tokensign;

use std::sync::Arc;
use tokensign::config::{Config, Options};
use tokensign::constants::TOKENSIGN_SERVER_APP;
use tokensign::daemon::start::start_daemon;

#[tokio::main]
async fn main() {
    let options = Options::from_args();
    match Config::create(&options) {
        Ok(config) => {
            if let Err(e) = start_daemon(Arc::new(config), None).await {
                eprintln!("{TOKENSIGN_SERVER_APP} failed to start: {e}");
                ::std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{e}");
            ::std::process::exit(1);
        }
    }
}
