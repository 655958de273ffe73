//! Terminal implementations of the session host hooks

use canvass_http::routes::Navigator;
use canvass_session::{DeviceCodePrompt, Interaction};
use tracing::info;
use url::Url;

/// Prints sign-in instructions to stderr
#[derive(Debug, Default)]
pub struct ConsoleInteraction;

impl Interaction for ConsoleInteraction {
    fn open_authorization_url(&self, url: &Url) {
        eprintln!("Open this address in your browser to sign in:\n\n    {url}\n");
    }

    fn show_device_code(&self, prompt: &DeviceCodePrompt) {
        eprintln!("{}", prompt.message);
        eprintln!(
            "(code {} expires in {} minutes)",
            prompt.user_code,
            prompt.expires_in.as_secs() / 60
        );
    }

    fn open_logout_url(&self, url: &Url) {
        eprintln!("To sign out of Microsoft as well, visit:\n\n    {url}\n");
    }
}

/// The terminal has a single authenticated "page"
#[derive(Debug, Default)]
pub struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn current_path(&self) -> String {
        "/notifications".to_string()
    }

    fn navigate(&self, target: &str) {
        info!(redirect = target, "Session lost");
        eprintln!("Your session has expired. Run `canvass login` to sign in again.");
    }
}
