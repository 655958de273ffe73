//! Loopback listener receiving the authorization redirect from the browser

use super::ProviderError;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use url::{Host, Url};

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Canvass</title></head>\
<body><h3>Sign-in complete</h3><p>You can close this window and return to Canvass.</p></body></html>";

/// Whether a redirect URI can be served by a local listener
pub(crate) fn is_loopback(uri: &Url) -> bool {
    uri.scheme() == "http"
        && match uri.host() {
            Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
            Some(Host::Ipv4(ip)) => ip.is_loopback(),
            Some(Host::Ipv6(ip)) => ip.is_loopback(),
            None => false,
        }
}

pub(crate) struct LoopbackListener {
    listener: TcpListener,
    path: String,
}

impl LoopbackListener {
    /// Bind on the redirect URI's port; port `0` picks a free one
    pub async fn bind(redirect_uri: &Url) -> Result<Self, ProviderError> {
        if !is_loopback(redirect_uri) {
            return Err(ProviderError::Configuration(format!(
                "redirect URI {redirect_uri} is not a loopback address"
            )));
        }
        let port = redirect_uri.port_or_known_default().unwrap_or(0);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ProviderError::Configuration(format!("cannot listen on {addr}: {e}"))
        })?;
        debug!(%addr, "Loopback redirect listener bound");
        Ok(Self {
            listener,
            path: redirect_uri.path().to_string(),
        })
    }

    /// Redirect URI with the port actually bound
    pub fn redirect_uri(&self, configured: &Url) -> Url {
        let mut uri = configured.clone();
        if let Ok(addr) = self.listener.local_addr() {
            let _ = uri.set_port(Some(addr.port()));
        }
        uri
    }

    /// Wait for the browser to hit the redirect path and return its query parameters
    pub async fn wait_for_callback(&self) -> Result<HashMap<String, String>, ProviderError> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| ProviderError::Network(format!("loopback accept failed: {e}")))?;

            match self.handle(stream).await {
                Ok(Some(params)) => return Ok(params),
                Ok(None) => debug!(%peer, "Ignoring unrelated loopback request"),
                Err(e) => warn!(%peer, "Loopback request failed: {e}"),
            }
        }
    }

    async fn handle(
        &self,
        stream: TcpStream,
    ) -> std::io::Result<Option<HashMap<String, String>>> {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;

        // Drain the header block
        loop {
            let mut line = String::new();
            let read = reader.read_line(&mut line).await?;
            if read == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        let parsed = Url::parse("http://localhost")
            .and_then(|base| base.join(target))
            .ok()
            .filter(|url| url.path() == self.path);

        let mut stream = reader.into_inner();
        let Some(url) = parsed else {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(None);
        };

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{SUCCESS_PAGE}",
            SUCCESS_PAGE.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;

        Ok(Some(url.query_pairs().into_owned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection() {
        assert!(is_loopback(&Url::parse("http://localhost:53682/cb").unwrap()));
        assert!(is_loopback(&Url::parse("http://127.0.0.1/cb").unwrap()));
        assert!(!is_loopback(&Url::parse("https://localhost/cb").unwrap()));
        assert!(!is_loopback(&Url::parse("http://surveys.example.com/cb").unwrap()));
    }

    #[tokio::test]
    async fn returns_query_of_redirect_path() {
        let configured = Url::parse("http://127.0.0.1:0/auth/callback").unwrap();
        let listener = LoopbackListener::bind(&configured).await.unwrap();
        let redirect = listener.redirect_uri(&configured);
        assert_ne!(redirect.port(), Some(0));

        let base = format!("http://127.0.0.1:{}", redirect.port().unwrap());
        let client = reqwest::Client::new();
        let favicon = client.get(format!("{base}/favicon.ico")).send();
        let callback = client
            .get(format!("{base}/auth/callback?code=abc&state=xyz"))
            .send();

        let (params, favicon, callback) = tokio::join!(
            listener.wait_for_callback(),
            async {
                let response = favicon.await.unwrap();
                response.status()
            },
            async {
                // Let the unrelated request land first
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                callback.await.unwrap().status()
            }
        );

        let params = params.unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("abc"));
        assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
        assert_eq!(favicon, reqwest::StatusCode::NOT_FOUND);
        assert_eq!(callback, reqwest::StatusCode::OK);
    }
}
