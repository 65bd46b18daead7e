use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// Shared client. Callers set a per-request timeout where model calls need
/// longer than the default.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(15))
        .user_agent(concat!("portrait-darkroom/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
