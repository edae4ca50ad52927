use poly_bands_keeper::app;
use poly_bands_keeper::config::Config;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    // Multiple rustls crypto provider features (webpki-roots WS TLS, CLOB
    // signing) can get linked into the same binary; install one explicitly
    // so the first TLS handshake doesn't panic for lack of a process
    // default, matching teacher `bin/approve.rs`/`redeem.rs`.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Config::from_env();
    app::run(config).await;
}
