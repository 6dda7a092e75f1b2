use clap::Parser;
use portal_gate::cli::{Args, build_config, build_upstream, init_logging, load_signing_keys};
use portal_gate::run_server;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(keys) = load_signing_keys(
        args.private_key_file.as_deref(),
        args.public_key_file.as_deref(),
    ) else {
        std::process::exit(1);
    };

    let Some(config) = build_config(&args, &keys) else {
        std::process::exit(1);
    };
    drop(keys);

    let Some(upstream) = build_upstream(&args) else {
        std::process::exit(1);
    };

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    match listener.local_addr() {
        Ok(local_addr) => info!(
            address = %local_addr,
            upstream = %args.upstream,
            locales = ?config.locales.supported(),
            "Listening"
        ),
        Err(e) => error!(error = %e, "Failed to read local address"),
    }

    if let Err(e) = run_server(config, upstream.router(), listener).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
