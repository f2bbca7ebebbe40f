pub mod builder;
pub mod cli;
pub mod commands;
pub mod config;
pub mod configgen;
pub mod error;
pub mod health;
pub mod infra;
pub mod logs;
pub mod pidfile;
pub mod ports;
pub mod process;
pub mod registry;
pub mod runs;
pub mod shutdown;
pub mod stack;

/// Initialize tracing with a default filter if `RUST_LOG` is unset.
pub fn init_tracing() {
    let default_filter = "devstack=info";
    let filter_layer = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
