use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::ArgAction;
use rdev_transport::TransportRegistry;
use rdevd::{Config, Registry};

fn args() -> clap::Command {
    clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(PathBuf))
                .required(true)
                .help("Device configuration file"),
        )
        .arg(
            clap::Arg::new("listen")
                .short('l')
                .long("listen")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(SocketAddr))
                .help("Address to listen on, overrides the configuration"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let matches = args().get_matches();

    let path = matches
        .get_one::<PathBuf>("config")
        .context("no configuration given")?;
    let config = Config::load(path)?;

    let transports = TransportRegistry::default();
    config.validate(&transports)?;

    let listen = matches
        .get_one::<SocketAddr>("listen")
        .copied()
        .unwrap_or(config.listen);
    log::info!("Exporting {} devices", config.devices.len());

    let registry = Arc::new(Registry::new(config.devices, transports));
    rdevd::listen(listen, registry).await
}
