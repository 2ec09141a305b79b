//! Entry point for the mitm-proxy binary: `server` runs the proxy,
//! `cert` manages a standalone CA.

use clap::{Parser, Subcommand};
use mitm_proxy_core::cli::{CertCommand, ServerArgs};
use mitm_proxy_core::logging;

#[derive(Debug, Parser)]
#[command(name = "mitm-proxy", about = "Intercepting HTTP/HTTPS proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy server.
    Server(ServerArgs),
    /// Manage a standalone root CA.
    Cert {
        #[command(subcommand)]
        command: CertCommand,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server(args) => {
            logging::init(&args.log_level, args.log_dir.as_deref());
            let config = args.to_config()?;
            let runtime_config = config.runtime.clone();
            mitm_proxy_core::runtime::run_with_runtime(&runtime_config, async {
                mitm_proxy_core::ProxyServer::new(config)?.run().await?;
                Ok(())
            })
        }
        Command::Cert { command } => {
            logging::init("info", None);
            command.execute()
        }
    }
}
