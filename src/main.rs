use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fanhub::config::{
    ClientConfig, Config, DEFAULT_BROADCAST_BUFFER, DEFAULT_MAILBOX_CAPACITY,
    DEFAULT_MAX_MESSAGE_SIZE, HubConfig,
};
use fanhub::realtime::Hub;
use fanhub::server::{AppState, Server, load_home_page};

#[derive(Debug, Parser)]
#[command(name = "fanhub", version)]
#[command(about = "Broadcast every WebSocket message to every connected client")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:5000")]
    address: String,

    /// HTML file served at `/` instead of the built-in chat page.
    #[arg(long)]
    home: Option<PathBuf>,

    /// Outbound messages buffered per client before it is dropped as too slow.
    #[arg(long, default_value_t = DEFAULT_MAILBOX_CAPACITY)]
    mailbox_capacity: usize,

    /// Largest inbound message accepted, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Seconds without a pong before a client is considered dead.
    #[arg(long, default_value_t = 60)]
    pong_wait_secs: u64,

    /// Seconds between pings. Must be below --pong-wait-secs.
    #[arg(long, default_value_t = 50)]
    ping_period_secs: u64,

    /// Seconds allowed for a single write.
    #[arg(long, default_value_t = 10)]
    write_wait_secs: u64,

    /// Broadcasts queued at the hub before senders wait.
    #[arg(long, default_value_t = DEFAULT_BROADCAST_BUFFER)]
    broadcast_buffer: usize,

    /// Do not send a client's own messages back to it.
    #[arg(long)]
    no_echo: bool,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            hub: HubConfig {
                broadcast_buffer: self.broadcast_buffer,
                echo_to_sender: !self.no_echo,
            },
            client: ClientConfig {
                mailbox_capacity: self.mailbox_capacity,
                max_message_size: self.max_message_size,
                pong_wait: Duration::from_secs(self.pong_wait_secs),
                ping_period: Duration::from_secs(self.ping_period_secs),
                write_wait: Duration::from_secs(self.write_wait_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let home_page = match load_home_page(cli.home.as_deref()).await {
        Ok(page) => page,
        Err(e) => {
            error!(error = %e, "cannot load home page");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(&cli.address).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "cannot start server");
            return ExitCode::FAILURE;
        }
    };

    let hub = Hub::spawn(&config.hub);
    info!(
        mailbox_capacity = config.client.mailbox_capacity,
        max_message_size = config.client.max_message_size,
        ping_period = ?config.client.ping_period,
        pong_wait = ?config.client.pong_wait,
        "hub ready"
    );
    server.run(AppState::new(hub, config.client, home_page)).await;
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_library_defaults() {
        let cli = Cli::parse_from(["fanhub"]);
        assert_eq!(cli.config(), Config::default());
        assert_eq!(cli.address, "0.0.0.0:5000");
    }

    #[test]
    fn no_echo_flag_disables_echo() {
        let cli = Cli::parse_from(["fanhub", "--no-echo", "--ping-period-secs", "5"]);
        let config = cli.config();
        assert!(!config.hub.echo_to_sender);
        assert_eq!(config.client.ping_period, Duration::from_secs(5));
    }
}
