use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Quadlink netplay relay server.
#[derive(Parser, Debug)]
#[command(name = "quadlink-netd")]
#[command(about = "Netplay input relay server", long_about = None)]
struct Args {
    /// TCP port to listen on (0 picks a free port)
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (port, server) = quadlink_netd::spawn_server(args.port).await?;
    println!("Listening on port {port}...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        result = server => result?,
    }
}
