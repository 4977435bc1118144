use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use datachannel::{
    Channel, ChannelConfig, ClientConfig, LogCursor, NetworkClient, NetworkServer, POISON_PILL,
};

const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "datachannel-cli", version, about = "Message channel tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server: stdin lines are broadcast, client lines are printed.
    Serve {
        #[arg(long, default_value_t = 9000)]
        port: u16,
    },
    /// Send stdin lines to a server, followed by POISON_PILL.
    Publish {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long)]
        port: u16,
        #[arg(long = "max-retries")]
        max_retries: Option<u32>,
    },
    /// Open a channel from a JSON config and print until POISON_PILL.
    Consume {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the records of a log directory, from the oldest segment unless
    /// a named cursor is given.
    Tail {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(short = 'f', long = "follow")]
        follow: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Commands::Serve { port } => serve(port),
        Commands::Publish {
            host,
            port,
            max_retries,
        } => publish(host, port, max_retries),
        Commands::Consume { config } => consume(config),
        Commands::Tail {
            dir,
            cursor,
            follow,
        } => tail(dir, cursor, follow),
    }
}

fn serve(port: u16) -> Result<()> {
    let server = Arc::new(
        NetworkServer::bind(port).with_context(|| format!("binding server on port {port}"))?,
    );
    info!("serving on {}", server.local_addr());

    let printer = {
        let server = Arc::clone(&server);
        thread::spawn(move || -> Result<()> {
            let mut out = io::stdout().lock();
            loop {
                match server.receive() {
                    Ok(Some(msg)) => {
                        out.write_all(&msg)?;
                        out.write_all(b"\n")?;
                        out.flush()?;
                    }
                    Ok(None) => continue,
                    Err(err) if err.is_closed() => return Ok(()),
                    Err(err) => return Err(err.into()),
                }
            }
        })
    };

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        server.send(line.as_bytes()).context("broadcasting line")?;
    }
    server.close().context("closing server")?;
    match printer.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("printer thread panicked"),
    }
}

fn publish(host: String, port: u16, max_retries: Option<u32>) -> Result<()> {
    let mut config = ClientConfig::new(host, port);
    if let Some(max_retries) = max_retries {
        config.max_retries = max_retries;
    }
    let addr = config.addr();
    let client =
        NetworkClient::connect_with_config(config).with_context(|| format!("connecting to {addr}"))?;

    let mut sent = 0u64;
    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        client.send(line.as_bytes()).context("sending line")?;
        sent += 1;
    }
    client.send(POISON_PILL).context("sending poison pill")?;
    client.close()?;
    info!("published {} messages to {}", sent, addr);
    Ok(())
}

fn consume(config_path: PathBuf) -> Result<()> {
    let config = ChannelConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let channel = config.open().context("opening channel")?;
    let mut out = io::stdout().lock();
    let mut idle = POLL_MIN;
    loop {
        match channel.receive() {
            Ok(Some(msg)) => {
                idle = POLL_MIN;
                if msg == POISON_PILL {
                    break;
                }
                out.write_all(&msg)?;
                out.write_all(b"\n")?;
                out.flush()?;
            }
            Ok(None) => {
                thread::sleep(idle);
                idle = (idle * 2).min(POLL_MAX);
            }
            Err(err) if err.is_closed() => break,
            Err(err) => return Err(err).context("receiving"),
        }
    }
    channel.close()?;
    Ok(())
}

fn tail(dir: PathBuf, cursor: Option<String>, follow: bool) -> Result<()> {
    let mut cursor = match cursor.as_deref() {
        Some(name) => LogCursor::named(&dir, name),
        None => LogCursor::from_start(&dir),
    }
    .with_context(|| format!("opening log {}", dir.display()))?;
    let mut out = io::stdout().lock();
    let mut idle = POLL_MIN;
    loop {
        match cursor.next()? {
            Some(record) => {
                idle = POLL_MIN;
                write!(out, "{} {} ", record.seq, record.timestamp_ns)?;
                out.write_all(&record.payload)?;
                out.write_all(b"\n")?;
            }
            None if follow => {
                out.flush()?;
                thread::sleep(idle);
                idle = (idle * 2).min(POLL_MAX);
            }
            None => break,
        }
    }
    out.flush()?;
    Ok(())
}
