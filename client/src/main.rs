use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use spatial_overlay::overlay::types::Address;
use spatial_overlay::protocol::answer::{merge_nearest, receive_answers, Answer};
use spatial_overlay::protocol::connection::Connection;
use spatial_overlay::protocol::message::{Request, END_MARKER};
use spatial_overlay::storage::types::Key;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "overlay-client", version, about = "Send commands to an overlay node")]
struct Cli {
    /// Host of the node to contact
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port of the node to contact
    #[arg(short = 'p', long)]
    port: u16,

    /// Host the node should push answers to
    #[arg(long, default_value = "127.0.0.1")]
    reply_host: String,

    /// Port to receive answers on, 0 picks a free one
    #[arg(long, default_value_t = 0)]
    reply_port: u16,

    /// How long to keep listening after the last answer, in milliseconds
    #[arg(long, default_value_t = 1000)]
    wait_ms: u64,

    /// Print answers as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value, replacing any existing one
    Insert { key: Key, value: String },
    /// Append to the value stored under a key
    Append { key: Key, value: String },
    /// Fetch the value stored under a key
    Lookup { key: Key },
    /// Fetch every entry inside the closed box [lo, hi]
    Range { lo: Key, hi: Key },
    /// Fetch the k entries closest to a point
    Nearest {
        center: Key,
        k: usize,
        /// Search radius, negative for unbounded
        #[arg(long, default_value_t = -1.0, allow_negative_numbers = true)]
        radius: f64,
    },
    /// Show the node's region and split history
    Whois,
    /// Show the node's region with its entries
    Dump,
    /// Ask the node to leave the overlay
    Depart,
    /// Send a raw request line
    Raw {
        line: String,
        /// Collect answers pushed to the reply port
        #[arg(long)]
        collect: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let node = Address::new(cli.host.clone(), cli.port);
    let timeout = Duration::from_secs(5);

    let listener = TcpListener::bind(Address::new(cli.reply_host.clone(), cli.reply_port).socket_string())
        .await
        .context("binding the reply port")?;
    let reply = Address::new(cli.reply_host.clone(), listener.local_addr()?.port());

    let (line, collect, nearest_k) = match &cli.command {
        Command::Insert { key, value } => (
            Request::Insert {
                key: key.clone(),
                value: value.clone().into_bytes(),
            }
            .to_string(),
            false,
            None,
        ),
        Command::Append { key, value } => (
            Request::Append {
                key: key.clone(),
                value: value.clone().into_bytes(),
            }
            .to_string(),
            false,
            None,
        ),
        Command::Lookup { key } => (
            Request::Lookup {
                key: key.clone(),
                reply: reply.clone(),
                hops: 0,
            }
            .to_string(),
            true,
            None,
        ),
        Command::Range { lo, hi } => {
            if lo.dims() != hi.dims() {
                bail!("range corners ({}) and ({}) differ in dimensionality", lo, hi);
            }
            (
                Request::Range {
                    lo: lo.clone(),
                    hi: hi.clone(),
                    reply: reply.clone(),
                    hops: 0,
                }
                .to_string(),
                true,
                None,
            )
        }
        Command::Nearest { center, k, radius } => (
            Request::Nearest {
                center: center.clone(),
                k: *k,
                radius: *radius,
                reply: reply.clone(),
                hops: 0,
                depth: 0,
            }
            .to_string(),
            true,
            Some(*k),
        ),
        Command::Whois => (Request::Whois.to_string(), false, None),
        Command::Dump => (Request::Dump.to_string(), false, None),
        Command::Depart => (Request::Depart.to_string(), false, None),
        Command::Raw { line, collect } => (format!("{}\n", line.trim_end()), *collect, None),
    };

    let mut conn = Connection::open(&node, timeout)
        .await
        .with_context(|| format!("connecting to {}", node))?;
    let first = conn
        .request(&line)
        .await
        .with_context(|| format!("waiting for {} to reply", node))?;
    if first.starts_with('#') && first.trim() != END_MARKER {
        let rest = conn.recv_block().await?;
        print!("{}\n{}", first, rest);
    } else {
        println!("{}", first);
    }
    conn.close().await;

    if !collect {
        return Ok(());
    }

    let answers = receive_answers(&listener, Duration::from_millis(cli.wait_ms), timeout).await;
    tracing::info!("Received {} answers", answers.len());
    match nearest_k {
        Some(k) => print_nearest(&answers, k, cli.json)?,
        None => print_answers(&answers, cli.json)?,
    }
    Ok(())
}

fn print_answers(answers: &[Answer], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(answers)?);
    } else {
        for answer in answers {
            print!("{}", answer);
        }
    }
    Ok(())
}

fn print_nearest(answers: &[Answer], k: usize, json: bool) -> anyhow::Result<()> {
    let merged = merge_nearest(answers, k);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "answers": answers,
                "nearest": merged,
            }))?
        );
    } else {
        print_answers(answers, false)?;
        println!("# {} nearest:", merged.len());
        for item in merged {
            print!("{}", item);
        }
    }
    Ok(())
}
