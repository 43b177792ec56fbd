//! parley-chat — line-oriented terminal client.
//!
//! Usage: parley-chat [address] [port] [username]
//!
//! Missing arguments come from the config file or are asked for on stdin.
//! Type `exit` to leave.

use std::io::Write;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

use parley_client::{ChatClient, ClientEvent, ConnectOptions, DisconnectReason};
use parley_core::config::{validate_port, ParleyConfig};
use parley_core::wire;

type Input = Lines<BufReader<Stdin>>;

async fn prompt(input: &mut Input, question: &str) -> Result<String> {
    print!("{question}");
    std::io::stdout().flush()?;
    Ok(input.next_line().await?.unwrap_or_default().trim().to_string())
}

/// Positional argument, else config value, else ask.
async fn resolve(
    arg: Option<String>,
    configured: &str,
    input: &mut Input,
    question: &str,
) -> Result<String> {
    if let Some(v) = arg {
        return Ok(v.trim().to_string());
    }
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }
    prompt(input, question).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ParleyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ParleyConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let host = match args.next() {
        Some(host) => host,
        None => {
            let answer = prompt(
                &mut input,
                &format!("Enter server IP address [{}]: ", config.client.server_addr),
            )
            .await?;
            if answer.is_empty() {
                config.client.server_addr.clone()
            } else {
                answer
            }
        }
    };
    let port = match args.next() {
        Some(port) => validate_port(&port),
        None => {
            let answer = prompt(
                &mut input,
                &format!("Enter server port [{}]: ", config.client.port),
            )
            .await?;
            if answer.is_empty() {
                config.client.port
            } else {
                validate_port(&answer)
            }
        }
    };
    let name = resolve(
        args.next(),
        &config.client.display_name,
        &mut input,
        "Enter your username: ",
    )
    .await?;
    if name.is_empty() {
        bail!("username cannot be empty");
    }

    println!("Connecting to server at {host}:{port}...");
    let (events_tx, mut events) = mpsc::unbounded_channel::<ClientEvent>();
    let client = ChatClient::connect(
        &host,
        port,
        &name,
        ConnectOptions::from(&config.client),
        events_tx,
    )
    .await?;

    println!("{}", client.welcome());
    println!("You can start chatting now! Type '{}' to disconnect.", wire::EXIT_KEYWORD);

    loop {
        tokio::select! {
            line = input.next_line() => match line? {
                None => break,
                Some(line) if wire::is_exit(line.trim()) => {
                    let _ = client.send(wire::EXIT_KEYWORD).await;
                    break;
                }
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = client.send(&line).await {
                        eprintln!("{e}");
                    }
                }
            },
            event = events.recv() => match event {
                Some(ClientEvent::Line(line)) => println!("{line}"),
                Some(ClientEvent::Disconnected(DisconnectReason::Local)) | None => break,
                Some(ClientEvent::Disconnected(reason)) => {
                    eprintln!("{reason}. Please restart the client to reconnect.");
                    break;
                }
            },
        }
    }

    client.disconnect().await;
    println!("Disconnected from server.");
    Ok(())
}
