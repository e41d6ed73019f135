use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use decent_client::{
    ClientDriver, Command, DriverConfig, RelayConnection, SessionConfig, UiEvent, WebRtcConnector,
};
use tokio::sync::mpsc;

const USAGE: &str = "commands: /call <id>, /accept, /hangup, /quit; anything else is sent as chat";

#[derive(Parser, Debug)]
#[command(name = "decent-client", about = "Peer-to-peer chat over a Decent relay")]
struct Args {
    /// WebSocket url of the relay.
    #[arg(long, env = "DECENT_RELAY_URL", default_value = "ws://127.0.0.1:5000/ws")]
    relay: String,

    /// STUN/TURN server url, may be repeated.
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Send ICE candidates as they are found instead of one complete description.
    #[arg(long)]
    trickle: bool,

    /// Abandon a call that has not connected after this many seconds.
    #[arg(long)]
    negotiation_timeout_secs: Option<u64>,

    /// Call this session id right after connecting.
    #[arg(long)]
    call: Option<String>,

    /// Answer incoming calls immediately.
    #[arg(long)]
    auto_accept: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    decent_common::init_tracing_with_default("decent_client=info");

    let relay = RelayConnection::connect(&args.relay)
        .await
        .with_context(|| format!("failed to connect to relay at {}", args.relay))?;

    let config = DriverConfig {
        session: SessionConfig {
            trickle: args.trickle,
            ice_servers: args.ice_servers,
            negotiation_timeout: args.negotiation_timeout_secs.map(Duration::from_secs),
        },
        auto_accept: args.auto_accept,
    };

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::channel(16);

    let driver = ClientDriver::new(relay, Arc::new(WebRtcConnector::new()), config, ui_tx);
    let driver = tokio::spawn(driver.run(cmd_rx));
    let printer = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            print_event(&event);
        }
    });

    if let Some(target) = args.call {
        let _ = cmd_tx.send(Command::Call(target.into())).await;
    }

    let stdin_tx = cmd_tx.clone();
    std::thread::spawn(move || read_commands(stdin_tx));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cmd_tx.send(Command::Quit).await;
        }
    });

    driver.await.context("client task failed")?;
    let _ = printer.await;
    Ok(())
}

fn read_commands(tx: mpsc::Sender<Command>) {
    println!("{}", USAGE);
    for line in std::io::stdin().lines() {
        let Ok(line) = line else {
            break;
        };
        match parse_command_line(&line) {
            Ok(Some(command)) => {
                let quit = command == Command::Quit;
                if tx.blocking_send(command).is_err() || quit {
                    return;
                }
            }
            Ok(None) => {}
            Err(usage) => eprintln!("{}", usage),
        }
    }
    let _ = tx.blocking_send(Command::Quit);
}

fn parse_command_line(line: &str) -> std::result::Result<Option<Command>, &'static str> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Send(line.to_string())));
    }

    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("/call"), Some(target), None) => Ok(Some(Command::Call(target.into()))),
        (Some("/accept"), None, _) => Ok(Some(Command::Accept)),
        (Some("/hangup"), None, _) => Ok(Some(Command::HangUp)),
        (Some("/quit"), None, _) => Ok(Some(Command::Quit)),
        _ => Err(USAGE),
    }
}

fn print_event(event: &UiEvent) {
    match event {
        UiEvent::Assigned(id) => println!("your id is {}", id),
        UiEvent::State(state) => println!("* {}", state),
        UiEvent::IncomingCall(caller) => println!("* {} is calling, /accept to answer", caller),
        UiEvent::Chat(entry) => println!("[{}] {}", entry.sender, entry.text),
        UiEvent::CallEnded => println!("* a client left the relay"),
        UiEvent::Error(err) => println!("! {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse_command_line("hello there\n"),
            Ok(Some(Command::Send("hello there".into())))
        );
        assert_eq!(parse_command_line("   "), Ok(None));
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(
            parse_command_line("/call xyz789"),
            Ok(Some(Command::Call("xyz789".into())))
        );
        assert_eq!(parse_command_line("/accept"), Ok(Some(Command::Accept)));
        assert_eq!(parse_command_line("/hangup"), Ok(Some(Command::HangUp)));
        assert_eq!(parse_command_line("/quit\r\n"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn test_bad_commands_show_usage() {
        assert_eq!(parse_command_line("/call"), Err(USAGE));
        assert_eq!(parse_command_line("/call a b"), Err(USAGE));
        assert_eq!(parse_command_line("/dance"), Err(USAGE));
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["decent-client"]);
        assert_eq!(args.relay, "ws://127.0.0.1:5000/ws");
        assert!(args.ice_servers.is_empty());
        assert!(!args.trickle);

        let args = Args::parse_from([
            "decent-client",
            "--ice-server",
            "stun:stun.l.google.com:19302",
            "--ice-server",
            "stun:stun1.l.google.com:19302",
            "--call",
            "abc123",
        ]);
        assert_eq!(args.ice_servers.len(), 2);
        assert_eq!(args.call.as_deref(), Some("abc123"));
    }
}
