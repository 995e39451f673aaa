use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use matchcall_lib::config::{Args, ClientConfig};
use matchcall_lib::{logger, Client, UiEvent};

#[tokio::main]
async fn main() {
    let config = ClientConfig::from(Args::parse());
    logger::init(&config.log_filter);

    let mut client = match Client::start(&config) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };
    let handle = client.handle();

    if let Some(mut events) = client.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });
    }

    if let Err(e) = handle.find_match() {
        error!("{}", e);
    }
    println!("commands: /next, /find, /quit; anything else is sent as chat");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("stdin: {}", e);
                        break;
                    }
                };
                let result = match line.trim() {
                    "/quit" => break,
                    "/next" => handle.next(),
                    "/find" => handle.find_match(),
                    "" => Ok(()),
                    text => handle.send_chat(text),
                };
                if let Err(e) = result {
                    error!("{}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.shutdown().await;
}

fn print_event(event: &UiEvent) {
    match event {
        UiEvent::StatusChanged { status } => println!("* signaling {}", status),
        UiEvent::Searching => println!("* looking for a partner..."),
        UiEvent::PartnerFound { partner_id } => println!("* matched with {}", partner_id),
        UiEvent::CallConnected { .. } => println!("* call connected"),
        UiEvent::ConnectionProblem { .. } => println!("* connection unstable, waiting..."),
        UiEvent::ConnectionRecovered { .. } => println!("* connection recovered"),
        UiEvent::RemoteStreamAvailable { kind, .. } => println!("* receiving remote {}", kind),
        UiEvent::PartnerLeft { .. } => println!("* partner left"),
        UiEvent::ChatMessage { text, from_self } => {
            let who = if *from_self { "you" } else { "stranger" };
            println!("{}: {}", who, text);
        }
        UiEvent::Failure { kind, message } => {
            println!("! {:?}: {} (type /next to try again)", kind, message)
        }
    }
}
