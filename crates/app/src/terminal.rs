//! Line-based chat session on stdin/stdout

use std::sync::Arc;

use duet_core::PeerId;
use duet_net::ChatClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::controller::{ControllerError, ConversationSyncController, SyncOptions};
use crate::error::Result;
use crate::viewmodel::render_lines;

/// One line typed by the user
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Quit,
    Refresh,
    Retry(&'a str),
    Send(&'a str),
    Empty,
}

pub fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line.split_once(char::is_whitespace) {
        Some(("/retry", prefix)) => Input::Retry(prefix.trim()),
        None if line == "/quit" || line == "/q" => Input::Quit,
        None if line == "/refresh" => Input::Refresh,
        None if line == "/retry" => Input::Retry(""),
        _ => Input::Send(line),
    }
}

fn print_view(lines: &[String]) {
    println!();
    for line in lines {
        println!("{}", line);
    }
}

/// Run an interactive conversation until `/quit` or end of input
pub async fn run_chat(client: Arc<ChatClient>, peer: PeerId, options: SyncOptions) -> Result<()> {
    let controller = ConversationSyncController::spawn(client.clone(), client, options);
    let mut view_rx = controller.watch();

    let render = tokio::spawn(async move {
        while view_rx.changed().await.is_ok() {
            let lines = render_lines(&view_rx.borrow_and_update());
            print_view(&lines);
        }
    });

    controller.initialize(peer).await?;
    println!("Type a message and press enter. /refresh, /retry <id>, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse_input(&line) {
            Input::Empty => Ok(()),
            Input::Quit => break,
            Input::Refresh => controller.on_external_signal().await,
            Input::Retry(prefix) => match controller.view().find_failed(prefix) {
                Some(id) => controller.retry(&id).await,
                None => {
                    println!("No single failed message starts with '{}'", prefix);
                    Ok(())
                }
            },
            Input::Send(text) => controller.send_message(text).await.map(|id| {
                debug!(local_id = %id, "Queued message");
            }),
        };

        match result {
            Ok(()) => {}
            Err(ControllerError::Closed) => return Err(ControllerError::Closed.into()),
            Err(e) => println!("{}", e),
        }
    }

    controller.shutdown().await;
    if let Err(e) = render.await {
        warn!(error = %e, "Render task failed");
    }
    Ok(())
}
