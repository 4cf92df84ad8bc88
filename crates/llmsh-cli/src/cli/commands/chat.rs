//! Interactive chat loop.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use llmsh_core::config::{self, Config};
use llmsh_core::core::interrupt;
use llmsh_core::core::{InferenceService, SendError};

const HISTORY_PREVIEW_CHARS: usize = 80;

const HELP: &str = "\
Commands:
  !help            show this help
  !history         list the conversation so far
  !save [path]     save the conversation (default: history file)
  !load [path]     replace the conversation with a saved one
  !clear           forget the conversation
  !start           start the server again after it stopped
  !quit, !exit     save the conversation and leave
Anything else is sent to the model.";

/// One line of user input, classified.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Help,
    History,
    Save(Option<&'a str>),
    Load(Option<&'a str>),
    Clear,
    Start,
    Message(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (line, None),
    };
    match command.to_lowercase().as_str() {
        "!quit" | "!exit" | "quit" | "exit" if arg.is_none() => Input::Quit,
        "!help" => Input::Help,
        "!history" => Input::History,
        "!save" => Input::Save(arg),
        "!load" => Input::Load(arg),
        "!clear" => Input::Clear,
        "!start" => Input::Start,
        _ => Input::Message(line),
    }
}

/// `content` cut to `max` characters, with an ellipsis when shortened.
fn preview(content: &str, max: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let cut: String = single_line.chars().take(max).collect();
    format!("{cut}...")
}

pub async fn run(config: &Config) -> Result<()> {
    let mut service = InferenceService::new(config)?;
    let history_path = config::paths::history_path();

    println!("Starting LLM server at {} ...", service.base_url());
    let started = tokio::select! {
        result = service.start() => Some(result),
        () = interrupt::wait_for_interrupt() => None,
    };
    match started {
        Some(result) => result.context("start LLM server")?,
        None => anyhow::bail!("Interrupted while starting the LLM server"),
    }
    println!("LLM server ready. Type !help for commands.");

    if history_path.exists() {
        match service.session_mut().load_from(&history_path) {
            Ok(loaded) => println!(
                "Loaded {} messages (saved at {}).",
                loaded.count, loaded.saved_at
            ),
            Err(e) => tracing::warn!("{e:#}"),
        }
    }

    let result = chat_loop(&mut service, config.request.stream, &history_path).await;
    service.close().await;
    result
}

async fn chat_loop(
    service: &mut InferenceService,
    stream: bool,
    history_path: &Path,
) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().context("flush stdout")?;

        interrupt::reset();
        let line = tokio::select! {
            line = lines.next_line() => line.context("read input")?,
            () = interrupt::wait_for_interrupt() => {
                println!();
                println!("(Interrupted. Type !quit to exit.)");
                continue;
            }
        };
        // EOF
        let Some(line) = line else {
            println!();
            save_history(service, history_path);
            return Ok(());
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => {
                save_history(service, history_path);
                println!("Goodbye.");
                return Ok(());
            }
            Input::Help => println!("{HELP}"),
            Input::History => print_history(service),
            Input::Save(path) => {
                let path = path.map_or_else(|| history_path.to_path_buf(), PathBuf::from);
                match service.session().save_to(&path) {
                    Ok(()) => println!(
                        "Saved {} messages to {}.",
                        service.session().len(),
                        path.display()
                    ),
                    Err(e) => eprintln!("Error: {e:#}"),
                }
            }
            Input::Load(path) => {
                let path = path.map_or_else(|| history_path.to_path_buf(), PathBuf::from);
                match service.session_mut().load_from(&path) {
                    Ok(loaded) => println!(
                        "Loaded {} messages (saved at {}).",
                        loaded.count, loaded.saved_at
                    ),
                    Err(e) => eprintln!("Error: {e:#}"),
                }
            }
            Input::Clear => {
                service.session_mut().clear();
                println!("Conversation cleared.");
            }
            Input::Start => {
                if service.is_ready() {
                    println!("LLM server already running.");
                } else {
                    restart_server(service).await;
                }
            }
            Input::Message(text) => send_message(service, text, stream).await,
        }
    }
}

async fn restart_server(service: &mut InferenceService) {
    let started = tokio::select! {
        result = service.start() => Some(result),
        () = interrupt::wait_for_interrupt() => None,
    };
    match started {
        Some(Ok(())) => println!("LLM server ready."),
        Some(Err(e)) => eprintln!("Error: {e}"),
        None => {
            println!();
            println!("(Start abandoned; server stopped.)");
        }
    }
}

async fn send_message(service: &mut InferenceService, text: &str, stream: bool) {
    let outcome = tokio::select! {
        result = service.send(text, |delta| {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }) => Some(result),
        () = interrupt::wait_for_interrupt() => None,
    };

    match outcome {
        Some(Ok(reply)) => {
            if stream {
                println!();
            } else {
                println!("{reply}");
            }
        }
        Some(Err(e)) => {
            if stream {
                println!();
            }
            eprintln!("Error: {e}");
            if matches!(e, SendError::Client(_)) && e.stopped_service() {
                eprintln!("Type !start to restart the server.");
            }
        }
        None => {
            println!();
            println!("(Reply abandoned.)");
        }
    }
}

fn print_history(service: &InferenceService) {
    let session = service.session();
    if session.is_empty() {
        println!("No messages yet.");
        return;
    }
    for (i, turn) in session.turns().iter().enumerate() {
        println!(
            "{:>3}. {}: {}",
            i + 1,
            turn.role,
            preview(&turn.content, HISTORY_PREVIEW_CHARS)
        );
    }
}

fn save_history(service: &InferenceService, path: &Path) {
    if let Err(e) = service.session().save_to(path) {
        eprintln!("Error: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input("!quit"), Input::Quit);
        assert_eq!(parse_input(" exit "), Input::Quit);
        assert_eq!(parse_input("!help"), Input::Help);
        assert_eq!(parse_input("!history"), Input::History);
        assert_eq!(parse_input("!save"), Input::Save(None));
        assert_eq!(parse_input("!save  /tmp/h.json "), Input::Save(Some("/tmp/h.json")));
        assert_eq!(parse_input("!load a.json"), Input::Load(Some("a.json")));
        assert_eq!(parse_input("!clear"), Input::Clear);
        assert_eq!(parse_input("!start"), Input::Start);
    }

    #[test]
    fn test_commands_ignore_case() {
        assert_eq!(parse_input("!QUIT"), Input::Quit);
        assert_eq!(parse_input("Exit"), Input::Quit);
        assert_eq!(parse_input("!History"), Input::History);
        assert_eq!(parse_input("!SAVE Notes.json"), Input::Save(Some("Notes.json")));
        assert_eq!(parse_input("!Start"), Input::Start);
    }

    #[test]
    fn test_everything_else_is_a_message() {
        assert_eq!(parse_input("  what is ls? "), Input::Message("what is ls?"));
        assert_eq!(parse_input("exit code 137?"), Input::Message("exit code 137?"));
        assert_eq!(parse_input("!ps aux"), Input::Message("!ps aux"));
    }

    #[test]
    fn test_preview_truncates_by_chars() {
        assert_eq!(preview("short", 80), "short");
        assert_eq!(preview("two\nlines", 80), "two lines");

        let long = "é".repeat(100);
        let shown = preview(&long, 80);
        assert_eq!(shown.chars().count(), 83);
        assert!(shown.ends_with("..."));
    }
}
