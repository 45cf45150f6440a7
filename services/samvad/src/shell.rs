//! Line-oriented terminal front end.
//!
//! Reads commands from stdin and forwards them to the session manager, and
//! prints a status line whenever the published snapshot changes.

use crate::manager::{ManagerHandle, UiCommand};
use anyhow::{Context, Result};
use samvad_core::content::ContentProvider;
use samvad_core::session::UnknownVoiceProfile;
use samvad_core::{SessionSnapshot, SessionStatus, VoiceProfile};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Commands:
  open <figure>        start a conversation with a figure
  close                end the conversation
  mute                 toggle the microphone
  voice <male|female>  switch voice (reconnects an open conversation)
  retry                reconnect after an error
  status               print the current session state as JSON
  figures              list available figures
  help                 show this help
  quit                 close and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Session(UiCommand),
    Status,
    Figures,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShellError {
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Voice(#[from] UnknownVoiceProfile),
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>, ShellError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    let command = match (verb.to_ascii_lowercase().as_str(), argument) {
        ("open", Some(figure_id)) => ShellCommand::Session(UiCommand::Open {
            figure_id: figure_id.to_string(),
        }),
        ("open", None) => return Err(ShellError::Usage("open <figure>")),
        ("close", _) => ShellCommand::Session(UiCommand::Close),
        ("mute", _) => ShellCommand::Session(UiCommand::ToggleMute),
        ("voice", Some(voice)) => {
            ShellCommand::Session(UiCommand::SetVoice(voice.parse::<VoiceProfile>()?))
        }
        ("voice", None) => return Err(ShellError::Usage("voice <male|female>")),
        ("retry", _) => ShellCommand::Session(UiCommand::Retry),
        ("status", _) => ShellCommand::Status,
        ("figures", _) => ShellCommand::Figures,
        ("help", _) => ShellCommand::Help,
        ("quit" | "exit", _) => ShellCommand::Quit,
        (other, _) => return Err(ShellError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// One-line summary of a snapshot for the terminal.
pub fn describe(snapshot: &SessionSnapshot) -> String {
    let figure = snapshot.figure_id.as_deref().unwrap_or("-");
    let state = match snapshot.status {
        SessionStatus::Disconnected => "disconnected".to_string(),
        SessionStatus::Connecting => format!("connecting to {figure}"),
        SessionStatus::Connected if snapshot.speaking => format!("{figure} is speaking"),
        SessionStatus::Connected => format!("connected to {figure}, listening"),
        SessionStatus::Error => format!(
            "error: {} (type 'retry')",
            snapshot.error_message.as_deref().unwrap_or("unknown")
        ),
    };
    let mute = if snapshot.muted { ", muted" } else { "" };
    format!(
        "[#{}] {state} (voice: {}{mute})",
        snapshot.connection_id, snapshot.voice
    )
}

fn list_figures(content: &dyn ContentProvider) {
    let mut ids = content.figure_ids();
    ids.sort();
    for id in ids {
        if let Some(profile) = content.figure(&id) {
            let reign = profile.summary.reign.as_deref().unwrap_or("unknown reign");
            println!("  {id:<16} {} ({reign})", profile.display_name());
        }
    }
}

/// Runs until `quit` or end of input, then shuts the manager down.
pub async fn run(handle: ManagerHandle, content: Arc<dyn ContentProvider>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = handle.snapshots();
    println!("{HELP}");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ShellCommand::Quit)) => break,
                    Ok(Some(ShellCommand::Session(command))) => handle.send(command)?,
                    Ok(Some(ShellCommand::Status)) => {
                        println!("{}", serde_json::to_string_pretty(&handle.snapshot())?)
                    }
                    Ok(Some(ShellCommand::Figures)) => list_figures(content.as_ref()),
                    Ok(Some(ShellCommand::Help)) => println!("{HELP}"),
                    Err(e) => eprintln!("{e}"),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", describe(&snapshot));
            }
        }
    }
    handle.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use samvad_core::ConnectionId;

    #[test]
    fn test_parse_session_commands() {
        assert_eq!(
            parse_command("open ashoka").unwrap(),
            Some(ShellCommand::Session(UiCommand::Open {
                figure_id: "ashoka".to_string()
            }))
        );
        assert_eq!(
            parse_command("  VOICE Female ").unwrap(),
            Some(ShellCommand::Session(UiCommand::SetVoice(VoiceProfile::Female)))
        );
        assert_eq!(
            parse_command("mute").unwrap(),
            Some(ShellCommand::Session(UiCommand::ToggleMute))
        );
        assert_eq!(parse_command("exit").unwrap(), Some(ShellCommand::Quit));
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_command("open"),
            Err(ShellError::Usage("open <figure>"))
        );
        assert!(matches!(
            parse_command("voice robot"),
            Err(ShellError::Voice(_))
        ));
        assert_eq!(
            parse_command("dance").unwrap_err().to_string(),
            "unknown command 'dance', type 'help' for a list"
        );
    }

    #[test]
    fn test_describe() {
        let mut snapshot = SessionSnapshot {
            connection_id: ConnectionId(3),
            status: SessionStatus::Connected,
            error_message: None,
            speaking: false,
            muted: true,
            voice: VoiceProfile::Male,
            figure_id: Some("ashoka".to_string()),
        };
        assert_eq!(
            describe(&snapshot),
            "[#3] connected to ashoka, listening (voice: male, muted)"
        );

        snapshot.status = SessionStatus::Error;
        snapshot.muted = false;
        snapshot.error_message = Some("Connection Error".to_string());
        assert_eq!(
            describe(&snapshot),
            "[#3] error: Connection Error (type 'retry') (voice: male)"
        );
    }
}
