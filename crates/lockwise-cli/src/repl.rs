//! Subcommand: `lockwise run` -- interactive session REPL.
//!
//! Each input line becomes one host request.  Requests are published on the
//! session's bus exactly as a host app or autofill extension would publish
//! them, and host notifications, lock changes and errors are printed as
//! they arrive.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lockwise_kernel::{
    Action, ActionBus, ActionKind, AutoLockSetting, CancelReason, DataStoreAction,
    LifecycleAction, ListenerHandle, NewCredential, ServiceIdentifier, SettingAction,
    SyncCredential, UnlockKey,
};
use lockwise_session::{AppContext, SystemClock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::helpers::{load_config, open_storage};
use crate::host::TerminalHost;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One parsed REPL line.
#[derive(Debug, PartialEq)]
pub enum ReplCommand {
    SignIn {
        uid: String,
        scoped_key: String,
        email: Option<String>,
    },
    Unlock(Option<String>),
    Lock,
    Add {
        origin: String,
        username: String,
        password: String,
    },
    Remove(String),
    List(Option<String>),
    Refresh(Option<String>),
    Select {
        id: String,
        relock: bool,
    },
    Cancel,
    Foreground,
    Background,
    AutoLock(Option<AutoLockSetting>),
    Status,
    Help,
    Quit,
}

const HELP: &str = "\
  sign-in <uid> <scoped-key> [email]   store account session and key
  unlock [key]                         unlock (stored key when omitted)
  lock                                 lock now
  add <origin> <username> <password>   add a login
  remove <id>                          remove a login
  list [service]                       print logins
  refresh [service]                    configure the extension for a service
  select <id> [--relock]               autofill a login
  cancel                               dismiss the extension
  foreground | background              simulate app lifecycle
  autolock <setting|reset>             change the idle timeout
  status                               show session state
  quit                                 exit";

impl ReplCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err("empty command".into());
        };
        let args: Vec<&str> = words.collect();
        let arg = |i: usize, name: &str| {
            args.get(i)
                .map(|s| s.to_string())
                .ok_or_else(|| format!("missing <{name}>"))
        };
        let optional = |i: usize| args.get(i).map(|s| s.to_string());

        let parsed = match command {
            "sign-in" => Self::SignIn {
                uid: arg(0, "uid")?,
                scoped_key: arg(1, "scoped-key")?,
                email: optional(2),
            },
            "unlock" => Self::Unlock(optional(0)),
            "lock" => Self::Lock,
            "add" => Self::Add {
                origin: arg(0, "origin")?,
                username: arg(1, "username")?,
                password: arg(2, "password")?,
            },
            "remove" => Self::Remove(arg(0, "id")?),
            "list" => Self::List(optional(0)),
            "refresh" => Self::Refresh(optional(0)),
            "select" => Self::Select {
                id: arg(0, "id")?,
                relock: args.iter().skip(1).any(|a| *a == "--relock"),
            },
            "cancel" => Self::Cancel,
            "foreground" => Self::Foreground,
            "background" => Self::Background,
            "autolock" => {
                let value = arg(0, "setting")?;
                if value == "reset" {
                    Self::AutoLock(None)
                } else {
                    let setting = AutoLockSetting::parse(&value)
                        .ok_or_else(|| format!("unknown auto-lock setting `{value}`"))?;
                    Self::AutoLock(Some(setting))
                }
            }
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command `{other}` (try `help`)")),
        };
        Ok(parsed)
    }

    /// Whether the line counts as user interaction for the idle timer.
    fn is_interaction(&self) -> bool {
        !matches!(
            self,
            Self::Foreground | Self::Background | Self::Status | Self::Help | Self::Quit
        )
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

pub async fn cmd_run(config_path: &Path) -> Result<()> {
    // 1. Configuration and storage.
    let config = load_config(config_path)?;
    let (datastore, keychain) = open_storage(&config.storage.data_dir)?;
    let data_dir = config.storage.data_dir.clone();

    // 2. Start the session.
    let mut context = AppContext::start(
        config,
        datastore,
        keychain,
        Arc::new(TerminalHost),
        Arc::new(SystemClock),
    )
    .await
    .context("failed to start session")?;
    let _printer = print_events(context.bus());

    // 3. Banner.
    println!();
    println!("  Lockwise v{}", env!("CARGO_PKG_VERSION"));
    println!("  Data: {}", data_dir.display());
    println!("  Auto-lock: {}", context.timer().setting());
    println!("  Type `help` for commands, or `quit` to exit.");
    println!();

    // 4. Command loop.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read input")?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("interrupted");
                break;
            }
        };
        let Some(line) = line else {
            info!("EOF received, exiting");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match ReplCommand::parse(&line) {
            Ok(ReplCommand::Quit) => {
                info!("user requested exit");
                break;
            }
            Ok(command) => execute(&context, command).await,
            Err(message) => eprintln!("  {message}"),
        }
    }

    context.close().await;
    Ok(())
}

async fn execute(context: &AppContext, command: ReplCommand) {
    let bus = context.bus();
    if command.is_interaction() {
        bus.publish(Action::UserInteraction);
    }

    match command {
        ReplCommand::SignIn {
            uid,
            scoped_key,
            email,
        } => {
            context
                .coordinator()
                .account_session_available(SyncCredential {
                    uid,
                    email,
                    scoped_key: Some(scoped_key.into()),
                    ..SyncCredential::default()
                });
        }
        ReplCommand::Unlock(key) => {
            bus.publish(Action::DataStore(DataStoreAction::Unlock {
                key: key.map(UnlockKey::new),
            }));
        }
        ReplCommand::Lock => {
            bus.publish(Action::DataStore(DataStoreAction::Lock));
        }
        ReplCommand::Add {
            origin,
            username,
            password,
        } => {
            bus.publish(Action::DataStore(DataStoreAction::Add(NewCredential {
                origin,
                username: Some(username),
                password: password.into(),
            })));
        }
        ReplCommand::Remove(id) => {
            bus.publish(Action::DataStore(DataStoreAction::Remove { id }));
        }
        ReplCommand::List(service) => {
            let service = service.map(ServiceIdentifier::new);
            match context.store().list(service.as_ref()).await {
                Ok(list) => {
                    for credential in list.iter() {
                        println!(
                            "  {}  {}  {}  used {}x",
                            credential.id,
                            credential.origin,
                            credential.username.as_deref().unwrap_or("-"),
                            credential.times_used
                        );
                    }
                    println!("  {} login(s)", list.len());
                }
                Err(e) => eprintln!("  Error: {e}"),
            }
        }
        ReplCommand::Refresh(service) => {
            context
                .coordinator()
                .extension_configuration_requested(service.map(ServiceIdentifier::new));
        }
        ReplCommand::Select { id, relock } => context.coordinator().select(&id, relock),
        ReplCommand::Cancel => context.coordinator().cancel(CancelReason::UserCanceled),
        ReplCommand::Foreground => {
            bus.publish(Action::Lifecycle(LifecycleAction::Foreground));
        }
        ReplCommand::Background => {
            bus.publish(Action::Lifecycle(LifecycleAction::Background));
        }
        ReplCommand::AutoLock(Some(setting)) => {
            bus.publish(Action::Setting(SettingAction::AutoLockTime(setting)));
        }
        ReplCommand::AutoLock(None) => {
            bus.publish(Action::Setting(SettingAction::Reset));
        }
        ReplCommand::Status => print_status(context),
        ReplCommand::Help => println!("{HELP}"),
        ReplCommand::Quit => {}
    }
}

fn print_status(context: &AppContext) {
    let store = context.store();
    let timer = context.timer();
    println!("  Lock state: {}", store.state());
    println!("  Populate state: {:?}", context.coordinator().populate_state());
    println!("  Auto-lock: {}", timer.setting());
    match timer.deadline() {
        Some(deadline) => println!("  Locks at: {}", deadline.to_rfc3339()),
        None => println!("  Locks at: -"),
    }
    match store.session() {
        Some(session) => println!(
            "  Account: {} {}",
            session.uid,
            session.email.as_deref().unwrap_or("")
        ),
        None => println!("  Account: not signed in"),
    }
}

/// Print lock changes and error actions as they are published.
fn print_events(bus: &ActionBus) -> ListenerHandle {
    let mut events = bus.subscribe_kinds(&[ActionKind::LockState, ActionKind::Error]);
    ListenerHandle::new(
        "terminal-printer",
        tokio::spawn(async move {
            while let Some(action) = events.next().await {
                match action.as_ref() {
                    Action::LockStateChanged(state) => println!("  [{state}]"),
                    Action::Error(err) => eprintln!("  Error ({}): {}", err.context, err.error),
                    _ => {}
                }
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            ReplCommand::parse("sign-in uid-1 secret a@example.com").unwrap(),
            ReplCommand::SignIn {
                uid: "uid-1".into(),
                scoped_key: "secret".into(),
                email: Some("a@example.com".into()),
            }
        );
        assert_eq!(
            ReplCommand::parse("  unlock  ").unwrap(),
            ReplCommand::Unlock(None)
        );
        assert_eq!(
            ReplCommand::parse("select abc --relock").unwrap(),
            ReplCommand::Select {
                id: "abc".into(),
                relock: true
            }
        );
        assert_eq!(
            ReplCommand::parse("autolock one_hour").unwrap(),
            ReplCommand::AutoLock(Some(AutoLockSetting::OneHour))
        );
        assert_eq!(
            ReplCommand::parse("autolock reset").unwrap(),
            ReplCommand::AutoLock(None)
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ReplCommand::parse("add https://example.com alice").is_err());
        assert!(ReplCommand::parse("autolock forever").is_err());
        assert!(ReplCommand::parse("teleport").is_err());
    }

    #[test]
    fn lifecycle_is_not_interaction() {
        assert!(!ReplCommand::Foreground.is_interaction());
        assert!(!ReplCommand::Status.is_interaction());
        assert!(ReplCommand::Lock.is_interaction());
    }
}
