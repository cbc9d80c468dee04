//! Command parsing and execution for connected clients.
//!
//! A request frame is `"<command> [arg]..."`. The first token is looked up in
//! [`COMMAND_TABLE`], the argument count is checked against that entry, and only then is
//! the frame turned into a [`Command`]. Every command without a `group` prefix acts on
//! `"default"`; the `group*` variants take the group name as their first argument.
//!
//! [`CommandProcessor::execute`] runs a parsed command against the shared state and
//! always produces exactly one reply frame. Errors are rendered into that frame and
//! never escape to the session loop. The reply goes out through an outbox slot the
//! session reserved beforehand, and is queued while the state guard is still held, so
//! the caller sees its own reply in the same position relative to notices as every
//! other member does.
use log::{debug, info};
use tokio::sync::mpsc::Permit;

use super::errors::BbsError;
use super::state::{notice, JoinOutcome, SharedState, DEFAULT_GROUP};
use crate::logutil::escape_log;
use crate::validation::{sanitize_message_text, validate_group_name};

pub const HELP_TEXT: &str = concat!(
    "Commands (group* variants target <group>, the rest target \"default\"):\n",
    "  help                               Show this reference\n",
    "  join | groupjoin <group>           Join a group (created if new)\n",
    "  post <subject> <body...>           Post a message\n",
    "  grouppost <group> <subject> <body...>\n",
    "  users | groupusers <group>         List group members\n",
    "  leave | groupleave <group>         Leave a group\n",
    "  message <id> | groupmessage <group> <id>\n",
    "                                     Read a message\n",
    "  groups                             List all groups\n",
    "  exit                               Disconnect",
);

/// Which group a command acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Unprefixed form: the `"default"` group.
    Default,
    /// `group*` form with an explicit group name.
    Named(String),
}

impl Scope {
    pub fn group(&self) -> &str {
        match self {
            Scope::Default => DEFAULT_GROUP,
            Scope::Named(g) => g,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Join(Scope),
    Post {
        scope: Scope,
        subject: String,
        body: String,
    },
    Users(Scope),
    Leave(Scope),
    Message {
        scope: Scope,
        id: u64,
    },
    Groups,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Help,
    Join,
    Post,
    Users,
    Leave,
    Message,
    Groups,
    Exit,
}

/// One row of the dispatch table.
struct CommandSpec {
    word: &'static str,
    kind: Kind,
    /// Takes a group name as its first argument.
    scoped: bool,
    /// Arguments after the optional group name.
    min_args: usize,
    /// `None` means the last argument swallows the rest of the line.
    max_args: Option<usize>,
    usage: &'static str,
}

const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec { word: "help", kind: Kind::Help, scoped: false, min_args: 0, max_args: Some(0), usage: "help" },
    CommandSpec { word: "join", kind: Kind::Join, scoped: false, min_args: 0, max_args: Some(0), usage: "join" },
    CommandSpec { word: "groupjoin", kind: Kind::Join, scoped: true, min_args: 0, max_args: Some(0), usage: "groupjoin <group>" },
    CommandSpec { word: "post", kind: Kind::Post, scoped: false, min_args: 2, max_args: None, usage: "post <subject> <body...>" },
    CommandSpec { word: "grouppost", kind: Kind::Post, scoped: true, min_args: 2, max_args: None, usage: "grouppost <group> <subject> <body...>" },
    CommandSpec { word: "users", kind: Kind::Users, scoped: false, min_args: 0, max_args: Some(0), usage: "users" },
    CommandSpec { word: "groupusers", kind: Kind::Users, scoped: true, min_args: 0, max_args: Some(0), usage: "groupusers <group>" },
    CommandSpec { word: "leave", kind: Kind::Leave, scoped: false, min_args: 0, max_args: Some(0), usage: "leave" },
    CommandSpec { word: "groupleave", kind: Kind::Leave, scoped: true, min_args: 0, max_args: Some(0), usage: "groupleave <group>" },
    CommandSpec { word: "message", kind: Kind::Message, scoped: false, min_args: 1, max_args: Some(1), usage: "message <id>" },
    CommandSpec { word: "groupmessage", kind: Kind::Message, scoped: true, min_args: 1, max_args: Some(1), usage: "groupmessage <group> <id>" },
    CommandSpec { word: "groups", kind: Kind::Groups, scoped: false, min_args: 0, max_args: Some(0), usage: "groups" },
    CommandSpec { word: "exit", kind: Kind::Exit, scoped: false, min_args: 0, max_args: Some(0), usage: "exit" },
];

impl Command {
    /// Parse one request frame.
    pub fn parse(line: &str) -> Result<Command, BbsError> {
        let mut tokens = line.split_whitespace();
        let word = tokens.next().ok_or(BbsError::UnknownCommand)?.to_ascii_lowercase();
        let spec = COMMAND_TABLE
            .iter()
            .find(|s| s.word == word)
            .ok_or(BbsError::UnknownCommand)?;
        let args: Vec<&str> = tokens.collect();

        let required = spec.min_args + usize::from(spec.scoped);
        let too_many = spec
            .max_args
            .map(|max| args.len() > max + usize::from(spec.scoped))
            .unwrap_or(false);
        if args.len() < required || too_many {
            return Err(BbsError::protocol(format!("Usage: {}", spec.usage)));
        }

        let (scope, rest) = if spec.scoped {
            let group = validate_group_name(args[0])?;
            (Scope::Named(group), &args[1..])
        } else {
            (Scope::Default, &args[..])
        };

        let command = match spec.kind {
            Kind::Help => Command::Help,
            Kind::Join => Command::Join(scope),
            Kind::Users => Command::Users(scope),
            Kind::Leave => Command::Leave(scope),
            Kind::Groups => Command::Groups,
            Kind::Exit => Command::Exit,
            Kind::Post => Command::Post {
                scope,
                subject: sanitize_message_text(rest[0]),
                body: sanitize_message_text(&rest[1..].join(" ")),
            },
            Kind::Message => {
                let id = rest[0].parse::<u64>().map_err(|_| {
                    BbsError::protocol("Message ID must be a non-negative integer.")
                })?;
                Command::Message { scope, id }
            }
        };
        Ok(command)
    }
}

/// Identity of the session issuing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub session_id: u64,
    pub name: String,
}

/// What the session loop should do once the reply is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    /// Close the session after the reply.
    Exit(String),
}

impl Outcome {
    pub fn text(&self) -> &str {
        match self {
            Outcome::Reply(t) | Outcome::Exit(t) => t,
        }
    }
}

/// Executes parsed commands against the shared state.
pub struct CommandProcessor {
    state: SharedState,
}

impl CommandProcessor {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Parse and execute one request frame, queueing the reply on `reply`.
    pub async fn process(
        &self,
        caller: &Caller,
        line: &str,
        reply: Permit<'_, String>,
    ) -> Outcome {
        debug!(
            "Session {}: processing command: {}",
            caller.session_id,
            escape_log(line)
        );
        match Command::parse(line) {
            Ok(command) => self.execute(caller, command, reply).await,
            Err(e) => respond(reply, Outcome::Reply(e.to_string())),
        }
    }

    pub async fn execute(
        &self,
        caller: &Caller,
        command: Command,
        reply: Permit<'_, String>,
    ) -> Outcome {
        let name = caller.name.as_str();
        match command {
            Command::Help => respond(reply, Outcome::Reply(HELP_TEXT.to_string())),
            Command::Exit => respond(reply, Outcome::Exit("Goodbye.".to_string())),
            Command::Join(scope) => {
                let group = scope.group();
                let mut state = self.state.write().await;
                let text = match state.join(caller.session_id, name, group) {
                    JoinOutcome::Joined => {
                        info!("{} joined group {}", escape_log(name), group);
                        format!("Joined group {}.", group)
                    }
                    JoinOutcome::AlreadyMember => format!("You are already a member of {}.", group),
                };
                respond(reply, Outcome::Reply(text))
            }
            Command::Post {
                scope,
                subject,
                body,
            } => {
                let group = scope.group();
                let mut state = self.state.write().await;
                let posted = state.post(caller.session_id, name, group, &subject, &body);
                let text = render(posted, |id| {
                    info!("{} posted message #{} in {}", escape_log(name), id, group);
                    notice::new_post(group, name, id)
                });
                respond(reply, Outcome::Reply(text))
            }
            Command::Leave(scope) => {
                let group = scope.group();
                let mut state = self.state.write().await;
                let text = render(state.leave(caller.session_id, name, group), |()| {
                    info!("{} left group {}", escape_log(name), group);
                    format!("You have left group {}.", group)
                });
                respond(reply, Outcome::Reply(text))
            }
            Command::Users(scope) => {
                let require_membership = matches!(scope, Scope::Named(_));
                let state = self.state.read().await;
                let members = state.users(name, scope.group(), require_membership);
                respond(reply, Outcome::Reply(render(members, |m| m.join(", "))))
            }
            Command::Message { scope, id } => {
                let state = self.state.read().await;
                let message = state.message(name, scope.group(), id);
                respond(reply, Outcome::Reply(render(message, |m| m.render())))
            }
            Command::Groups => {
                let state = self.state.read().await;
                respond(reply, Outcome::Reply(state.group_names().join(", ")))
            }
        }
    }
}

fn render<T>(result: Result<T, BbsError>, ok: impl FnOnce(T) -> String) -> String {
    match result {
        Ok(value) => ok(value),
        Err(e) => e.to_string(),
    }
}

/// Queue the reply frame and hand the outcome back to the session loop.
fn respond(reply: Permit<'_, String>, outcome: Outcome) -> Outcome {
    reply.send(outcome.text().to_string());
    outcome
}
