//! Chat commands.
//!
//! The first whitespace-delimited word of an incoming message selects a
//! command. A command runs when the message is that word alone, or when the
//! command is greedy (it consumes the rest of the message as its argument).
//! Messages that name no command are broadcast to the other peers.
//!
//! Several tables are merged per connection with first-registered-wins
//! precedence: built-ins, then registry commands (`users`), then commands
//! supplied by the embedding program.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use presence_core::{escape_text, Message};

/// Output of a command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Reply rendered from inline markup
    Markup(String),
    /// Reply rendered from plain text
    Text(String),
    /// Nothing to send back
    Silent,
}

impl Reply {
    /// Builds the outgoing message from `identity` to `other`.
    ///
    /// Returns `None` for silent or empty replies.
    pub fn into_message(self, identity: &str, other: &str) -> Option<Message> {
        let mut message = match self {
            Self::Markup(markup) => Message::from_markup(identity, other, markup),
            Self::Text(text) => Message::from_plain(identity, other, text),
            Self::Silent => return None,
        };
        if message.is_empty() {
            return None;
        }
        message.synchronize();
        Some(message)
    }
}

/// What a handler can see of its session.
pub struct CommandContext<'a> {
    pub identity: &'a str,
    pub other: &'a str,
    pub download_dir: Option<&'a Path>,
    pub commands: &'a CommandTable,
}

/// Command handler.
pub type Handler = Arc<dyn Fn(&CommandContext<'_>, &Message) -> Reply + Send + Sync>;

/// A named chat command.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub help: String,

    /// Runs even when followed by more words
    pub greedy: bool,

    handler: Handler,
}

impl Command {
    pub fn new<F>(name: impl Into<String>, help: impl Into<String>, greedy: bool, handler: F) -> Self
    where
        F: Fn(&CommandContext<'_>, &Message) -> Reply + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            help: help.into(),
            greedy,
            handler: Arc::new(handler),
        }
    }

    pub fn run(&self, ctx: &CommandContext<'_>, message: &Message) -> Reply {
        (self.handler)(ctx, message)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("help", &self.help)
            .field("greedy", &self.greedy)
            .finish_non_exhaustive()
    }
}

/// Outcome of looking up a message in the table.
#[derive(Debug)]
pub enum Dispatch<'a> {
    /// Invoke the command
    Run(&'a Command),
    /// A non-greedy command followed by extra words; nothing is done
    Ignored(&'a Command),
    /// No command matched
    Broadcast,
}

/// Commands keyed by name, iterated in name order.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: BTreeMap<String, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding `echo`, `help`, `hello`, `vars` and `ls`.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert(Command::new("echo", "echo text", true, echo));
        table.insert(Command::new("help", "print this help", false, help));
        table.insert(Command::new("hello", "print welcome message", false, hello));
        table.insert(Command::new("vars", "print session variables", false, vars));
        table.insert(Command::new("ls", "list download directory", false, ls));
        table
    }

    /// Adds or replaces a command.
    pub fn insert(&mut self, command: Command) {
        self.commands.insert(command.name.clone(), command);
    }

    /// Adds every command of `other` whose name is not taken yet.
    pub fn merge(&mut self, other: &CommandTable) {
        for (name, command) in &other.commands {
            self.commands
                .entry(name.clone())
                .or_insert_with(|| command.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Applies the dispatch rule to a message.
    pub fn resolve(&self, message: &Message) -> Dispatch<'_> {
        let mut words = message.words();
        let Some(command) = words.next().and_then(|first| self.get(first)) else {
            return Dispatch::Broadcast;
        };
        if words.next().is_none() || command.greedy {
            Dispatch::Run(command)
        } else {
            Dispatch::Ignored(command)
        }
    }

    /// Markup listing of all commands and their help text.
    pub fn help_text(&self) -> String {
        let mut text = String::from("<b>commands:</b><br/>");
        for command in self.iter() {
            text.push_str(&format!(
                "  {} - {}<br/>",
                escape_text(&command.name),
                escape_text(&command.help)
            ));
        }
        text
    }
}

// ============================================================================
// Built-in handlers
// ============================================================================

fn echo(_ctx: &CommandContext<'_>, message: &Message) -> Reply {
    let text = message.plain.trim_start();
    let rest = text
        .split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim())
        .unwrap_or_default();
    Reply::Text(rest.to_string())
}

fn help(ctx: &CommandContext<'_>, _message: &Message) -> Reply {
    Reply::Markup(ctx.commands.help_text())
}

fn hello(ctx: &CommandContext<'_>, _message: &Message) -> Reply {
    Reply::Markup(welcome_text(ctx.identity, ctx.commands))
}

/// Banner sent by `hello` and on stream open when greeting is enabled.
pub fn welcome_text(identity: &str, commands: &CommandTable) -> String {
    format!(
        "Welcome at <b>{}</b><br/>{}",
        escape_text(identity),
        commands.help_text()
    )
}

fn vars(ctx: &CommandContext<'_>, _message: &Message) -> Reply {
    let download_dir = ctx
        .download_dir
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "disabled".to_string());
    Reply::Markup(format!(
        "<b>variables:</b><br/>  identity - {}<br/>  other - {}<br/>  downloaddir - {}<br/>",
        escape_text(ctx.identity),
        escape_text(ctx.other),
        escape_text(&download_dir),
    ))
}

fn ls(ctx: &CommandContext<'_>, _message: &Message) -> Reply {
    let Some(dir) = ctx.download_dir else {
        return Reply::Text("Downloads disabled".to_string());
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Reply::Text("Download directory does not exist".to_string()),
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(t) if t.is_dir() => format!("[{name}]"),
                _ => name,
            }
        })
        .collect();
    names.sort();

    let mut text = format!("Contents of <b>{}</b><br/>", escape_text(&dir.display().to_string()));
    if names.is_empty() {
        text.push_str("No files found");
    }
    for name in names {
        text.push_str(&escape_text(&name));
        text.push_str("<br/>");
    }
    Reply::Markup(text)
}
