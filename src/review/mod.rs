//! Interactive review of one draft artifact.
//!
//! The grammar is tokenized up front (quoted strings, then words) and
//! parsed into a closed command set, so every command shares the same
//! parsing rules. `ReviewSession` holds the draft being edited and maps
//! each parsed command to an effect; it never persists anything. The
//! terminal outcomes are confirm, redo (bounded per step), back and quit.
//! `ConsoleReviewer` wires the session to an interactive prompt.

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::Input;
use serde_json::{Value, json};

use crate::artifact::Artifact;
use crate::step::Step;

/// Default ceiling on `redo` per step.
pub const DEFAULT_MAX_REDO: u32 = 2;

const EPIC_INPUT_ATTEMPTS: u32 = 3;

const BRIEF_HELP: &str = "commands: show, confirm, redo, back, quit, keep, drop, rename, add, help";

const FULL_HELP: &str = "\
  show                 reprint the draft
  confirm              accept the draft as-is and freeze it
  redo                 regenerate the draft (limited per step)
  back                 roll back to the previous step
  quit                 stop the run; progress so far is kept
  keep 1,3,4           keep only these items, in this order
  drop 2               remove one item
  rename 2 \"New name\"  set the display name of one item
  add \"New item\"       append a new item
  help                 show this help";

// ---------------- Tokenizer ----------------

/// One token of a review command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(String),
    Quoted(String),
}

/// Split a command line into words and quoted strings. Double and single
/// quotes both delimit; backslash escapes the next character inside
/// double quotes.
pub fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' || c == '\'' {
            let quote = c;
            chars.next();
            let mut buf = String::new();
            let mut closed = false;
            while let Some(ch) = chars.next() {
                if ch == '\\' && quote == '"' {
                    match chars.next() {
                        Some(esc) => buf.push(esc),
                        None => return Err("dangling escape in quoted string".to_string()),
                    }
                } else if ch == quote {
                    closed = true;
                    break;
                } else {
                    buf.push(ch);
                }
            }
            if !closed {
                return Err("unterminated quoted string".to_string());
            }
            tokens.push(Token::Quoted(buf));
        } else {
            let mut buf = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '"' || ch == '\'' {
                    break;
                }
                buf.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(buf));
        }
    }

    Ok(tokens)
}

// ---------------- Command grammar ----------------

/// A parsed review command. Indices are 1-based as displayed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewCommand {
    Show,
    Help,
    Confirm,
    Back,
    Quit,
    Redo,
    Keep(Vec<usize>),
    Drop(usize),
    Rename(usize, String),
    Add(String),
}

/// Parse one command line. Keywords are case-insensitive and accept the
/// common abbreviations.
pub fn parse(line: &str) -> Result<ReviewCommand, String> {
    let tokens = tokenize(line)?;
    let Some((head, rest)) = tokens.split_first() else {
        return Err("empty command; type help".to_string());
    };
    let Token::Word(word) = head else {
        return Err("commands start with a keyword; type help".to_string());
    };

    match word.to_ascii_lowercase().as_str() {
        "s" | "show" => Ok(ReviewCommand::Show),
        "h" | "help" | "?" => Ok(ReviewCommand::Help),
        "c" | "confirm" | "ok" | "yes" => Ok(ReviewCommand::Confirm),
        "b" | "back" | "rollback" => Ok(ReviewCommand::Back),
        "q" | "quit" | "exit" => Ok(ReviewCommand::Quit),
        "r" | "redo" | "regen" => Ok(ReviewCommand::Redo),
        "keep" => {
            let indices = parse_indices(rest);
            if indices.is_empty() {
                Err("keep needs at least one index, e.g. keep 1,3".to_string())
            } else {
                Ok(ReviewCommand::Keep(indices))
            }
        }
        "drop" => match parse_indices(rest).as_slice() {
            [index] => Ok(ReviewCommand::Drop(*index)),
            _ => Err("drop takes exactly one index, e.g. drop 2".to_string()),
        },
        "rename" => match rest {
            [Token::Word(idx), Token::Quoted(text)] => idx
                .parse::<usize>()
                .map(|i| ReviewCommand::Rename(i, text.clone()))
                .map_err(|_| format!("'{idx}' is not an item index")),
            _ => Err("usage: rename <index> \"new name\"".to_string()),
        },
        "add" => match rest {
            [Token::Quoted(text)] => Ok(ReviewCommand::Add(text.clone())),
            _ => Err("usage: add \"item name\"".to_string()),
        },
        other => Err(format!("unrecognized command '{other}'; type help")),
    }
}

/// Collect 1-based indices from word tokens, comma- or space-separated.
/// Entries that do not parse as numbers are dropped.
fn parse_indices(tokens: &[Token]) -> Vec<usize> {
    tokens
        .iter()
        .filter_map(|t| match t {
            Token::Word(w) => Some(w.as_str()),
            Token::Quoted(_) => None,
        })
        .flat_map(|w| w.split(','))
        .filter(|part| !part.trim().is_empty())
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .collect()
}

// ---------------- Session ----------------

/// Terminal result of a review session.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    /// Accept the (possibly edited) artifact; the caller freezes it.
    Confirm(Artifact),
    /// Regenerate; carries the edited draft and the redo count used so
    /// far including this one, so the ceiling survives regeneration.
    Redo(Artifact, u32),
    /// Roll back to the previous step.
    Back,
    /// Abort the run, keeping confirmed progress.
    Quit,
}

/// What the caller should do after handling one command line.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStep {
    /// Reprint the draft.
    Show,
    /// Print the full help.
    Help,
    /// Print a message (rejection or guidance); the draft is unchanged.
    Notice(String),
    /// An edit applied; print the message and the updated draft.
    Edited(String),
    /// The session is over.
    Finished(ReviewOutcome),
}

/// One review session over one draft. `redo_used` seeds the counter so
/// the per-step ceiling holds across regeneration cycles.
pub struct ReviewSession {
    artifact: Artifact,
    redo_used: u32,
    max_redo: u32,
}

impl ReviewSession {
    pub fn new(artifact: Artifact, redo_used: u32, max_redo: u32) -> ReviewSession {
        ReviewSession {
            artifact,
            redo_used,
            max_redo,
        }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    /// Apply one command line to the session.
    pub fn handle(&mut self, line: &str) -> SessionStep {
        let command = match parse(line) {
            Ok(command) => command,
            Err(message) => return SessionStep::Notice(message),
        };

        match command {
            ReviewCommand::Show => SessionStep::Show,
            ReviewCommand::Help => SessionStep::Help,
            ReviewCommand::Confirm => {
                SessionStep::Finished(ReviewOutcome::Confirm(self.artifact.clone()))
            }
            ReviewCommand::Back => SessionStep::Finished(ReviewOutcome::Back),
            ReviewCommand::Quit => SessionStep::Finished(ReviewOutcome::Quit),
            ReviewCommand::Redo => {
                if self.redo_used >= self.max_redo {
                    SessionStep::Notice(format!(
                        "redo limit reached ({} per step); confirm, edit, back or quit",
                        self.max_redo
                    ))
                } else {
                    SessionStep::Finished(ReviewOutcome::Redo(
                        self.artifact.clone(),
                        self.redo_used + 1,
                    ))
                }
            }
            ReviewCommand::Keep(indices) => match self.artifact.keep(&indices) {
                Ok(remaining) => SessionStep::Edited(format!("kept {remaining} item(s)")),
                Err(message) => SessionStep::Notice(message),
            },
            ReviewCommand::Drop(index) => match self.artifact.drop_one(index) {
                Ok(()) => SessionStep::Edited(format!("dropped item {index}")),
                Err(message) => SessionStep::Notice(message),
            },
            ReviewCommand::Rename(index, text) => match self.artifact.rename(index, &text) {
                Ok(()) => SessionStep::Edited(format!("renamed item {index}")),
                Err(message) => SessionStep::Notice(message),
            },
            ReviewCommand::Add(text) => match self.artifact.add(&text) {
                Ok(()) => SessionStep::Edited(format!("added \"{text}\"")),
                Err(message) => SessionStep::Notice(message),
            },
        }
    }
}

// ---------------- Reviewer seam ----------------

/// Human interaction surface the orchestrator drives. The console
/// implementation prompts interactively; tests script it.
pub trait Reviewer {
    /// Review one draft; `redo_used` is the step's redo count so far.
    fn review(&mut self, step: Step, draft: Artifact, redo_used: u32) -> Result<ReviewOutcome>;

    /// Collect the epic directly from the user.
    fn collect_epic(&mut self, default_title: &str) -> Result<Value>;

    /// Optional guidance to include when regenerating after a redo.
    fn redo_hint(&mut self) -> Result<Option<String>>;
}

/// Interactive reviewer over stdin/stdout.
pub struct ConsoleReviewer {
    max_redo: u32,
}

impl ConsoleReviewer {
    pub fn new(max_redo: u32) -> ConsoleReviewer {
        ConsoleReviewer { max_redo }
    }

    fn print_artifact(artifact: &Artifact) {
        if artifact.is_list() {
            let lines = artifact.display_lines();
            if lines.is_empty() {
                println!("{}", style("(empty list)").dim());
            }
            for line in lines {
                println!("  {line}");
            }
        } else if let Some(text) = artifact.as_text() {
            println!("{text}");
        } else if let Some(value) = artifact.to_value() {
            match serde_json::to_string_pretty(&value) {
                Ok(pretty) => println!("{pretty}"),
                Err(_) => println!("{value}"),
            }
        }
    }
}

impl Default for ConsoleReviewer {
    fn default() -> Self {
        ConsoleReviewer::new(DEFAULT_MAX_REDO)
    }
}

impl Reviewer for ConsoleReviewer {
    fn review(&mut self, step: Step, draft: Artifact, redo_used: u32) -> Result<ReviewOutcome> {
        println!();
        println!("{} {}", style("Reviewing draft:").bold(), style(step).cyan());
        Self::print_artifact(&draft);
        println!("{}", style(BRIEF_HELP).dim());

        let mut session = ReviewSession::new(draft, redo_used, self.max_redo);
        loop {
            let line: String = Input::new()
                .with_prompt("review")
                .allow_empty(true)
                .interact_text()
                .context("failed to read review command")?;

            match session.handle(&line) {
                SessionStep::Show => Self::print_artifact(session.artifact()),
                SessionStep::Help => println!("{FULL_HELP}"),
                SessionStep::Notice(message) => println!("{}", style(message).yellow()),
                SessionStep::Edited(message) => {
                    println!("{}", style(message).green());
                    Self::print_artifact(session.artifact());
                }
                SessionStep::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    fn collect_epic(&mut self, default_title: &str) -> Result<Value> {
        println!();
        println!("{}", style("Describe the epic.").bold());

        for _ in 0..EPIC_INPUT_ATTEMPTS {
            let title: String = Input::new()
                .with_prompt("Epic title")
                .with_initial_text(default_title)
                .allow_empty(true)
                .interact_text()
                .context("failed to read epic title")?;

            if title.trim().is_empty() {
                println!("{}", style("The title cannot be empty.").yellow());
                continue;
            }

            let goal: String = Input::new()
                .with_prompt("Epic goal")
                .allow_empty(true)
                .interact_text()
                .context("failed to read epic goal")?;

            return Ok(json!({
                "title": title.trim(),
                "goal": goal.trim(),
            }));
        }

        bail!("no usable epic input after {EPIC_INPUT_ATTEMPTS} attempts")
    }

    fn redo_hint(&mut self) -> Result<Option<String>> {
        let hint: String = Input::new()
            .with_prompt("What should change? (empty for none)")
            .allow_empty(true)
            .interact_text()
            .context("failed to read redo hint")?;
        let hint = hint.trim().to_string();
        Ok((!hint.is_empty()).then_some(hint))
    }
}
