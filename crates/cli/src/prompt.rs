//! Operator interaction behind a capability trait so `--no-interactive` is exact.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CANCELLED_MESSAGE, Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("interactive input is disabled: {0}")]
    NonInteractive(String),
    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
    #[error("invalid selection '{0}'")]
    InvalidSelection(String),
    #[error("no scripted answer left for '{0}'")]
    Exhausted(String),
    #[error("prompt I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl Classify for PromptError {
    fn kind(&self) -> ErrorKind {
        match self {
            PromptError::Cancelled => ErrorKind::Cancelled,
            PromptError::NonInteractive(_) | PromptError::InvalidSelection(_) => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Unknown,
        }
    }
}

pub trait Prompter: Send + Sync {
    fn input(&self, message: &str) -> Result<String, PromptError>;
    fn password(&self, message: &str) -> Result<String, PromptError>;
    /// Returns the index of the chosen option.
    fn select(&self, message: &str, options: &[String]) -> Result<usize, PromptError>;
    /// Returns the indices of the chosen options in ascending order.
    fn multiselect(&self, message: &str, options: &[String]) -> Result<Vec<usize>, PromptError>;
    fn confirm(&self, message: &str, default: bool) -> Result<bool, PromptError>;
}

/// Rejects every call.
pub struct NoPrompter;

impl Prompter for NoPrompter {
    fn input(&self, message: &str) -> Result<String, PromptError> {
        Err(PromptError::NonInteractive(message.to_string()))
    }

    fn password(&self, message: &str) -> Result<String, PromptError> {
        Err(PromptError::NonInteractive(message.to_string()))
    }

    fn select(&self, message: &str, _options: &[String]) -> Result<usize, PromptError> {
        Err(PromptError::NonInteractive(message.to_string()))
    }

    fn multiselect(&self, message: &str, _options: &[String]) -> Result<Vec<usize>, PromptError> {
        Err(PromptError::NonInteractive(message.to_string()))
    }

    fn confirm(&self, message: &str, _default: bool) -> Result<bool, PromptError> {
        Err(PromptError::NonInteractive(message.to_string()))
    }
}

static READING: AtomicBool = AtomicBool::new(false);

/// True while a terminal prompt is blocked on stdin. Such a read cannot be abandoned, so an
/// interrupt arriving now has to end the process.
pub fn is_reading() -> bool {
    READING.load(Ordering::SeqCst)
}

struct ReadingGuard;

impl ReadingGuard {
    fn start() -> Self {
        READING.store(true, Ordering::SeqCst);
        ReadingGuard
    }
}

impl Drop for ReadingGuard {
    fn drop(&mut self) {
        READING.store(false, Ordering::SeqCst);
    }
}

/// Line-oriented prompts on stderr, answers from stdin.
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(&self, message: &str) -> Result<String, PromptError> {
        let mut stderr = io::stderr();
        write!(stderr, "{message} ")?;
        stderr.flush()?;
        let mut line = String::new();
        let _reading = ReadingGuard::start();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(PromptError::Cancelled);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn print_options(&self, options: &[String]) -> Result<(), PromptError> {
        let mut stderr = io::stderr();
        for (idx, option) in options.iter().enumerate() {
            writeln!(stderr, "  {:>2}) {}", idx + 1, option)?;
        }
        Ok(())
    }
}

impl Prompter for TerminalPrompter {
    fn input(&self, message: &str) -> Result<String, PromptError> {
        self.read_line(message)
    }

    fn password(&self, message: &str) -> Result<String, PromptError> {
        let _reading = ReadingGuard::start();
        rpassword::prompt_password(format!("{message} ")).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                PromptError::Cancelled
            } else {
                PromptError::Io(err)
            }
        })
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize, PromptError> {
        writeln!(io::stderr(), "{message}")?;
        self.print_options(options)?;
        let answer = self.read_line("Enter a number:")?;
        match parse_selection(&answer, options.len())?.as_slice() {
            [single] => Ok(*single),
            _ => Err(PromptError::InvalidSelection(answer)),
        }
    }

    fn multiselect(&self, message: &str, options: &[String]) -> Result<Vec<usize>, PromptError> {
        writeln!(io::stderr(), "{message}")?;
        self.print_options(options)?;
        let answer = self.read_line("Enter numbers separated by commas, or 'all':")?;
        parse_selection(&answer, options.len())
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool, PromptError> {
        let suffix = if default { "[Y/n]" } else { "[y/N]" };
        let answer = self.read_line(&format!("{message} {suffix}"))?;
        match answer.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "y" | "yes" => Ok(true),
            "n" | "no" => Ok(false),
            other => Err(PromptError::InvalidSelection(other.to_string())),
        }
    }
}

/// Parses `1,3`, `2-4` or `all` into zero-based indices.
pub fn parse_selection(answer: &str, len: usize) -> Result<Vec<usize>, PromptError> {
    let trimmed = answer.trim();
    if trimmed.eq_ignore_ascii_case("all") {
        return Ok((0..len).collect());
    }
    let invalid = || PromptError::InvalidSelection(trimmed.to_string());
    let mut picked = Vec::new();
    for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (part, part),
        };
        let start: usize = start.parse().map_err(|_| invalid())?;
        let end: usize = end.parse().map_err(|_| invalid())?;
        if start == 0 || end < start || end > len {
            return Err(invalid());
        }
        picked.extend((start - 1)..end);
    }
    if picked.is_empty() {
        return Err(invalid());
    }
    picked.sort_unstable();
    picked.dedup();
    Ok(picked)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text(String),
    Choice(usize),
    Choices(Vec<usize>),
    Confirm(bool),
}

/// Replays queued answers in order; used by tests.
#[derive(Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<Answer>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Messages shown so far.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn next(&self, message: &str) -> Result<Answer, PromptError> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(message.to_string());
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut a| a.pop_front())
            .ok_or_else(|| PromptError::Exhausted(message.to_string()))
    }
}

impl Prompter for ScriptedPrompter {
    fn input(&self, message: &str) -> Result<String, PromptError> {
        match self.next(message)? {
            Answer::Text(text) => Ok(text),
            other => Err(PromptError::InvalidSelection(format!("{other:?}"))),
        }
    }

    fn password(&self, message: &str) -> Result<String, PromptError> {
        self.input(message)
    }

    fn select(&self, message: &str, options: &[String]) -> Result<usize, PromptError> {
        match self.next(message)? {
            Answer::Choice(idx) if idx < options.len() => Ok(idx),
            other => Err(PromptError::InvalidSelection(format!("{other:?}"))),
        }
    }

    fn multiselect(&self, message: &str, options: &[String]) -> Result<Vec<usize>, PromptError> {
        match self.next(message)? {
            Answer::Choices(picked) if picked.iter().all(|i| *i < options.len()) => Ok(picked),
            other => Err(PromptError::InvalidSelection(format!("{other:?}"))),
        }
    }

    fn confirm(&self, message: &str, _default: bool) -> Result<bool, PromptError> {
        match self.next(message)? {
            Answer::Confirm(value) => Ok(value),
            other => Err(PromptError::InvalidSelection(format!("{other:?}"))),
        }
    }
}
