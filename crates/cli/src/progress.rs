//! Per-appliance progress for the backup orchestrator.
//!
//! Workers never write to stdout directly; every update goes through a shared [`Reporter`].

use std::collections::HashMap;
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossterm::cursor::MoveUp;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Initiating,
    /// Number of status polls issued so far.
    Polling(u32),
    /// Bytes written so far.
    Downloading(u64),
    Done(PathBuf),
    Failed(String),
}

impl JobState {
    fn stage(&self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Initiating => 1,
            JobState::Polling(_) => 2,
            JobState::Downloading(_) => 3,
            JobState::Done(_) | JobState::Failed(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage() == 4
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => f.write_str("queued"),
            JobState::Initiating => f.write_str("initiating"),
            JobState::Polling(n) => write!(f, "polling ({n})"),
            JobState::Downloading(bytes) => write!(f, "downloading ({})", format_bytes(*bytes)),
            JobState::Done(path) => write!(f, "done ({})", path.display()),
            JobState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub trait Reporter: Send + Sync {
    fn update(&self, name: &str, state: JobState);
    /// Flushes whatever the reporter still holds once the run is over.
    fn finish(&self) {}
}

pub type SharedReporter = Arc<dyn Reporter>;

/// `--quiet`.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn update(&self, _name: &str, _state: JobState) {}
}

/// One `<name>: <state>` line per transition, for pipes and logs.
pub struct LineReporter<W: Write + Send> {
    inner: Mutex<LineState<W>>,
}

struct LineState<W> {
    out: W,
    last: HashMap<String, JobState>,
}

impl<W: Write + Send> LineReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            inner: Mutex::new(LineState {
                out,
                last: HashMap::new(),
            }),
        }
    }

    pub fn into_inner(self) -> W {
        match self.inner.into_inner() {
            Ok(state) => state.out,
            Err(poisoned) => poisoned.into_inner().out,
        }
    }
}

impl<W: Write + Send> Reporter for LineReporter<W> {
    fn update(&self, name: &str, state: JobState) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        // Byte counts only refresh a line; a new line starts with the stage.
        if let Some(previous) = guard.last.get(name)
            && matches!(state, JobState::Downloading(_))
            && previous.stage() == state.stage()
        {
            guard.last.insert(name.to_string(), state);
            return;
        }
        let _ = writeln!(guard.out, "{name}: {state}");
        let _ = guard.out.flush();
        guard.last.insert(name.to_string(), state);
    }
}

/// A block of lines, one per appliance, redrawn in place.
pub struct TerminalReporter<W: Write + Send> {
    inner: Mutex<Region<W>>,
}

struct Region<W> {
    out: W,
    rows: Vec<(String, JobState)>,
    drawn: u16,
}

impl<W: Write + Send> Region<W> {
    fn redraw(&mut self) -> io::Result<()> {
        if self.drawn > 0 {
            queue!(self.out, MoveUp(self.drawn))?;
        }
        let width = self.rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        for (name, state) in &self.rows {
            queue!(self.out, Clear(ClearType::CurrentLine))?;
            writeln!(self.out, "{name:<width$}  {state}")?;
        }
        self.drawn = u16::try_from(self.rows.len()).unwrap_or(u16::MAX);
        self.out.flush()
    }
}

impl<W: Write + Send> TerminalReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            inner: Mutex::new(Region {
                out,
                rows: Vec::new(),
                drawn: 0,
            }),
        }
    }

    pub fn into_inner(self) -> W {
        match self.inner.into_inner() {
            Ok(region) => region.out,
            Err(poisoned) => poisoned.into_inner().out,
        }
    }
}

impl<W: Write + Send> Reporter for TerminalReporter<W> {
    fn update(&self, name: &str, state: JobState) {
        let Ok(mut region) = self.inner.lock() else {
            return;
        };
        match region.rows.iter_mut().find(|(n, _)| n == name) {
            Some(row) => row.1 = state,
            None => region.rows.push((name.to_string(), state)),
        }
        let _ = region.redraw();
    }

    fn finish(&self) {
        if let Ok(mut region) = self.inner.lock() {
            let _ = region.out.flush();
        }
    }
}

/// Quiet runs get nothing; terminals get the redrawn region; everything else gets lines.
pub fn for_stdout(quiet: bool) -> SharedReporter {
    if quiet {
        return Arc::new(NullReporter);
    }
    let stdout = io::stdout();
    if stdout.is_terminal() {
        Arc::new(TerminalReporter::new(stdout))
    } else {
        Arc::new(LineReporter::new(stdout))
    }
}
