use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

use crate::api::CitationProgress;
use crate::app::{ProgressEvent, ProgressSink};

pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const CYAN: &str = "\x1b[36m";
pub const BOLD: &str = "\x1b[1m";
pub const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }

    pub fn print_lines<T: Serialize>(items: &[T]) -> io::Result<()> {
        let mut stdout = io::stdout();
        for item in items {
            let json = serde_json::to_string(item).map_err(io::Error::other)?;
            stdout.write_all(json.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Interactive sink: phase messages go to stderr, keeping stdout for data.
pub struct ConsoleOutput;

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        eprintln!("{}", event.message);
    }
}

#[derive(Debug, Default)]
struct BarState {
    total: usize,
    done: usize,
}

/// `\r`-redrawn enrichment progress bar on stderr. Increments arrive from
/// worker threads in any order; the mutex keeps redraws from interleaving.
#[derive(Default)]
pub struct TermProgress {
    state: Mutex<BarState>,
}

impl TermProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn draw(state: &BarState) {
        if state.total == 0 {
            return;
        }
        let width = crossterm::terminal::size()
            .map(|(columns, _)| columns as usize)
            .unwrap_or(80)
            .min(100);
        let digits = decimal_width(state.total);
        // [bar] (done/total) plus padding
        let reserved = 2 + 1 + digits * 2 + 2 + 1 + 2;
        let bar_width = width.saturating_sub(reserved).max(10);
        let filled = bar_width * state.done.min(state.total) / state.total;

        let bar: String = "=".repeat(filled);
        eprint!(
            "\r[{bar:<bar_width$}] ({done:>digits$}/{total})",
            done = state.done,
            total = state.total,
        );
        let _ = io::stderr().flush();
        if state.done >= state.total {
            eprintln!();
        }
    }
}

impl CitationProgress for TermProgress {
    fn begin(&self, total: usize) {
        let mut state = self.state.lock().unwrap();
        state.total = total;
        state.done = 0;
        Self::draw(&state);
    }

    fn tick(&self) {
        let mut state = self.state.lock().unwrap();
        state.done += 1;
        Self::draw(&state);
    }
}

fn decimal_width(value: usize) -> usize {
    value.checked_ilog10().map(|log| log as usize + 1).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_width_counts_digits() {
        assert_eq!(decimal_width(0), 1);
        assert_eq!(decimal_width(9), 1);
        assert_eq!(decimal_width(10), 2);
        assert_eq!(decimal_width(250), 3);
    }
}
