//! Terminal feedback for `spot_replay`: spinners for setup stages and a bar
//! for the replayed cycles. Falls back to plain stderr lines off a TTY.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => Self::Plain,
            Some("pretty") => Self::Pretty,
            _ => Self::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        Self::new(UiMode::parse(ui_flag), is_tty)
    }

    fn pretty(&self) -> bool {
        match self.mode {
            UiMode::Pretty => self.is_tty,
            UiMode::Auto => self.is_tty && std::env::var_os("NO_COLOR").is_none(),
            UiMode::Plain => false,
        }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Counter for `total` replay cycles.
    pub fn cycles(&self, total: u64) -> CycleProgress {
        let bar = self.pretty().then(|| {
            let bar = ProgressBar::new(total);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("{bar:30} {pos}/{len} cycles {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        });
        CycleProgress {
            bar,
            total,
            done: 0,
        }
    }
}

pub struct CycleProgress {
    bar: Option<ProgressBar>,
    total: u64,
    done: u64,
}

impl CycleProgress {
    /// Record one finished cycle with a short summary such as `occupied=P1,P3`.
    pub fn tick(&mut self, summary: &str) {
        self.done += 1;
        match &self.bar {
            Some(bar) => {
                bar.set_message(summary.to_string());
                bar.inc(1);
            }
            None => eprintln!("cycle {}/{}: {}", self.done, self.total, summary),
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }
}

impl Drop for CycleProgress {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
