use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// How stage progress is reported on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `stdout_piped` keeps spinners off when command output is being captured.
    pub fn from_args(ui_flag: &str, stderr_is_tty: bool, stdout_piped: bool) -> Self {
        let pretty = stderr_is_tty
            && match UiMode::parse(ui_flag) {
                UiMode::Pretty => true,
                UiMode::Auto => !stdout_piped,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    /// Report a stage; it completes when the guard drops, or fails via [`StageGuard::fail`].
    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty {
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

    /// Run `step` as a stage; an error marks the stage failed and is passed on.
    pub fn run_stage<T, E: std::fmt::Display>(
        &self,
        name: &str,
        step: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let stage = self.stage(name);
        let result = step();
        if let Err(err) = &result {
            stage.fail(err);
        }
        result
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failure: Option<String>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failure: None,
        }
    }

    /// Mark the stage failed; the reason is shown when the guard drops.
    pub fn fail(mut self, reason: impl std::fmt::Display) {
        self.failure = Some(reason.to_string());
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = format_duration(self.start.elapsed());
        let message = match &self.failure {
            Some(reason) => format!("✘ {} ({}): {}", self.name, elapsed, reason),
            None => format!("✔ {} ({})", self.name, elapsed),
        };
        match &self.spinner {
            Some(spinner) if self.failure.is_some() => spinner.abandon_with_message(message),
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_stage_passes_results_through() {
        let ui = Ui::from_args("plain", false, true);
        assert_eq!(ui.run_stage("ok", || Ok::<_, String>(3)), Ok(3));
        assert_eq!(
            ui.run_stage("broken", || Err::<u8, _>("disk full".to_string())),
            Err("disk full".to_string())
        );
    }
}
