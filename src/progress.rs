use crate::backup::{Phase, PhaseListener};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub enabled: bool,
    pub is_interactive: bool,
    pub tick_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            is_interactive: std::io::stderr().is_terminal(),
            tick_interval: Duration::from_millis(120),
        }
    }
}

impl ProgressConfig {
    pub fn auto_detect() -> Self {
        // Disable in CI environments
        if is_ci_environment() {
            Self {
                enabled: false,
                is_interactive: false,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    pub fn should_show(&self) -> bool {
        self.enabled && self.is_interactive
    }
}

/// Spinner showing the current phase of a run
pub struct SpinnerListener {
    config: ProgressConfig,
    spinner: Option<ProgressBar>,
}

impl SpinnerListener {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            spinner: None,
        }
    }

    fn spinner(&mut self) -> &ProgressBar {
        let interval = self.config.tick_interval;
        self.spinner.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]")
            {
                pb.set_style(style);
            }
            pb.enable_steady_tick(interval);
            pb
        })
    }
}

impl PhaseListener for SpinnerListener {
    fn on_phase_change(&mut self, phase: &Phase) {
        if !self.config.should_show() {
            return;
        }

        match phase {
            Phase::Complete { .. } | Phase::Failed { .. } => {
                if let Some(pb) = self.spinner.take() {
                    pb.finish_and_clear();
                }
            }
            _ => self.spinner().set_message(phase.message()),
        }
    }
}

impl Drop for SpinnerListener {
    fn drop(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }
}

fn is_ci_environment() -> bool {
    ["CI", "CONTINUOUS_INTEGRATION", "GITHUB_ACTIONS", "GITLAB_CI", "BUILDKITE"]
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}
