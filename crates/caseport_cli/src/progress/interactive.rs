use std::sync::Mutex;
use std::time::Duration;

use caseport::migrate::MigrationProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Consolidated progress state to avoid multiple mutex locks.
#[derive(Default)]
struct ProgressState {
    /// One bar across all projects.
    project_bar: Option<ProgressBar>,
    /// Bar for the stage currently running.
    stage_bar: Option<ProgressBar>,
    /// Users mapped to the default user.
    fallbacks: usize,
}

/// Interactive progress reporter using indicatif.
///
/// Shows an overall project bar and one bar per stage run. Finished stage
/// bars stay on screen with their created/skipped/failed counts.
pub struct InteractiveReporter {
    multi: MultiProgress,
    state: Mutex<ProgressState>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Reporter that draws nothing.
    #[cfg(test)]
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden()),
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Position and length of the current stage bar.
    #[cfg(test)]
    pub fn stage_position(&self) -> Option<(u64, Option<u64>)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stage_bar.as_ref().map(|bar| (bar.position(), bar.length()))
    }

    pub fn handle(&self, event: MigrationProgress) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        match event {
            MigrationProgress::ProjectStarted {
                index,
                total,
                code,
                name,
            } => {
                let bar = state.project_bar.get_or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new(total as u64));
                    bar.set_style(Self::bar_style());
                    bar.set_prefix(format!("{:14}", "projects"));
                    bar
                });
                bar.set_position(index.saturating_sub(1) as u64);
                bar.set_message(format!("{code} {name}"));
            }

            MigrationProgress::ProjectComplete { index, .. } => {
                if let Some(ref bar) = state.project_bar {
                    bar.set_position(index as u64);
                }
            }

            MigrationProgress::StageStarted { stage, project } => {
                if let Some(ref old) = state.stage_bar
                    && !old.is_finished()
                {
                    old.finish();
                }
                let bar = match state.project_bar {
                    Some(ref projects) => self.multi.insert_before(projects, ProgressBar::new_spinner()),
                    None => self.multi.add(ProgressBar::new_spinner()),
                };
                bar.set_style(Self::counter_style());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar.set_prefix(format!("{:14}", stage.as_str()));
                bar.set_message(project.unwrap_or_default());
                state.stage_bar = Some(bar);
            }

            MigrationProgress::FetchedPage { kind, total_so_far, .. } => {
                if let Some(ref bar) = state.stage_bar {
                    bar.set_message(format!("fetched {total_so_far} {kind}"));
                }
            }

            MigrationProgress::EntitiesDiscovered { total, project, .. } => {
                if let Some(ref bar) = state.stage_bar {
                    bar.disable_steady_tick();
                    bar.set_length(total as u64);
                    bar.set_style(Self::bar_style());
                    bar.set_message(project.unwrap_or_default());
                }
            }

            MigrationProgress::EntityCreated { .. } | MigrationProgress::EntitySkipped { .. } => {
                if let Some(ref bar) = state.stage_bar {
                    bar.inc(1);
                }
            }

            MigrationProgress::EntityFailed {
                kind,
                source_id,
                error,
                ..
            } => {
                if let Some(ref bar) = state.stage_bar {
                    bar.inc(1);
                }
                self.multi
                    .println(format!("  failed {kind} {source_id}: {error}"))
                    .ok();
            }

            MigrationProgress::UserFallback { .. } => {
                state.fallbacks += 1;
            }

            MigrationProgress::RateLimitBackoff { retry_after_ms, attempt, .. } => {
                if let Some(ref bar) = state.stage_bar {
                    bar.set_message(format!("rate limited, retry {attempt} in {retry_after_ms}ms"));
                }
            }

            MigrationProgress::StageComplete {
                created,
                skipped,
                failed,
                ..
            } => {
                if let Some(ref bar) = state.stage_bar {
                    bar.finish_with_message(format!(
                        "{created} created, {skipped} skipped, {failed} failed"
                    ));
                }
            }

            MigrationProgress::StageSkipped { stage, project } => {
                let scope = project.map(|code| format!(" for {code}")).unwrap_or_default();
                self.multi.println(format!("  {stage} disabled{scope}")).ok();
            }

            MigrationProgress::Warning { message } => {
                self.multi.println(format!("  warning: {message}")).ok();
            }

            MigrationProgress::MigrationComplete { projects, .. } => {
                if let Some(ref bar) = state.project_bar {
                    bar.finish_with_message(format!("{projects} projects migrated"));
                }
                if state.fallbacks > 0 {
                    self.multi
                        .println(format!("  {} users mapped to the default user", state.fallbacks))
                        .ok();
                }
            }

            _ => {}
        }
    }

    pub fn finish(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for bar in [&state.stage_bar, &state.project_bar].into_iter().flatten() {
            if !bar.is_finished() {
                bar.finish();
            }
        }
    }

    fn counter_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.green} {pos:>4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {pos:>4}/{len:4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }
}

impl Default for InteractiveReporter {
    fn default() -> Self {
        Self::new()
    }
}
