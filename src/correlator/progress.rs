use std::sync::{Arc, Mutex};

use crate::cache::fingerprint::render_value;
use crate::error::LockResultExt;
use crate::protocol::ProgressUpdate;

/// Width of the rendered progress bar.
pub const PROGRESS_BAR_WIDTH: usize = 50;

/// Receives progress notifications from the receive loop.
///
/// Called on the receive task: implementations must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate, line: &str);
}

/// Default observer: one `info` log line per distinct update.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_progress(&self, _update: &ProgressUpdate, line: &str) {
        log::info!(target: "finx_socket::progress", "{}", line);
    }
}

/// Renders updates and forwards each distinct line to an observer.
pub struct ProgressReporter {
    observer: Arc<dyn ProgressObserver>,
    last_line: Mutex<String>,
}

impl ProgressReporter {
    pub fn new(observer: Arc<dyn ProgressObserver>) -> Self {
        Self {
            observer,
            last_line: Mutex::new(String::new()),
        }
    }

    /// Report an update unless it renders the same as the previous one.
    pub fn report(&self, update: &ProgressUpdate) {
        let line = render(update);
        {
            let mut last = self.last_line.lock().recover_poison("ProgressReporter::report");
            if *last == line {
                return;
            }
            last.clone_from(&line);
        }
        self.observer.on_progress(update, &line);
    }
}

/// Render an update as a single display line.
pub fn render(update: &ProgressUpdate) -> String {
    match update {
        ProgressUpdate::Task {
            task_name,
            completed,
            total_tasks,
            progress,
        } => format!(
            "{} => {} ({:.5} %)",
            task_name,
            bar(*completed, *total_tasks),
            progress
        ),
        ProgressUpdate::StartingMonitor => "Starting monitor ... ".to_string(),
        ProgressUpdate::Status(value) => render_value(value),
    }
}

fn bar(completed: u64, total_tasks: u64) -> String {
    let filled = if total_tasks == 0 {
        0
    } else {
        let completed = u128::from(completed.min(total_tasks));
        (PROGRESS_BAR_WIDTH as u128 * completed / u128::from(total_tasks)) as usize
    };
    format!(
        "{}{}",
        "#".repeat(filled),
        "-".repeat(PROGRESS_BAR_WIDTH - filled)
    )
}
