// Progress reporting for long-running tasks
//
// Tasks publish progress through a ProgressReporter; observers hold the
// matching watch::Receiver (exposed on TaskHandle).

use tokio::sync::watch;

/// Latest progress of a task.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Progress {
    pub text: String,
    /// `None` while indeterminate, otherwise in `0.0..=1.0`
    pub fraction: Option<f64>,
}

/// Write side of a task's progress channel.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: std::sync::Arc<watch::Sender<Progress>>,
}

impl ProgressReporter {
    pub fn new() -> (Self, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(Progress::default());
        (
            Self {
                tx: std::sync::Arc::new(tx),
            },
            rx,
        )
    }

    /// Reporter nobody listens to.
    pub fn detached() -> Self {
        Self::new().0
    }

    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.tx.send_modify(|p| p.text = text);
    }

    pub fn set_indeterminate(&self) {
        self.tx.send_modify(|p| p.fraction = None);
    }

    pub fn set_fraction(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_modify(|p| p.fraction = Some(fraction));
    }

    /// Report byte progress; indeterminate when the total is unknown.
    pub fn set_bytes(&self, done: u64, total: Option<u64>) {
        match total {
            Some(total) if total > 0 => self.set_fraction(done as f64 / total as f64),
            _ => self.set_indeterminate(),
        }
    }

    pub fn current(&self) -> Progress {
        self.tx.borrow().clone()
    }
}
