#[derive(Debug, Clone)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    TaskStart { total_steps: u64 },
    TaskIncrement,
    TaskFinish,

    StatusUpdate { text: String },

    /// A sampling step finished with the given current score.
    StepCompleted { step: u64, score: f64, accepted: bool },
    /// A new best score was found.
    Improvement { step: u64, score: f64 },
    ConsistencyCheck { step: u64, difference: f64 },

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn reporter_without_callback_ignores_events() {
        ProgressReporter::new().report(Progress::Message("ignored".to_string()));
    }

    #[test]
    fn reporter_forwards_events_to_callback() {
        let seen = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            if let Progress::StepCompleted { step, .. } = event {
                seen.lock().unwrap().push(step);
            }
        }));
        for step in 1..=3 {
            reporter.report(Progress::StepCompleted {
                step,
                score: 0.0,
                accepted: true,
            });
        }
        reporter.report(Progress::TaskFinish);
        drop(reporter);
        assert_eq!(seen.into_inner().unwrap(), vec![1, 2, 3]);
    }
}
