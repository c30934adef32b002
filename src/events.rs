use std::fmt;

/// Lifecycle notifications emitted while a claimed job is processed.
///
/// Delivered to the registry's [`on_event`](crate::HandlerRegistry::on_event)
/// hook together with the job handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    /// The handler is about to run.
    Starting,
    /// The claim completed. Also emitted after [`Rescheduled`](Self::Rescheduled).
    Finished,
    /// The job was put back with a new schedule.
    Rescheduled,
    /// The job failed, terminally or with attempts left.
    Failed,
    /// The job was deleted.
    Destroyed,
}

impl QueueEvent {
    /// Event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Finished => "finished",
            Self::Rescheduled => "rescheduled",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
