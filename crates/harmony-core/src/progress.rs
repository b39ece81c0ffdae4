//! Progress steps of a power-off run.

/// The ordered steps a power-off run moves through.
///
/// A dry run stops after [`ProgressStep::AuthDone`]; a full run continues to
/// [`ProgressStep::Done`].  Host applications render progress as
/// `step.as_u8() / last.as_u8()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgressStep {
    /// Queued by the host application, not yet running.
    Scheduled,
    /// The run has begun.
    Started,
    /// A target address has been resolved (explicit host or discovery).
    Resolved,
    /// The anonymous transport is connected.
    AuthConnected,
    /// Pairing finished and a session token was obtained.
    AuthDone,
    /// The authenticated transport is connected.
    MainConnected,
    /// The power-off command was acknowledged.
    Done,
}

impl ProgressStep {
    /// The final step of a run.
    pub fn last(dry_run: bool) -> Self {
        if dry_run {
            ProgressStep::AuthDone
        } else {
            ProgressStep::Done
        }
    }

    /// Stable numeric form for host applications.  Steps of ten leave room
    /// for finer-grained reporting without renumbering.
    pub fn as_u8(self) -> u8 {
        match self {
            ProgressStep::Scheduled => 0,
            ProgressStep::Started => 10,
            ProgressStep::Resolved => 20,
            ProgressStep::AuthConnected => 30,
            ProgressStep::AuthDone => 40,
            ProgressStep::MainConnected => 50,
            ProgressStep::Done => 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_strictly_ordered() {
        use ProgressStep::*;
        let steps = [
            Scheduled,
            Started,
            Resolved,
            AuthConnected,
            AuthDone,
            MainConnected,
            Done,
        ];
        for pair in steps.windows(2) {
            assert!(pair[0] < pair[1], "{:?} must precede {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_last_step_depends_on_dry_run() {
        assert_eq!(ProgressStep::last(true), ProgressStep::AuthDone);
        assert_eq!(ProgressStep::last(false), ProgressStep::Done);
    }

    #[test]
    fn test_numeric_form_matches_ordering() {
        assert_eq!(ProgressStep::Scheduled.as_u8(), 0);
        assert_eq!(ProgressStep::AuthDone.as_u8(), 40);
        assert_eq!(ProgressStep::Done.as_u8(), 60);
        assert!(ProgressStep::Resolved.as_u8() < ProgressStep::MainConnected.as_u8());
    }
}
