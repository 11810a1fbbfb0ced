use tokio::sync::mpsc;

/// Percent-complete reporting for long running engine operations.
///
/// Reports are best effort: a full or closed channel drops the update rather
/// than stalling the operation. Nested phases are expressed with
/// [`ProgressReporter::section`], which maps `0..=100` of the phase onto a
/// sub-range of the parent.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::Sender<u8>>,
    start: u8,
    end: u8,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(sender: mpsc::Sender<u8>) -> Self {
        Self {
            sender: Some(sender),
            start: 0,
            end: 100,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Report `percent` (clamped to 100) of this reporter's range.
    pub fn report(&self, percent: u8) {
        let Some(sender) = &self.sender else {
            return;
        };
        let _ = sender.try_send(self.scale(percent));
    }

    /// A reporter covering `start..=end` percent of this one.
    #[must_use]
    pub fn section(&self, start: u8, end: u8) -> Self {
        Self {
            sender: self.sender.clone(),
            start: self.scale(start),
            end: self.scale(end.max(start)),
        }
    }

    fn scale(&self, percent: u8) -> u8 {
        let percent = u16::from(percent.min(100));
        let span = u16::from(self.end.saturating_sub(self.start));
        let scaled = u16::from(self.start) + span * percent / 100;
        u8::try_from(scaled).unwrap_or(100)
    }
}
