//! Running transcript for transcription endpoints
//!
//! Results arrive as interim hypotheses that are later settled by a final
//! result for the same stretch of audio.
//!
//! - **Final**: appended to the settled text, clears the interim
//! - **Interim**: replaces the previous interim (never appended)

use super::protocol::Transcript;

/// Builds display text from a sequence of [`Transcript`] results.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    /// Settled text from final results
    settled: String,
    /// Latest interim hypothesis
    interim: String,
    final_count: u64,
    interim_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one result. Returns the current display text.
    pub fn process(&mut self, result: &Transcript) -> String {
        let text = result.text.trim();

        if result.is_final {
            if !text.is_empty() {
                if !self.settled.is_empty() {
                    self.settled.push(' ');
                }
                self.settled.push_str(text);
            }
            self.interim.clear();
            self.final_count += 1;

            log::debug!(
                "TranscriptAggregator: {} finals, {} chars settled",
                self.final_count,
                self.settled.len()
            );
        } else {
            self.interim.clear();
            self.interim.push_str(text);
            self.interim_count += 1;
        }

        self.current_text()
    }

    /// Settled text followed by the current interim, if any
    pub fn current_text(&self) -> String {
        match (self.settled.is_empty(), self.interim.is_empty()) {
            (_, true) => self.settled.clone(),
            (true, false) => self.interim.clone(),
            (false, false) => format!("{} {}", self.settled, self.interim),
        }
    }

    pub fn settled_text(&self) -> &str {
        &self.settled
    }

    pub fn interim_text(&self) -> &str {
        &self.interim
    }

    pub fn has_text(&self) -> bool {
        !self.settled.is_empty() || !self.interim.is_empty()
    }

    pub fn final_count(&self) -> u64 {
        self.final_count
    }

    pub fn interim_count(&self) -> u64 {
        self.interim_count
    }

    pub fn reset(&mut self) {
        self.settled.clear();
        self.interim.clear();
        self.final_count = 0;
        self.interim_count = 0;
    }
}
