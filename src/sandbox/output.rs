//! Captured output with a hard character budget

/// Accumulates `print` output for one execution
///
/// Only the first `max_chars` characters are kept, but every character is
/// counted so the truncation marker can report the original length.
#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    kept_chars: usize,
    total_chars: usize,
    max_chars: usize,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            kept_chars: 0,
            total_chars: 0,
            max_chars,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        let chars = chunk.chars().count();
        self.total_chars += chars;

        let room = self.max_chars - self.kept_chars;
        if chars <= room {
            self.text.push_str(chunk);
            self.kept_chars += chars;
        } else if room > 0 {
            let cut = chunk
                .char_indices()
                .nth(room)
                .map(|(i, _)| i)
                .unwrap_or(chunk.len());
            self.text.push_str(&chunk[..cut]);
            self.kept_chars += room;
        }
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.kept_chars = 0;
        self.total_chars = 0;
    }

    /// Take the captured text, appending a marker when anything was dropped
    pub fn take(&mut self) -> CapturedOutput {
        let truncated = self.total_chars > self.max_chars;
        let mut text = std::mem::take(&mut self.text);
        if truncated {
            text.push_str(&truncation_marker(self.max_chars, self.total_chars));
        }
        let captured = CapturedOutput {
            text,
            truncated,
            total_chars: self.total_chars,
        };
        self.clear();
        captured
    }
}

/// Final output of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    /// Length of the output before truncation
    pub total_chars: usize,
}

pub fn truncation_marker(kept: usize, total: usize) -> String {
    format!(
        "\n... [output truncated: showing {} of {} characters]",
        kept, total
    )
}
