use std::fmt;
use std::io;

/// The rendered report of one trace. Owned by a single invocation and grown
/// as frames are appended; nothing is ever truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceOutput {
    text: String,
    frames: usize,
}

impl TraceOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one complete frame line.
    pub fn push_frame(&mut self, line: &str) {
        self.text.push_str(line);
        self.frames += 1;
    }

    /// Appends a fragment that is not a frame of its own.
    pub fn push_str(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn write_to<W: io::Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(self.text.as_bytes())?;
        sink.flush()
    }
}

impl fmt::Write for TraceOutput {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.text.push_str(s);
        Ok(())
    }
}

impl fmt::Display for TraceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
