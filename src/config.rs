/// Process-entry trampoline glibc calls `main` from.
pub const DEFAULT_ROOT_SYMBOL: &str = "__libc_start_main";

pub const DEFAULT_MAX_FUNCTION_SIZE: u64 = 0x10000;
pub const DEFAULT_MAX_FRAMES: usize = 32 * 1024;
pub const DEFAULT_STRING_MAX_DISPLAY_LENGTH: usize = 25;
pub const DEFAULT_STRING_ARRAY_MAX_ENTRIES: usize = 3;

/// Knobs for a single trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Largest plausible function body; return addresses further than this
    /// past every symbol stay unresolved.
    pub max_function_size: u64,
    /// Upper bound on frames visited before the stack is declared corrupt.
    pub max_frames: usize,
    pub string_max_display_length: usize,
    pub string_array_max_entries: usize,
    /// Name of the function at which unwinding stops. Never rendered.
    pub root_symbol: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_function_size: DEFAULT_MAX_FUNCTION_SIZE,
            max_frames: DEFAULT_MAX_FRAMES,
            string_max_display_length: DEFAULT_STRING_MAX_DISPLAY_LENGTH,
            string_array_max_entries: DEFAULT_STRING_ARRAY_MAX_ENTRIES,
            root_symbol: DEFAULT_ROOT_SYMBOL.to_string(),
        }
    }
}

impl TraceConfig {
    pub fn with_root_symbol(mut self, root_symbol: impl Into<String>) -> Self {
        self.root_symbol = root_symbol.into();
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_max_function_size(mut self, max_function_size: u64) -> Self {
        self.max_function_size = max_function_size;
        self
    }

    pub fn with_string_max_display_length(mut self, length: usize) -> Self {
        self.string_max_display_length = length;
        self
    }

    pub fn with_string_array_max_entries(mut self, entries: usize) -> Self {
        self.string_array_max_entries = entries;
        self
    }
}
