//! Type-directed rendering of function signatures and argument values.
//!
//! Values are read through a [`MemoryProbe`]. An unreadable argument never
//! aborts the trace: strings and string arrays fall back to the raw pointer
//! value, scalars render as `<unreadable>`.

use crate::config::TraceConfig;
use crate::memory::{MemoryProbe, offset_address};
use crate::symbols::{ArgumentSymbol, FunctionSymbol, TypeTag};

const UNREADABLE: &str = "<unreadable>";

pub struct ArgumentFormatter<'m, M: ?Sized> {
    memory: &'m M,
    pointer_size: usize,
    string_max_display_length: usize,
    string_array_max_entries: usize,
}

impl<'m, M: MemoryProbe + ?Sized> ArgumentFormatter<'m, M> {
    pub fn new(memory: &'m M, pointer_size: usize, config: &TraceConfig) -> Self {
        Self {
            memory,
            pointer_size,
            string_max_display_length: config.string_max_display_length,
            string_array_max_entries: config.string_array_max_entries,
        }
    }

    /// `Function name(arg, ...), in` plus a newline; `(void)` when there are
    /// no arguments.
    pub fn format_function(&self, symbol: &FunctionSymbol, frame_base: u64) -> String {
        let arguments = if symbol.arguments.is_empty() {
            "void".to_string()
        } else {
            symbol
                .arguments
                .iter()
                .map(|argument| self.format_argument(argument, frame_base))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!("Function {}({arguments}), in\n", symbol.name)
    }

    pub fn format_argument(&self, argument: &ArgumentSymbol, frame_base: u64) -> String {
        let declaration = declaration(argument.type_tag, &argument.name);
        let Ok(address) = offset_address(frame_base, argument.offset) else {
            return format!("{declaration}={UNREADABLE}");
        };

        let value = match argument.type_tag {
            TypeTag::Int => self.memory.read_i32(address).map(|v| v.to_string()),
            TypeTag::Float => self.memory.read_f32(address).map(|v| fixed(f64::from(v))),
            TypeTag::Double => self.memory.read_f64(address).map(fixed),
            TypeTag::Char => self.memory.read_u8(address).map(|c| format!("'{}'", escape_char(c))),
            TypeTag::VoidPointer => self
                .memory
                .read_word(address, self.pointer_size)
                .map(|p| format!("0v{p:x}")),
            TypeTag::String => self
                .memory
                .read_word(address, self.pointer_size)
                .map(|p| self.render_string(p)),
            TypeTag::StringArray => self
                .memory
                .read_word(address, self.pointer_size)
                .map(|p| self.render_string_array(p)),
            TypeTag::Unknown => Ok(format!("{address:#x}")),
        };

        match value {
            Ok(value) => format!("{declaration}={value}"),
            Err(err) => {
                log::trace!("argument {} at {address:#x} unreadable: {err}", argument.name);
                format!("{declaration}={UNREADABLE}")
            }
        }
    }

    /// Quoted content of the NUL-terminated string at `pointer`, cut after
    /// the display limit; the bare pointer if any byte up to the terminator
    /// is unreadable or unprintable.
    pub fn render_string(&self, pointer: u64) -> String {
        let mut content = String::new();
        let mut length = 0usize;
        let mut address = pointer;

        loop {
            let byte = match self.memory.read_u8(address) {
                Ok(byte) => byte,
                Err(_) => return format!("{pointer:#x}"),
            };
            if byte == 0 {
                break;
            }
            if !is_printable(byte) {
                return format!("{pointer:#x}");
            }
            if length < self.string_max_display_length {
                content.push(char::from(byte));
            }
            length += 1;
            address = match address.checked_add(1) {
                Some(next) => next,
                None => return format!("{pointer:#x}"),
            };
        }

        if length > self.string_max_display_length {
            format!("\"{content}...\"")
        } else {
            format!("\"{content}\"")
        }
    }

    /// `{"a", "b", "c", ...}` for the NULL-terminated pointer array at
    /// `pointer`; the bare pointer when the array itself is unreadable.
    pub fn render_string_array(&self, pointer: u64) -> String {
        let step = self.pointer_size as u64;
        let mut entries = Vec::new();
        let mut slot = pointer;

        while entries.len() < self.string_array_max_entries {
            let entry = match self.memory.read_word(slot, self.pointer_size) {
                Ok(entry) => entry,
                Err(_) => return format!("{pointer:#x}"),
            };
            if entry == 0 {
                break;
            }
            entries.push(self.render_string(entry));
            slot = match slot.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }

        let truncated = entries.len() == self.string_array_max_entries
            && matches!(self.memory.read_word(slot, self.pointer_size), Ok(entry) if entry != 0);
        if truncated {
            entries.push("...".to_string());
        }

        format!("{{{}}}", entries.join(", "))
    }
}

fn declaration(type_tag: TypeTag, name: &str) -> String {
    match type_tag {
        TypeTag::VoidPointer | TypeTag::String | TypeTag::StringArray => format!("{type_tag}{name}"),
        _ => format!("{type_tag} {name}"),
    }
}

fn is_printable(byte: u8) -> bool {
    byte.is_ascii_graphic() || byte == b' '
}

fn escape_char(byte: u8) -> String {
    if is_printable(byte) {
        char::from(byte).to_string()
    } else {
        format!("\\{byte:o}")
    }
}

/// `printf("%f")`: six fractional digits, C spellings for the non-finite.
fn fixed(value: f64) -> String {
    if value.is_nan() {
        if value.is_sign_negative() { "-nan".to_string() } else { "nan".to_string() }
    } else {
        format!("{value:.6}")
    }
}
