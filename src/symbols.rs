use std::fmt;

/// Declared type of a function argument, as far as the formatter cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Int,
    Float,
    Double,
    Char,
    VoidPointer,
    String,
    StringArray,
    Unknown,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
            TypeTag::Char => "char",
            TypeTag::VoidPointer => "void *",
            TypeTag::String => "char *",
            TypeTag::StringArray => "char **",
            TypeTag::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// One argument of a function: its value lives at `frame_base + offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSymbol {
    pub name: String,
    pub type_tag: TypeTag,
    pub offset: i64,
}

impl ArgumentSymbol {
    pub fn new(name: impl Into<String>, type_tag: TypeTag, offset: i64) -> Self {
        Self {
            name: name.into(),
            type_tag,
            offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub start_address: u64,
    /// Arguments in declaration order.
    pub arguments: Vec<ArgumentSymbol>,
}

impl FunctionSymbol {
    pub fn new(name: impl Into<String>, start_address: u64) -> Self {
        Self {
            name: name.into(),
            start_address,
            arguments: Vec::new(),
        }
    }

    pub fn with_argument(mut self, argument: ArgumentSymbol) -> Self {
        self.arguments.push(argument);
        self
    }
}

/// Externally built, read-only table of known functions.
///
/// Entries keep insertion order; start addresses need not be sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    functions: Vec<FunctionSymbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, function: FunctionSymbol) {
        self.functions.push(function);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionSymbol> {
        self.functions.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&FunctionSymbol> {
        self.functions.iter().find(|function| function.name == name)
    }
}

impl FromIterator<FunctionSymbol> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = FunctionSymbol>>(iter: I) -> Self {
        Self {
            functions: iter.into_iter().collect(),
        }
    }
}

impl Extend<FunctionSymbol> for SymbolTable {
    fn extend<I: IntoIterator<Item = FunctionSymbol>>(&mut self, iter: I) {
        self.functions.extend(iter);
    }
}

/// Maps return addresses to the function whose body contains them.
#[derive(Debug, Clone, Copy)]
pub struct SymbolResolver<'a> {
    table: &'a SymbolTable,
    max_function_size: u64,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(table: &'a SymbolTable, max_function_size: u64) -> Self {
        Self {
            table,
            max_function_size,
        }
    }

    /// Picks the closest preceding start address, scanning the whole table.
    ///
    /// Addresses further than `max_function_size` past every candidate stay
    /// unresolved, so gaps with no symbol (shared libraries, stripped code)
    /// are never blamed on an unrelated neighbour. On duplicate start
    /// addresses the first entry wins.
    pub fn resolve(&self, address: u64) -> Option<&'a FunctionSymbol> {
        let mut best: Option<(&'a FunctionSymbol, u64)> = None;

        for function in &self.table.functions {
            let Some(distance) = address.checked_sub(function.start_address) else {
                continue;
            };
            if distance > self.max_function_size {
                continue;
            }
            match best {
                Some((_, best_distance)) if best_distance <= distance => {}
                _ => best = Some((function, distance)),
            }
        }

        best.map(|(function, _)| function)
    }
}
