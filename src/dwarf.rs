//! Builds a [`SymbolTable`] from the DWARF of an ELF executable.
//!
//! Only what the walker needs is extracted: every subprogram with a low PC,
//! and those of its formal parameters whose location is a fixed offset from
//! the frame-pointer register.

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use gimli::{AttributeValue, EndianSlice, Operation, Register, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

use crate::error::LoadError;
use crate::symbols::{ArgumentSymbol, FunctionSymbol, SymbolTable, TypeTag};

type Reader<'data> = EndianSlice<'data, RunTimeEndian>;

/// Qualifier and typedef chains longer than this are treated as unknown.
const MAX_TYPE_CHAIN: usize = 16;

/// How the frame-pointer register relates to a subprogram's frame base.
#[derive(Debug, Clone, Copy)]
struct FrameLayout {
    frame_register: Register,
    /// Distance from the frame pointer to the canonical frame address.
    cfa_offset: i64,
}

impl FrameLayout {
    fn for_architecture(architecture: object::Architecture) -> Option<Self> {
        let (frame_register, cfa_offset) = match architecture {
            object::Architecture::X86_64 => (gimli::X86_64::RBP, 16),
            object::Architecture::I386 => (gimli::X86::EBP, 8),
            object::Architecture::Aarch64 => (gimli::AArch64::X29, 16),
            // s0 doubles as the frame pointer
            object::Architecture::Riscv64 => (Register(8), 0),
            _ => return None,
        };
        Some(Self {
            frame_register,
            cfa_offset,
        })
    }
}

pub fn load_symbol_table_from_path(path: impl AsRef<Path>, bias: u64) -> Result<SymbolTable, LoadError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_symbol_table(&data, bias)
}

/// Reads every described function of the object in `data`, shifting start
/// addresses by `bias` (the load bias of a position-independent executable).
pub fn load_symbol_table(data: &[u8], bias: u64) -> Result<SymbolTable, LoadError> {
    let file = object::File::parse(data)?;
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let layout = FrameLayout::for_architecture(file.architecture());
    if layout.is_none() {
        log::warn!("no frame layout for {:?}; arguments will be omitted", file.architecture());
    }

    let sections = gimli::DwarfSections::load(|id| load_section(&file, id))?;
    let dwarf = sections.borrow(|section| EndianSlice::new(Cow::as_ref(section), endian));
    collect_symbols(&dwarf, layout, bias)
}

fn collect_symbols(
    dwarf: &gimli::Dwarf<Reader<'_>>,
    layout: Option<FrameLayout>,
    bias: u64,
) -> Result<SymbolTable, LoadError> {
    let mut table = SymbolTable::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let context = UnitContext {
            dwarf,
            unit: &unit,
            bias,
            layout,
        };
        let mut tree = unit.entries_tree(None)?;
        context.collect(tree.root()?, &mut table)?;
    }

    log::debug!("loaded {} functions from DWARF", table.len());
    Ok(table)
}

/// Adds an argument-less entry named `name` from the ELF symbol table when
/// DWARF did not describe it, so a root living in hand-written assembly (or
/// in code built without debug info) can still end the walk.
pub fn with_root_from_symtab(
    mut table: SymbolTable,
    data: &[u8],
    bias: u64,
    name: &str,
) -> Result<SymbolTable, LoadError> {
    if table.find_by_name(name).is_some() {
        return Ok(table);
    }
    let file = object::File::parse(data)?;
    let found = file
        .symbols()
        .find(|symbol| symbol.kind() == SymbolKind::Text && symbol.name().is_ok_and(|symbol_name| symbol_name == name));
    match found {
        Some(symbol) => table.push(FunctionSymbol::new(name, symbol.address().wrapping_add(bias))),
        None => log::warn!("root symbol {name} not found in the executable"),
    }
    Ok(table)
}

fn load_section<'data>(file: &object::File<'data>, id: gimli::SectionId) -> Result<Cow<'data, [u8]>, object::Error> {
    match file.section_by_name(id.name()) {
        Some(section) => section.uncompressed_data(),
        None => Ok(Cow::Borrowed(&[][..])),
    }
}

struct UnitContext<'a, 'data> {
    dwarf: &'a gimli::Dwarf<Reader<'data>>,
    unit: &'a gimli::Unit<Reader<'data>>,
    bias: u64,
    layout: Option<FrameLayout>,
}

impl<'data> UnitContext<'_, 'data> {
    fn collect(
        &self,
        node: gimli::EntriesTreeNode<'_, '_, '_, Reader<'data>>,
        table: &mut SymbolTable,
    ) -> gimli::Result<()> {
        let mut function = if node.entry().tag() == gimli::DW_TAG_subprogram {
            self.function(node.entry())?
        } else {
            None
        };

        let mut children = node.children();
        while let Some(child) = children.next()? {
            if child.entry().tag() == gimli::DW_TAG_formal_parameter {
                if let Some((symbol, frame_adjust)) = function.as_mut() {
                    if let Some(argument) = self.argument(child.entry(), *frame_adjust)? {
                        symbol.arguments.push(argument);
                    } else {
                        log::debug!("skipping an argument of {} with no frame-relative location", symbol.name);
                    }
                }
                continue;
            }
            self.collect(child, table)?;
        }

        if let Some((symbol, _)) = function {
            table.push(symbol);
        }
        Ok(())
    }

    /// A subprogram with a name and code, paired with the offset that turns
    /// its `DW_OP_fbreg` operands into frame-pointer offsets.
    fn function(
        &self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Reader<'data>>,
    ) -> gimli::Result<Option<(FunctionSymbol, Option<i64>)>> {
        let Some(name) = self.name(entry)? else {
            return Ok(None);
        };
        let Some(low_pc) = entry.attr_value(gimli::DW_AT_low_pc)? else {
            return Ok(None);
        };
        let Some(low_pc) = self.dwarf.attr_address(self.unit, low_pc)? else {
            return Ok(None);
        };
        if low_pc == 0 {
            return Ok(None);
        }

        let frame_adjust = entry
            .attr_value(gimli::DW_AT_frame_base)?
            .and_then(|value| self.frame_base_adjust(value));

        Ok(Some((FunctionSymbol::new(name, low_pc.wrapping_add(self.bias)), frame_adjust)))
    }

    fn argument(
        &self,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Reader<'data>>,
        frame_adjust: Option<i64>,
    ) -> gimli::Result<Option<ArgumentSymbol>> {
        let Some(layout) = self.layout else {
            return Ok(None);
        };
        let Some(AttributeValue::Exprloc(expression)) = entry.attr_value(gimli::DW_AT_location)? else {
            return Ok(None);
        };
        let mut bytes = expression.0;
        let Ok(operation) = Operation::parse(&mut bytes, self.unit.encoding()) else {
            return Ok(None);
        };
        let offset = match operation {
            Operation::FrameOffset { offset } => match frame_adjust {
                Some(adjust) => offset + adjust,
                None => return Ok(None),
            },
            Operation::RegisterOffset { register, offset, .. } if register == layout.frame_register => offset,
            _ => return Ok(None),
        };

        let name = self.name(entry)?.unwrap_or_default();
        let type_tag = self.type_tag(entry.attr_value(gimli::DW_AT_type)?)?;
        Ok(Some(ArgumentSymbol::new(name, type_tag, offset)))
    }

    fn frame_base_adjust(&self, value: AttributeValue<Reader<'data>>) -> Option<i64> {
        let layout = self.layout?;
        let AttributeValue::Exprloc(expression) = value else {
            return None;
        };
        let mut bytes = expression.0;
        match Operation::parse(&mut bytes, self.unit.encoding()).ok()? {
            Operation::Register { register } if register == layout.frame_register => Some(0),
            Operation::RegisterOffset { register, offset, .. } if register == layout.frame_register => Some(offset),
            Operation::CallFrameCFA => Some(layout.cfa_offset),
            _ => None,
        }
    }

    fn name(&self, entry: &gimli::DebuggingInformationEntry<'_, '_, Reader<'data>>) -> gimli::Result<Option<String>> {
        match entry.attr_value(gimli::DW_AT_name)? {
            Some(value) => {
                let name = self.dwarf.attr_string(self.unit, value)?;
                Ok(Some(name.to_string_lossy().into_owned()))
            }
            None => Ok(None),
        }
    }

    fn type_tag(&self, mut target: Option<AttributeValue<Reader<'data>>>) -> gimli::Result<TypeTag> {
        let mut pointer_depth = 0usize;

        for _ in 0..MAX_TYPE_CHAIN {
            let Some(AttributeValue::UnitRef(offset)) = target else {
                // A pointer with no pointee type is `void *`.
                return Ok(if pointer_depth > 0 { TypeTag::VoidPointer } else { TypeTag::Unknown });
            };
            let entry = self.unit.entry(offset)?;
            match entry.tag() {
                gimli::DW_TAG_typedef
                | gimli::DW_TAG_const_type
                | gimli::DW_TAG_volatile_type
                | gimli::DW_TAG_restrict_type => {}
                gimli::DW_TAG_pointer_type => pointer_depth += 1,
                gimli::DW_TAG_base_type => {
                    let name = self.name(&entry)?.unwrap_or_default();
                    return Ok(classify_base_type(&name, pointer_depth));
                }
                _ => {
                    return Ok(if pointer_depth > 0 { TypeTag::VoidPointer } else { TypeTag::Unknown });
                }
            }
            target = entry.attr_value(gimli::DW_AT_type)?;
        }

        Ok(TypeTag::Unknown)
    }
}

fn classify_base_type(name: &str, pointer_depth: usize) -> TypeTag {
    let is_char = matches!(name, "char" | "signed char" | "unsigned char");
    match pointer_depth {
        0 => match name {
            "int" => TypeTag::Int,
            "float" => TypeTag::Float,
            "double" => TypeTag::Double,
            _ if is_char => TypeTag::Char,
            _ => TypeTag::Unknown,
        },
        1 if is_char => TypeTag::String,
        2 if is_char => TypeTag::StringArray,
        _ => TypeTag::VoidPointer,
    }
}

#[cfg(test)]
mod tests {
    use gimli::write::{self, Address, DwarfUnit, EndianVec, Expression, Sections, UnitEntryId};

    use super::*;

    const BIAS: u64 = 0x5555_0000_0000;

    /// Builds a compilation unit the way a C compiler describes
    /// `-O0 -fno-omit-frame-pointer` code.
    struct UnitBuilder {
        dwarf: DwarfUnit,
    }

    impl UnitBuilder {
        fn new() -> Self {
            let encoding = gimli::Encoding {
                format: gimli::Format::Dwarf32,
                version: 4,
                address_size: 8,
            };
            Self {
                dwarf: DwarfUnit::new(encoding),
            }
        }

        fn entry(&mut self, parent: UnitEntryId, tag: gimli::DwTag, name: Option<&str>) -> UnitEntryId {
            let id = self.dwarf.unit.add(parent, tag);
            if let Some(name) = name {
                self.dwarf
                    .unit
                    .get_mut(id)
                    .set(gimli::DW_AT_name, write::AttributeValue::String(name.as_bytes().to_vec()));
            }
            id
        }

        fn base_type(&mut self, name: &str) -> UnitEntryId {
            let root = self.dwarf.unit.root();
            self.entry(root, gimli::DW_TAG_base_type, Some(name))
        }

        fn pointer_to(&mut self, target: Option<UnitEntryId>) -> UnitEntryId {
            let root = self.dwarf.unit.root();
            let id = self.entry(root, gimli::DW_TAG_pointer_type, None);
            if let Some(target) = target {
                self.dwarf
                    .unit
                    .get_mut(id)
                    .set(gimli::DW_AT_type, write::AttributeValue::UnitRef(target));
            }
            id
        }

        fn subprogram(&mut self, name: &str, low_pc: Option<u64>, frame_base: Expression) -> UnitEntryId {
            let root = self.dwarf.unit.root();
            let id = self.entry(root, gimli::DW_TAG_subprogram, Some(name));
            let entry = self.dwarf.unit.get_mut(id);
            if let Some(low_pc) = low_pc {
                entry.set(
                    gimli::DW_AT_low_pc,
                    write::AttributeValue::Address(Address::Constant(low_pc)),
                );
            }
            entry.set(gimli::DW_AT_frame_base, write::AttributeValue::Exprloc(frame_base));
            id
        }

        fn parameter(&mut self, function: UnitEntryId, name: &str, type_id: UnitEntryId, location: Expression) {
            let id = self.entry(function, gimli::DW_TAG_formal_parameter, Some(name));
            let entry = self.dwarf.unit.get_mut(id);
            entry.set(gimli::DW_AT_type, write::AttributeValue::UnitRef(type_id));
            entry.set(gimli::DW_AT_location, write::AttributeValue::Exprloc(location));
        }

        fn load(mut self, architecture: object::Architecture) -> SymbolTable {
            let mut sections = Sections::new(EndianVec::new(RunTimeEndian::Little));
            self.dwarf.write(&mut sections).unwrap();
            let dwarf = gimli::Dwarf::load(|id| -> gimli::Result<_> {
                let data = sections.get(id).map_or(&[][..], |section| section.slice());
                Ok(EndianSlice::new(data, RunTimeEndian::Little))
            })
            .unwrap();
            collect_symbols(&dwarf, FrameLayout::for_architecture(architecture), BIAS).unwrap()
        }
    }

    fn expression(build: impl FnOnce(&mut Expression)) -> Expression {
        let mut expression = Expression::new();
        build(&mut expression);
        expression
    }

    fn fbreg(offset: i64) -> Expression {
        expression(|e| e.op_fbreg(offset))
    }

    fn call_frame_cfa() -> Expression {
        expression(|e| e.op(gimli::DW_OP_call_frame_cfa))
    }

    fn signature(table: &SymbolTable, name: &str) -> Vec<(String, TypeTag, i64)> {
        table
            .find_by_name(name)
            .unwrap()
            .arguments
            .iter()
            .map(|argument| (argument.name.clone(), argument.type_tag, argument.offset))
            .collect()
    }

    fn owned(expected: &[(&str, TypeTag, i64)]) -> Vec<(String, TypeTag, i64)> {
        expected
            .iter()
            .map(|(name, type_tag, offset)| (name.to_string(), *type_tag, *offset))
            .collect()
    }

    #[test]
    fn cfa_frame_base_is_rebased_onto_the_frame_pointer() {
        let mut unit = UnitBuilder::new();
        let int = unit.base_type("int");
        let char_type = unit.base_type("char");
        let double = unit.base_type("double");
        let string = unit.pointer_to(Some(char_type));
        let string_array = unit.pointer_to(Some(string));
        let void_pointer = unit.pointer_to(None);

        let foo = unit.subprogram("foo", Some(0x1139), call_frame_cfa());
        unit.parameter(foo, "x", int, fbreg(-20));
        unit.parameter(foo, "s", string, fbreg(-32));
        unit.parameter(foo, "argv", string_array, fbreg(-40));
        unit.parameter(foo, "d", double, fbreg(-48));
        unit.parameter(foo, "c", char_type, fbreg(-24));
        unit.parameter(foo, "p", void_pointer, fbreg(-56));

        let table = unit.load(object::Architecture::X86_64);

        assert_eq!(table.find_by_name("foo").unwrap().start_address, 0x1139 + BIAS);
        assert_eq!(
            signature(&table, "foo"),
            owned(&[
                ("x", TypeTag::Int, -4),
                ("s", TypeTag::String, -16),
                ("argv", TypeTag::StringArray, -24),
                ("d", TypeTag::Double, -32),
                ("c", TypeTag::Char, -8),
                ("p", TypeTag::VoidPointer, -40),
            ])
        );
    }

    #[test]
    fn cfa_distance_follows_the_architecture() {
        let mut unit = UnitBuilder::new();
        let int = unit.base_type("int");
        let foo = unit.subprogram("foo", Some(0x1000), call_frame_cfa());
        unit.parameter(foo, "x", int, fbreg(4));

        assert_eq!(signature(&unit.load(object::Architecture::I386), "foo"), owned(&[("x", TypeTag::Int, 12)]));
    }

    #[test]
    fn frame_pointer_frame_base_and_breg_locations() {
        let mut unit = UnitBuilder::new();
        let int = unit.base_type("int");
        let float = unit.base_type("float");

        let bar = unit.subprogram("bar", Some(0x1200), expression(|e| e.op_reg(gimli::X86_64::RBP)));
        unit.parameter(bar, "n", int, fbreg(-12));
        unit.parameter(bar, "f", float, expression(|e| e.op_breg(gimli::X86_64::RBP, -20)));
        unit.parameter(bar, "spilled", int, expression(|e| e.op_breg(gimli::X86_64::RSP, 8)));

        let qux = unit.subprogram("qux", Some(0x1300), expression(|e| e.op_breg(gimli::X86_64::RBP, 16)));
        unit.parameter(qux, "y", int, fbreg(-36));

        let table = unit.load(object::Architecture::X86_64);

        assert_eq!(
            signature(&table, "bar"),
            owned(&[("n", TypeTag::Int, -12), ("f", TypeTag::Float, -20)])
        );
        assert_eq!(signature(&table, "qux"), owned(&[("y", TypeTag::Int, -20)]));
    }

    #[test]
    fn stack_pointer_frame_base_drops_arguments_but_keeps_the_function() {
        let mut unit = UnitBuilder::new();
        let int = unit.base_type("int");
        let rust_like = unit.subprogram("rust_like", Some(0x1400), expression(|e| e.op_reg(gimli::X86_64::RSP)));
        unit.parameter(rust_like, "x", int, fbreg(8));

        let table = unit.load(object::Architecture::X86_64);

        assert!(signature(&table, "rust_like").is_empty());
    }

    #[test]
    fn declarations_without_code_are_skipped() {
        let mut unit = UnitBuilder::new();
        unit.subprogram("extern_decl", None, call_frame_cfa());
        unit.subprogram("defined", Some(0x1500), call_frame_cfa());

        let table = unit.load(object::Architecture::X86_64);

        assert!(table.find_by_name("extern_decl").is_none());
        assert!(table.find_by_name("defined").is_some());
    }

    #[test]
    fn unknown_architecture_keeps_functions_without_arguments() {
        let mut unit = UnitBuilder::new();
        let int = unit.base_type("int");
        let foo = unit.subprogram("foo", Some(0x1000), call_frame_cfa());
        unit.parameter(foo, "x", int, fbreg(-20));

        let table = unit.load(object::Architecture::Mips);

        assert!(signature(&table, "foo").is_empty());
    }

    #[test]
    fn classifies_c_base_types() {
        assert_eq!(classify_base_type("int", 0), TypeTag::Int);
        assert_eq!(classify_base_type("float", 0), TypeTag::Float);
        assert_eq!(classify_base_type("double", 0), TypeTag::Double);
        assert_eq!(classify_base_type("unsigned char", 0), TypeTag::Char);
        assert_eq!(classify_base_type("long int", 0), TypeTag::Unknown);
    }

    #[test]
    fn classifies_pointers_by_depth() {
        assert_eq!(classify_base_type("char", 1), TypeTag::String);
        assert_eq!(classify_base_type("char", 2), TypeTag::StringArray);
        assert_eq!(classify_base_type("char", 3), TypeTag::VoidPointer);
        assert_eq!(classify_base_type("int", 1), TypeTag::VoidPointer);
    }

    #[test]
    fn frame_layouts_match_calling_conventions() {
        let x86_64 = FrameLayout::for_architecture(object::Architecture::X86_64).unwrap();
        assert_eq!(x86_64.frame_register, gimli::X86_64::RBP);
        assert_eq!(x86_64.cfa_offset, 16);

        let riscv = FrameLayout::for_architecture(object::Architecture::Riscv64).unwrap();
        assert_eq!(riscv.cfa_offset, 0);

        assert!(FrameLayout::for_architecture(object::Architecture::Mips).is_none());
    }

    #[test]
    fn rejects_non_object_data() {
        assert!(matches!(load_symbol_table(b"not an elf", 0), Err(LoadError::Object(_))));
    }

    #[test]
    fn loads_own_test_binary() {
        let exe = std::env::current_exe().unwrap();
        let table = load_symbol_table_from_path(&exe, 0).unwrap();

        assert!(table.iter().all(|function| !function.name.is_empty()));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_symbol_table_from_path("/nonexistent/traceback-test", 0).unwrap_err();

        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn root_comes_from_symtab_when_dwarf_lacks_it() {
        let data = std::fs::read(std::env::current_exe().unwrap()).unwrap();
        let table = with_root_from_symtab(SymbolTable::new(), &data, 0x1000, "main").unwrap();

        let main = table.find_by_name("main").unwrap();
        assert!(main.arguments.is_empty());
        assert!(main.start_address >= 0x1000);
    }
}
