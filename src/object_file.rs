//! ELF object file emission using the `object` crate.
//!
//! The unit's bytes (code followed by its constant pool) become the `.text`
//! section of a relocatable object with one global function symbol. Code is
//! written for base address 0, so any absolute address the unit embeds
//! refers to that placement.

use object::write::{Object, Symbol, SymbolSection};
use object::{BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

use crate::arch::Architecture;
use crate::core::error::{CompileError, CompileResult};

/// Emit `code` as an ELF object defining the function `name`.
pub fn write_elf(name: &str, arch: &dyn Architecture, code: &[u8]) -> CompileResult<Vec<u8>> {
    let machine = match arch.word_size() {
        8 => object::Architecture::X86_64,
        4 => object::Architecture::I386,
        other => {
            return Err(CompileError::encoding(format!(
                "no ELF machine for {other}-byte words"
            )))
        }
    };
    let mut obj = Object::new(BinaryFormat::Elf, machine, Endianness::Little);

    let text = obj.section_id(object::write::StandardSection::Text);
    let code_offset = obj.append_section_data(text, code, 16);

    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: code_offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let mut buf = Vec::new();
    obj.emit(&mut buf)
        .map_err(|e| CompileError::encoding(format!("ELF emission failed: {e}")))?;
    log::debug!("{name}: {} code bytes in a {}-byte object", code.len(), buf.len());
    Ok(buf)
}
