use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::eval::EvaluationContext;
use crate::debugger::debugee::dwarf::{eval, EndianRcSlice, ParsedUnit};
use crate::debugger::debugee::Location;
use crate::debugger::error::Error;
use crate::debugger::register::DwarfRegisterMap;
use crate::debugger::{Debugger, TargetMemory};
use crate::muted_error;
use gimli::{
    AttributeValue, DW_AT_byte_size, DW_AT_count, DW_AT_data_member_location, DW_AT_encoding,
    DW_AT_location, DW_AT_name, DW_AT_type, DW_AT_upper_bound, DW_TAG_formal_parameter,
    DW_TAG_member, DW_TAG_pointer_type, DW_TAG_structure_type, DW_TAG_subrange_type,
    DW_TAG_typedef, DW_TAG_variable, DebuggingInformationEntry, DwAte, Reader, UnitOffset,
};

/// Pointer chains are dereferenced at most this deep while rendering.
const MAX_DEREF_DEPTH: usize = 6;

/// Named value extracted from the debugee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub type_name: String,
    pub value: String,
}

impl Debugger {
    /// Evaluate an expression in the scope of the focused task: a local
    /// variable or argument name, a `var.member` path into a structure, or a
    /// `0x`-prefixed raw address (read as a 64-bit word).
    pub fn read_variable(&self, expr: &str) -> Result<Variable, Error> {
        self.ensure_in_progress()?;

        if let Some(hex) = expr.strip_prefix("0x") {
            let addr = usize::from_str_radix(hex, 16)
                .map_err(|_| Error::VariableNotFound(expr.to_string()))?;
            let data = self.tracer.read_memory(RelocatedAddress::from(addr), 8)?;
            let bytes: [u8; 8] = data.try_into().map_err(|_| Error::TypeBinaryRepr("u64"))?;
            return Ok(Variable {
                name: expr.to_string(),
                type_name: "uint64".to_string(),
                value: format!("{:#x}", u64::from_le_bytes(bytes)),
            });
        }

        let (var_name, member) = match expr.split_once('.') {
            Some((var, member)) => (var, Some(member)),
            None => (expr, None),
        };

        let location = self.current_location()?;
        let scope = self.debugee.debug_info.scope_variables(location.global_pc);
        let (unit, die) = scope
            .into_iter()
            .find(|(_, die)| die.name.as_deref() == Some(var_name))
            .ok_or_else(|| Error::VariableNotFound(var_name.to_string()))?;

        self.extract_variable(unit, die.offset, member, location)
    }

    /// All local variables of the current function scope.
    pub fn read_locals(&self) -> Result<Vec<Variable>, Error> {
        self.variables_by_tag(DW_TAG_variable)
    }

    /// All arguments of the current function.
    pub fn read_arguments(&self) -> Result<Vec<Variable>, Error> {
        self.variables_by_tag(DW_TAG_formal_parameter)
    }

    fn variables_by_tag(&self, tag: gimli::DwTag) -> Result<Vec<Variable>, Error> {
        self.ensure_in_progress()?;
        let location = self.current_location()?;

        let mut result = vec![];
        for (unit, die) in self.debugee.debug_info.scope_variables(location.global_pc) {
            if die.tag != tag {
                continue;
            }
            // a variable may be optimized out or not yet live at this pc
            if let Some(var) =
                muted_error!(self.extract_variable(unit, die.offset, None, location))
            {
                result.push(var);
            }
        }
        Ok(result)
    }

    fn extract_variable(
        &self,
        unit: &ParsedUnit,
        die_offset: UnitOffset,
        member: Option<&str>,
        location: Location,
    ) -> Result<Variable, Error> {
        let entry = unit.entry(die_offset)?;
        let name = entry_name(self, unit, &entry).unwrap_or_default();

        let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(DW_AT_location)? else {
            return Err(Error::VariableNotFound(name));
        };

        let ectx = EvaluationContext {
            debug_info: &self.debugee.debug_info,
            memory: &self.tracer,
            registers: DwarfRegisterMap::from(self.tracer.registers(location.pid)?),
            pc: location.global_pc,
            mapping_offset: self.debugee.mapping_offset(),
        };
        let addr = eval::evaluate(&ectx, unit.gimli_unit(), expr)?.into_address()?;
        let type_offset = type_ref(&entry).ok_or(Error::UnsupportedType(name.clone()))?;

        let renderer = ValueRenderer {
            debugger: self,
            unit,
        };

        match member {
            None => {
                let (type_name, value) = renderer.render(addr, type_offset, 0)?;
                Ok(Variable {
                    name,
                    type_name,
                    value,
                })
            }
            Some(member_path) => renderer.render_member(addr, type_offset, &name, member_path),
        }
    }
}

struct ValueRenderer<'a> {
    debugger: &'a Debugger,
    unit: &'a ParsedUnit,
}

impl<'a> ValueRenderer<'a> {
    fn memory(&self) -> &dyn TargetMemory {
        &self.debugger.tracer
    }

    fn entry(
        &self,
        offset: UnitOffset,
    ) -> Result<DebuggingInformationEntry<'a, 'a, EndianRcSlice>, Error> {
        Ok(self.unit.entry(offset)?)
    }

    fn type_name(&self, entry: &DebuggingInformationEntry<EndianRcSlice>) -> String {
        entry_name(self.debugger, self.unit, entry).unwrap_or_else(|| "?".to_string())
    }

    /// Render the value of type `type_offset` living at `addr`.
    fn render(
        &self,
        addr: RelocatedAddress,
        type_offset: UnitOffset,
        depth: usize,
    ) -> Result<(String, String), Error> {
        let entry = self.entry(type_offset)?;

        match entry.tag() {
            DW_TAG_typedef => {
                let underlying = type_ref(&entry)
                    .ok_or_else(|| Error::UnsupportedType(self.type_name(&entry)))?;
                let (_, value) = self.render(addr, underlying, depth)?;
                Ok((self.type_name(&entry), value))
            }
            gimli::DW_TAG_base_type => {
                let value = self.render_base(addr, &entry)?;
                Ok((self.type_name(&entry), value))
            }
            DW_TAG_pointer_type => {
                let type_name = self.type_name(&entry);
                let ptr = self.read_u64(addr)?;
                if ptr == 0 {
                    return Ok((type_name.clone(), format!("{type_name} nil")));
                }
                if depth >= MAX_DEREF_DEPTH {
                    return Ok((type_name, format!("{ptr:#x}")));
                }
                match type_ref(&entry) {
                    Some(pointee) => {
                        let (_, value) = self.render(
                            RelocatedAddress::from(ptr as usize),
                            pointee,
                            depth + 1,
                        )?;
                        Ok((type_name, format!("*{value}")))
                    }
                    None => Ok((type_name, format!("{ptr:#x}"))),
                }
            }
            DW_TAG_structure_type => {
                let type_name = self.type_name(&entry);
                if type_name == "string" {
                    return Ok((type_name, self.render_go_string(addr, type_offset)?));
                }
                if type_name.starts_with("[]") {
                    return Ok((
                        type_name.clone(),
                        self.render_go_slice(addr, type_offset, depth)?,
                    ));
                }
                self.render_struct(addr, type_offset, depth)
            }
            gimli::DW_TAG_array_type => {
                let type_name = self.type_name(&entry);
                let value = self.render_array(addr, &entry, depth)?;
                Ok((type_name, value))
            }
            _ => Err(Error::UnsupportedType(self.type_name(&entry))),
        }
    }

    fn render_base(
        &self,
        addr: RelocatedAddress,
        entry: &DebuggingInformationEntry<EndianRcSlice>,
    ) -> Result<String, Error> {
        let size = udata_attr(entry, DW_AT_byte_size)?.unwrap_or(8) as usize;
        let encoding = match entry.attr_value(DW_AT_encoding)? {
            Some(AttributeValue::Encoding(enc)) => enc,
            _ => DwAte(0),
        };

        let data = self.memory().read_memory(addr, size)?;
        let mut word = [0u8; 8];
        word[..size.min(8)].copy_from_slice(&data[..size.min(8)]);
        let unsigned = u64::from_le_bytes(word);

        let rendered = match encoding {
            gimli::DW_ATE_boolean => (unsigned != 0).to_string(),
            gimli::DW_ATE_float => match size {
                4 => f32::from_le_bytes(data[..4].try_into().expect("4 bytes")).to_string(),
                8 => f64::from_le_bytes(word).to_string(),
                _ => return Err(Error::TypeBinaryRepr("float")),
            },
            gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => {
                let shift = 64 - size as u32 * 8;
                (((unsigned << shift) as i64) >> shift).to_string()
            }
            _ => unsigned.to_string(),
        };
        Ok(rendered)
    }

    fn render_go_string(
        &self,
        addr: RelocatedAddress,
        type_offset: UnitOffset,
    ) -> Result<String, Error> {
        // two pointer-sized words: data address, then length
        let str_off = self.member_offset_of(type_offset, "str").unwrap_or(0);
        let len_off = self.member_offset_of(type_offset, "len").unwrap_or(8);

        let data_addr = self.read_u64(addr.offset(str_off as isize))?;
        let len = self.read_u64(addr.offset(len_off as isize))?;
        if data_addr == 0 || len == 0 {
            return Ok(String::from("\"\""));
        }

        let bytes = self
            .memory()
            .read_memory(RelocatedAddress::from(data_addr as usize), len as usize)?;
        Ok(format!("\"{}\"", String::from_utf8_lossy(&bytes)))
    }

    fn render_go_slice(
        &self,
        addr: RelocatedAddress,
        type_offset: UnitOffset,
        depth: usize,
    ) -> Result<String, Error> {
        let array_off = self.member_offset_of(type_offset, "array").unwrap_or(0);
        let len_off = self.member_offset_of(type_offset, "len").unwrap_or(8);
        let cap_off = self.member_offset_of(type_offset, "cap").unwrap_or(16);

        let data_addr = self.read_u64(addr.offset(array_off as isize))?;
        let len = self.read_u64(addr.offset(len_off as isize))?;
        let cap = self.read_u64(addr.offset(cap_off as isize))?;

        // element type hides behind the data pointer member
        let elem = self
            .member_type_of(type_offset, "array")
            .and_then(|ptr_off| self.entry(ptr_off).ok())
            .and_then(|ptr_entry| type_ref(&ptr_entry));

        let mut elems = vec![];
        if let Some(elem_offset) = elem {
            let elem_entry = self.entry(elem_offset)?;
            let elem_size = udata_attr(&elem_entry, DW_AT_byte_size)?.unwrap_or(8);
            for i in 0..len {
                let elem_addr =
                    RelocatedAddress::from((data_addr + i * elem_size) as usize);
                let (_, value) = self.render(elem_addr, elem_offset, depth + 1)?;
                elems.push(value);
            }
        }

        Ok(format!("len: {len} cap: {cap} [{}]", elems.join(" ")))
    }

    fn render_array(
        &self,
        addr: RelocatedAddress,
        entry: &DebuggingInformationEntry<EndianRcSlice>,
        depth: usize,
    ) -> Result<String, Error> {
        let elem_offset =
            type_ref(entry).ok_or_else(|| Error::UnsupportedType(self.type_name(entry)))?;
        let elem_entry = self.entry(elem_offset)?;
        let elem_size = udata_attr(&elem_entry, DW_AT_byte_size)?.unwrap_or(8);

        let count = self.array_len(entry)?.unwrap_or(0);
        let mut elems = vec![];
        for i in 0..count {
            let elem_addr = addr.offset((i * elem_size) as isize);
            let (_, value) = self.render(elem_addr, elem_offset, depth + 1)?;
            elems.push(value);
        }
        Ok(format!("[{}]", elems.join(" ")))
    }

    fn array_len(
        &self,
        entry: &DebuggingInformationEntry<EndianRcSlice>,
    ) -> Result<Option<u64>, Error> {
        let mut tree = self.unit.gimli_unit().entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            if child.entry().tag() == DW_TAG_subrange_type {
                if let Some(count) = udata_attr(child.entry(), DW_AT_count)? {
                    return Ok(Some(count));
                }
                if let Some(upper) = udata_attr(child.entry(), DW_AT_upper_bound)? {
                    return Ok(Some(upper + 1));
                }
            }
        }
        Ok(None)
    }

    fn render_struct(
        &self,
        addr: RelocatedAddress,
        type_offset: UnitOffset,
        depth: usize,
    ) -> Result<(String, String), Error> {
        let entry = self.entry(type_offset)?;
        let type_name = self.type_name(&entry);

        let mut fields = vec![];
        let mut tree = self.unit.gimli_unit().entries_tree(Some(type_offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let member = child.entry();
            if member.tag() != DW_TAG_member {
                continue;
            }
            let name = entry_name(self.debugger, self.unit, member).unwrap_or_default();
            let offset = udata_attr(member, DW_AT_data_member_location)?.unwrap_or(0);
            let Some(member_type) = type_ref(member) else {
                continue;
            };
            let value = match self.render(addr.offset(offset as isize), member_type, depth + 1) {
                Ok((_, value)) => value,
                Err(_) => "?".to_string(),
            };
            fields.push(format!("{name}: {value}"));
        }

        Ok((
            type_name.clone(),
            format!("{type_name} {{{}}}", fields.join(", ")),
        ))
    }

    /// Render `var.member` (the member may itself be a dotted path).
    fn render_member(
        &self,
        addr: RelocatedAddress,
        type_offset: UnitOffset,
        parent_name: &str,
        member_path: &str,
    ) -> Result<Variable, Error> {
        let (member_name, rest) = match member_path.split_once('.') {
            Some((m, rest)) => (m, Some(rest)),
            None => (member_path, None),
        };

        // dereference pointers down to the concrete structure
        let mut addr = addr;
        let mut type_offset = type_offset;
        for _ in 0..MAX_DEREF_DEPTH {
            let entry = self.entry(type_offset)?;
            match entry.tag() {
                DW_TAG_typedef => {
                    type_offset = type_ref(&entry)
                        .ok_or_else(|| Error::UnsupportedType(self.type_name(&entry)))?;
                }
                DW_TAG_pointer_type => {
                    let ptr = self.read_u64(addr)?;
                    if ptr == 0 {
                        return Err(Error::NilPointer(parent_name.to_string()));
                    }
                    addr = RelocatedAddress::from(ptr as usize);
                    type_offset = type_ref(&entry)
                        .ok_or_else(|| Error::UnsupportedType(self.type_name(&entry)))?;
                }
                _ => break,
            }
        }

        let entry = self.entry(type_offset)?;
        if entry.tag() != DW_TAG_structure_type {
            return Err(Error::MemberNotFound(
                parent_name.to_string(),
                member_name.to_string(),
            ));
        }

        let member_offset = self.member_offset_of(type_offset, member_name);
        let member_type = self.member_type_of(type_offset, member_name);
        let (Some(member_offset), Some(member_type)) = (member_offset, member_type) else {
            return Err(Error::MemberNotFound(
                parent_name.to_string(),
                member_name.to_string(),
            ));
        };

        let member_addr = addr.offset(member_offset as isize);
        let full_name = format!("{parent_name}.{member_name}");
        match rest {
            Some(rest) => self.render_member(member_addr, member_type, &full_name, rest),
            None => {
                let (type_name, value) = self.render(member_addr, member_type, 0)?;
                Ok(Variable {
                    name: full_name,
                    type_name,
                    value,
                })
            }
        }
    }

    fn member_offset_of(&self, struct_offset: UnitOffset, member: &str) -> Option<u64> {
        self.find_member(struct_offset, member)
            .and_then(|(offset, _)| offset)
    }

    fn member_type_of(&self, struct_offset: UnitOffset, member: &str) -> Option<UnitOffset> {
        self.find_member(struct_offset, member)
            .and_then(|(_, type_offset)| type_offset)
    }

    #[allow(clippy::type_complexity)]
    fn find_member(
        &self,
        struct_offset: UnitOffset,
        member: &str,
    ) -> Option<(Option<u64>, Option<UnitOffset>)> {
        let mut tree = self
            .unit
            .gimli_unit()
            .entries_tree(Some(struct_offset))
            .ok()?;
        let root = tree.root().ok()?;
        let mut children = root.children();
        while let Some(child) = children.next().ok()? {
            let entry = child.entry();
            if entry.tag() != DW_TAG_member {
                continue;
            }
            if entry_name(self.debugger, self.unit, entry).as_deref() == Some(member) {
                let offset = udata_attr(entry, DW_AT_data_member_location).ok()?;
                return Some((offset, type_ref(entry)));
            }
        }
        None
    }

    fn read_u64(&self, addr: RelocatedAddress) -> Result<u64, Error> {
        let data = self.memory().read_memory(addr, 8)?;
        let bytes: [u8; 8] = data.try_into().map_err(|_| Error::TypeBinaryRepr("u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

fn entry_name(
    debugger: &Debugger,
    unit: &ParsedUnit,
    entry: &DebuggingInformationEntry<EndianRcSlice>,
) -> Option<String> {
    let attr = entry.attr(DW_AT_name).ok()??;
    let value = debugger
        .debugee
        .debug_info
        .dwarf()
        .attr_string(unit.gimli_unit(), attr.value())
        .ok()?;
    value.to_string_lossy().ok().map(|s| s.to_string())
}

fn type_ref(entry: &DebuggingInformationEntry<EndianRcSlice>) -> Option<UnitOffset> {
    match entry.attr_value(DW_AT_type).ok()?? {
        AttributeValue::UnitRef(offset) => Some(offset),
        _ => None,
    }
}

fn udata_attr(
    entry: &DebuggingInformationEntry<EndianRcSlice>,
    attr: gimli::DwAt,
) -> Result<Option<u64>, Error> {
    Ok(entry.attr_value(attr)?.and_then(|value| match value {
        AttributeValue::Udata(v) => Some(v),
        AttributeValue::Sdata(v) => Some(v as u64),
        AttributeValue::Data1(v) => Some(v as u64),
        AttributeValue::Data2(v) => Some(v as u64),
        AttributeValue::Data4(v) => Some(v as u64),
        AttributeValue::Data8(v) => Some(v),
        _ => None,
    }))
}
