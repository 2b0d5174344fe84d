pub mod eval;
pub mod unwind;

use crate::debugger::address::GlobalAddress;
use crate::debugger::error::Error;
use fallible_iterator::FallibleIterator;
use gimli::{
    AttributeValue, DW_AT_data_member_location, DW_AT_high_pc, DW_AT_low_pc, DW_AT_name,
    DW_TAG_formal_parameter, DW_TAG_structure_type, DW_TAG_subprogram, DW_TAG_variable, DwTag,
    Dwarf, Range, Reader, RunTimeEndian, Unit, UnitOffset,
};
use object::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, SymbolKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Deref;
use std::rc::Rc;

pub type EndianRcSlice = gimli::EndianRcSlice<RunTimeEndian>;

/// Preparsed debug information of the debugee executable.
/// Single source for pc <-> line mapping, function and symbol lookup,
/// the frame table and location expression evaluation.
pub struct DebugInfo {
    inner: Dwarf<EndianRcSlice>,
    units: Vec<ParsedUnit>,
    symbol_table: Option<SymbolTab>,
    /// Frame description entries (.debug_frame with .eh_frame fallback).
    pub frame_table: unwind::FrameTable,
}

/// Source position behind a single row of the line program.
#[derive(Clone)]
pub struct Place<'a> {
    pub file: &'a str,
    pub address: GlobalAddress,
    pub line_number: u64,
    pub column_number: u64,
    pub is_stmt: bool,
    pos_in_unit: usize,
    unit: &'a ParsedUnit,
}

impl<'a> Place<'a> {
    pub fn next(&self) -> Option<Place<'a>> {
        self.unit.place(self.pos_in_unit + 1)
    }

    pub fn to_owned(&self) -> PlaceOwned {
        PlaceOwned {
            file: self.file.to_string(),
            address: self.address,
            line_number: self.line_number,
            column_number: self.column_number,
            is_stmt: self.is_stmt,
        }
    }
}

/// Owned variant of a [`Place`], suitable for event hooks and UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaceOwned {
    pub file: String,
    pub address: GlobalAddress,
    pub line_number: u64,
    pub column_number: u64,
    pub is_stmt: bool,
}

#[derive(PartialEq, Debug)]
struct LineRow {
    address: u64,
    file_index: u64,
    line: u64,
    column: u64,
    is_stmt: bool,
}

struct DieRange {
    range: Range,
    die_idx: usize,
}

/// Shallow debugging information entry. Name, code ranges and the ancestor
/// chain are parsed eagerly, everything else is read from the underlying unit
/// on demand (see [`ParsedUnit::entry`]).
pub struct Die {
    pub tag: DwTag,
    pub name: Option<String>,
    pub low_pc: Option<u64>,
    pub high_pc: Option<u64>,
    pub offset: UnitOffset,
    parent: Option<usize>,
}

pub struct ParsedUnit {
    files: Vec<String>,
    ranges: Vec<Range>,
    lines: Vec<LineRow>,
    dies: Vec<Die>,
    die_ranges: Vec<DieRange>,
    unit: Rc<Unit<EndianRcSlice>>,
}

impl ParsedUnit {
    fn place(&self, line_pos: usize) -> Option<Place> {
        let line = self.lines.get(line_pos)?;

        Some(Place {
            file: self
                .files
                .get(line.file_index as usize)
                .map(|s| s.as_str())
                .unwrap_or_default(),
            address: GlobalAddress::from(line.address),
            line_number: line.line,
            column_number: line.column,
            pos_in_unit: line_pos,
            is_stmt: line.is_stmt,
            unit: self,
        })
    }

    pub fn gimli_unit(&self) -> &Unit<EndianRcSlice> {
        &self.unit
    }

    /// Read the full entry behind a shallow [`Die`].
    pub fn entry(
        &self,
        offset: UnitOffset,
    ) -> gimli::Result<gimli::DebuggingInformationEntry<EndianRcSlice>> {
        self.unit.entry(offset)
    }

    fn die(&self, idx: usize) -> &Die {
        &self.dies[idx]
    }
}

impl DebugInfo {
    pub fn new<'a, 'b, OBJ>(obj_file: &'a OBJ) -> Result<Self, Error>
    where
        'a: 'b,
        OBJ: Object<'a>,
    {
        let endian = if obj_file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        fn load_section<'a: 'b, 'b, OBJ, Endian>(
            id: gimli::SectionId,
            file: &'a OBJ,
            endian: Endian,
        ) -> Result<gimli::EndianRcSlice<Endian>, gimli::Error>
        where
            OBJ: Object<'a>,
            Endian: gimli::Endianity,
        {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[]));
            Ok(gimli::EndianRcSlice::new(Rc::from(&*data), endian))
        }

        let dwarf = Dwarf::load(|id| load_section(id, obj_file, endian))?;
        let symbol_table = SymbolTab::new(obj_file);
        let frame_table = unwind::FrameTable::new(obj_file, endian)?;

        Ok(Self {
            units: Self::parse(&dwarf)?,
            symbol_table,
            frame_table,
            inner: dwarf,
        })
    }

    pub fn dwarf(&self) -> &Dwarf<EndianRcSlice> {
        &self.inner
    }

    fn parse(dwarf: &Dwarf<EndianRcSlice>) -> Result<Vec<ParsedUnit>, Error> {
        let parsed = dwarf
            .units()
            .map(|header| {
                let unit = dwarf.unit(header)?;

                let mut lines = vec![];
                let mut files = vec![];

                if let Some(ref lp) = unit.line_program {
                    let mut rows = lp.clone().rows();
                    lines = parse_lines(&mut rows)?;
                    files = parse_files(dwarf, &unit, &rows)?;
                }

                lines.sort_by_key(|x| x.address);

                let mut unit_ranges = dwarf.unit_ranges(&unit)?.collect::<Vec<_>>()?;
                unit_ranges.sort_by_key(|r| r.begin);

                let mut dies: Vec<Die> = vec![];
                let mut die_ranges = vec![];
                let mut ancestors: Vec<usize> = vec![];

                let mut cursor = unit.entries();
                while let Some((delta_depth, die)) = cursor.next_dfs()? {
                    // depth delta: 1 - child of the previous die, 0 - sibling,
                    // negative - return to an upper level
                    if delta_depth <= 0 {
                        for _ in 0..1 - delta_depth {
                            ancestors.pop();
                        }
                    }

                    let mut low_pc = None;
                    if let Some(l_pc_attr) = die.attr(DW_AT_low_pc)? {
                        match l_pc_attr.value() {
                            AttributeValue::Addr(val) => low_pc = Some(val),
                            AttributeValue::DebugAddrIndex(index) => {
                                low_pc = Some(dwarf.address(&unit, index)?)
                            }
                            _ => {}
                        }
                    }

                    let mut high_pc = None;
                    if let Some(h_pc_attr) = die.attr(DW_AT_high_pc)? {
                        match h_pc_attr.value() {
                            AttributeValue::Addr(val) => high_pc = Some(val),
                            AttributeValue::DebugAddrIndex(index) => {
                                high_pc = Some(dwarf.address(&unit, index)?)
                            }
                            AttributeValue::Udata(val) => high_pc = Some(low_pc.unwrap_or(0) + val),
                            _ => {}
                        }
                    }

                    let name = die
                        .attr(DW_AT_name)?
                        .and_then(|attr| dwarf.attr_string(&unit, attr.value()).ok());

                    dies.push(Die {
                        tag: die.tag(),
                        name: name
                            .map(|s| s.to_string_lossy().map(|s| s.to_string()))
                            .transpose()?,
                        low_pc,
                        high_pc,
                        offset: die.offset(),
                        parent: ancestors.last().copied(),
                    });

                    let die_idx = dies.len() - 1;
                    dwarf.die_ranges(&unit, die)?.for_each(|r| {
                        die_ranges.push(DieRange { range: r, die_idx });
                        Ok(())
                    })?;

                    ancestors.push(die_idx);
                }
                die_ranges.sort_by_key(|dr| dr.range.begin);

                Ok(ParsedUnit {
                    files,
                    lines,
                    ranges: unit_ranges,
                    dies,
                    die_ranges,
                    unit: Rc::new(unit),
                })
            })
            .collect::<Vec<_>>()?;

        Ok(parsed)
    }

    fn find_unit(&self, pc: GlobalAddress) -> Option<&ParsedUnit> {
        let pc = pc.as_u64();
        self.units.iter().find(|unit| {
            match unit.ranges.binary_search_by_key(&pc, |r| r.begin) {
                Ok(_) => true,
                Err(pos) => unit.ranges[..pos]
                    .iter()
                    .rev()
                    .any(|range| range.begin <= pc && pc < range.end),
            }
        })
    }

    /// Return the source place of the line program row covering `pc`.
    pub fn find_place_from_pc(&self, pc: GlobalAddress) -> Option<Place> {
        let unit = self.find_unit(pc)?;
        let pc = pc.as_u64();

        let pos = match unit.lines.binary_search_by_key(&pc, |line| line.address) {
            Ok(p) => p,
            Err(0) => return None,
            Err(p) => p - 1,
        };

        unit.place(pos)
    }

    /// Return the first statement row of `line` in a file whose path ends
    /// with `file`.
    pub fn find_stmt_line(&self, file: &str, line: u64) -> Option<Place> {
        for unit in &self.units {
            let file_indexes: Vec<u64> = unit
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| f.ends_with(file))
                .map(|(i, _)| i as u64)
                .collect();

            if file_indexes.is_empty() {
                continue;
            }

            let mut best: Option<usize> = None;
            for (pos, row) in unit.lines.iter().enumerate() {
                if row.line == line && row.is_stmt && file_indexes.contains(&row.file_index) {
                    let better = match best {
                        None => true,
                        Some(b) => row.address < unit.lines[b].address,
                    };
                    if better {
                        best = Some(pos);
                    }
                }
            }
            if let Some(pos) = best {
                return unit.place(pos);
            }
        }
        None
    }

    /// Return the function (subprogram) entry covering `pc`.
    pub fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<(&ParsedUnit, &Die)> {
        let unit = self.find_unit(pc)?;
        let pc = pc.as_u64();

        let find_pos = match unit
            .die_ranges
            .binary_search_by_key(&pc, |dr| dr.range.begin)
        {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };

        unit.die_ranges[..find_pos]
            .iter()
            .rev()
            .find(|dr| {
                unit.dies[dr.die_idx].tag == DW_TAG_subprogram
                    && dr.range.begin <= pc
                    && pc < dr.range.end
            })
            .map(|dr| (unit, unit.die(dr.die_idx)))
    }

    /// Return the function entry with exactly the name `fn_name`.
    pub fn find_function_by_name(&self, fn_name: &str) -> Option<(&ParsedUnit, &Die)> {
        for unit in &self.units {
            for die in &unit.dies {
                if die.tag == DW_TAG_subprogram && die.name.as_deref() == Some(fn_name) {
                    return Some((unit, die));
                }
            }
        }
        None
    }

    /// Return ELF symbol by its name.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbol_table.as_ref().and_then(|st| st.get(name))
    }

    /// Return the static address of a non-local variable. `DW_AT_location`
    /// must be a position independent expression, typically a single address
    /// operation.
    pub fn global_variable_address(&self, name: &str) -> Result<GlobalAddress, Error> {
        for unit in &self.units {
            for die in &unit.dies {
                if die.tag != DW_TAG_variable || die.name.as_deref() != Some(name) {
                    continue;
                }
                let entry = unit.entry(die.offset)?;
                if let Some(AttributeValue::Exprloc(expr)) =
                    entry.attr_value(gimli::DW_AT_location)?
                {
                    return eval::evaluate_static_address(expr, &unit.unit);
                }
            }
        }
        Err(Error::SymbolNotFound(name.to_string()))
    }

    /// Return the offset of `member` inside the structure type named
    /// `type_name`, taken from the type description.
    pub fn member_offset(&self, type_name: &str, member: &str) -> Option<u64> {
        for unit in &self.units {
            for (idx, die) in unit.dies.iter().enumerate() {
                if die.tag != DW_TAG_structure_type || die.name.as_deref() != Some(type_name) {
                    continue;
                }

                let member_die = unit.dies.iter().find(|d| {
                    d.tag == gimli::DW_TAG_member
                        && d.parent == Some(idx)
                        && d.name.as_deref() == Some(member)
                })?;

                let entry = unit.entry(member_die.offset).ok()?;
                return match entry.attr_value(DW_AT_data_member_location).ok()? {
                    Some(AttributeValue::Udata(offset)) => Some(offset),
                    Some(AttributeValue::Sdata(offset)) => Some(offset as u64),
                    _ => None,
                };
            }
        }
        None
    }

    /// Return variable and formal parameter entries visible in the function
    /// scope covering `pc`, in declaration order.
    pub fn scope_variables(&self, pc: GlobalAddress) -> Vec<(&ParsedUnit, &Die)> {
        let Some((unit, function)) = self.find_function_by_pc(pc) else {
            return vec![];
        };

        let Some(fn_idx) = unit.dies.iter().position(|d| d.offset == function.offset) else {
            return vec![];
        };

        unit.dies
            .iter()
            .filter(|die| {
                if die.tag != DW_TAG_variable && die.tag != DW_TAG_formal_parameter {
                    return false;
                }
                let mut parent = die.parent;
                while let Some(p) = parent {
                    if p == fn_idx {
                        return true;
                    }
                    parent = unit.dies[p].parent;
                }
                false
            })
            .map(|die| (unit, die))
            .collect()
    }
}

fn parse_lines<R, Offset>(
    rows: &mut gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<LineRow>>
where
    R: gimli::Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut lines = vec![];
    while let Some((_, line_row)) = rows.next_row()? {
        let column = match line_row.column() {
            gimli::ColumnType::LeftEdge => 0,
            gimli::ColumnType::Column(x) => x.get(),
        };

        lines.push(LineRow {
            address: line_row.address(),
            file_index: line_row.file_index(),
            line: line_row.line().map(NonZeroU64::get).unwrap_or(0),
            column,
            is_stmt: line_row.is_stmt(),
        })
    }
    Ok(lines)
}

fn parse_files<R, Offset>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    rows: &gimli::LineRows<R, gimli::IncompleteLineProgram<R, Offset>, Offset>,
) -> gimli::Result<Vec<String>>
where
    R: gimli::Reader<Offset = Offset>,
    Offset: gimli::ReaderOffset,
{
    let mut files = vec![];
    let header = rows.header();
    match header.file(0) {
        Some(file) => files.push(render_file_path(unit, file, header, dwarf)?),
        None => files.push(String::from("")),
    }
    let mut index = 1;
    while let Some(file) = header.file(index) {
        files.push(render_file_path(unit, file, header, dwarf)?);
        index += 1;
    }

    Ok(files)
}

fn render_file_path<R: gimli::Reader>(
    dw_unit: &Unit<R>,
    file: &gimli::FileEntry<R, R::Offset>,
    header: &gimli::LineProgramHeader<R, R::Offset>,
    sections: &Dwarf<R>,
) -> Result<String, gimli::Error> {
    let mut path = if let Some(ref comp_dir) = dw_unit.comp_dir {
        comp_dir.to_string_lossy()?.into_owned()
    } else {
        String::new()
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path_push(
                &mut path,
                sections
                    .attr_string(dw_unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    path_push(
        &mut path,
        sections
            .attr_string(dw_unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}

fn path_push(path: &mut String, p: &str) {
    if p.starts_with('/') {
        *path = p.to_string();
    } else {
        let dir_separator = '/';
        if !path.is_empty() && !path.ends_with(dir_separator) {
            path.push(dir_separator);
        }
        *path += p;
    }
}

#[derive(Debug)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub addr: u64,
}

#[derive(Debug)]
struct SymbolTab(HashMap<String, Symbol>);

impl Deref for SymbolTab {
    type Target = HashMap<String, Symbol>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SymbolTab {
    fn new<'data: 'file, 'file, OBJ: Object<'data>>(
        object_file: &'data OBJ,
    ) -> Option<Self> {
        object_file.symbol_table().as_ref().map(|sym_table| {
            SymbolTab(
                sym_table
                    .symbols()
                    .map(|symbol| {
                        let name: String = symbol.name().unwrap_or_default().into();
                        (
                            name,
                            Symbol {
                                kind: symbol.kind(),
                                addr: symbol.address(),
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>(),
            )
        })
    }
}
