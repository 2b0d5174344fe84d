use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::EndianRcSlice;
use crate::debugger::error::Error;
use crate::debugger::register::DwarfRegisterMap;
use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, RegisterRule, RunTimeEndian, UnwindSection,
};
use object::{Object, ObjectSection};
use std::rc::Rc;

/// Code range covered by a single frame description entry.
#[derive(Debug, Clone, Copy)]
pub struct FdeBounds {
    pub begin: GlobalAddress,
    pub end: GlobalAddress,
}

impl FdeBounds {
    pub fn cover(&self, pc: GlobalAddress) -> bool {
        self.begin <= pc && pc < self.end
    }
}

/// Unwind table of the debugee executable.
///
/// The table answers two questions the execution control needs: does any
/// frame description entry cover a pc, and where relative to the stack
/// pointer does the current frame keep its return address.
pub struct FrameTable {
    debug_frame: Option<DebugFrame<EndianRcSlice>>,
    eh_frame: Option<EhFrame<EndianRcSlice>>,
    bases: BaseAddresses,
}

impl FrameTable {
    pub fn new<'a, 'b, OBJ>(obj: &'a OBJ, endian: RunTimeEndian) -> Result<Self, Error>
    where
        'a: 'b,
        OBJ: Object<'a>,
    {
        let load = |name: &str| -> Option<(EndianRcSlice, u64)> {
            let section = obj.section_by_name(name)?;
            let data = section.uncompressed_data().ok()?;
            Some((
                gimli::EndianRcSlice::new(Rc::from(&*data), endian),
                section.address(),
            ))
        };

        let mut bases = BaseAddresses::default();
        if let Some(text) = obj.section_by_name(".text") {
            bases = bases.set_text(text.address());
        }

        let debug_frame = load(".debug_frame").map(|(data, _)| {
            let mut df = DebugFrame::from(data);
            df.set_address_size(std::mem::size_of::<usize>() as u8);
            df
        });

        let eh_frame = load(".eh_frame").map(|(data, addr)| {
            bases = bases.clone().set_eh_frame(addr);
            EhFrame::from(data)
        });

        Ok(Self {
            debug_frame,
            eh_frame,
            bases,
        })
    }

    /// Return the bounds of the frame description entry covering `pc`.
    pub fn fde_bounds(&self, pc: GlobalAddress) -> Result<FdeBounds, Error> {
        if let Some(ref df) = self.debug_frame {
            if let Ok(fde) =
                df.fde_for_address(&self.bases, pc.as_u64(), DebugFrame::cie_from_offset)
            {
                return Ok(FdeBounds {
                    begin: GlobalAddress::from(fde.initial_address()),
                    end: GlobalAddress::from(fde.initial_address() + fde.len()),
                });
            }
        }

        if let Some(ref eh) = self.eh_frame {
            if let Ok(fde) = eh.fde_for_address(&self.bases, pc.as_u64(), EhFrame::cie_from_offset)
            {
                return Ok(FdeBounds {
                    begin: GlobalAddress::from(fde.initial_address()),
                    end: GlobalAddress::from(fde.initial_address() + fde.len()),
                });
            }
        }

        Err(Error::UnknownFde(pc))
    }

    /// Return the offset from the current stack pointer at which the frame
    /// covering `pc` keeps its return address.
    pub fn return_address_offset(&self, pc: GlobalAddress) -> Result<i64, Error> {
        let (cfa, ra) = self.rules_for_pc(pc)?;

        let CfaRule::RegisterAndOffset { register, offset } = cfa else {
            return Err(Error::EvalUnsupportedRequire("cfa expression rule"));
        };
        if register != gimli::X86_64::RSP {
            return Err(Error::EvalUnsupportedRequire("sp based cfa rule"));
        }

        let RegisterRule::Offset(ra_offset) = ra else {
            return Err(Error::EvalUnsupportedRequire("offset return address rule"));
        };

        Ok(offset + ra_offset)
    }

    /// Compute the canonical frame address of the frame covering `pc`.
    pub fn cfa(&self, pc: GlobalAddress, regs: &DwarfRegisterMap) -> Result<RelocatedAddress, Error> {
        let (cfa, _) = self.rules_for_pc(pc)?;
        match cfa {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = regs.value(register)?;
                Ok(RelocatedAddress::from(base.wrapping_add_signed(offset)))
            }
            CfaRule::Expression(_) => Err(Error::EvalUnsupportedRequire("cfa expression rule")),
        }
    }

    fn rules_for_pc(
        &self,
        pc: GlobalAddress,
    ) -> Result<(CfaRule<usize>, RegisterRule<usize>), Error> {
        let mut ctx = Box::new(gimli::UnwindContext::new());

        if let Some(ref df) = self.debug_frame {
            match df.fde_for_address(&self.bases, pc.as_u64(), DebugFrame::cie_from_offset) {
                Ok(fde) => {
                    let row = fde.unwind_info_for_address(df, &self.bases, &mut ctx, pc.as_u64())?;
                    let ra = row.register(fde.cie().return_address_register());
                    return Ok((row.cfa().clone(), ra));
                }
                Err(gimli::Error::NoUnwindInfoForAddress) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(ref eh) = self.eh_frame {
            match eh.fde_for_address(&self.bases, pc.as_u64(), EhFrame::cie_from_offset) {
                Ok(fde) => {
                    let row = fde.unwind_info_for_address(eh, &self.bases, &mut ctx, pc.as_u64())?;
                    let ra = row.register(fde.cie().return_address_register());
                    return Ok((row.cfa().clone(), ra));
                }
                Err(gimli::Error::NoUnwindInfoForAddress) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::UnknownFde(pc))
    }
}
