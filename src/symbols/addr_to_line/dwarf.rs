use crate::symbols::SourceLine;
use anyhow::Context as _;
use gimli::{EndianArcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};

type Reader = EndianArcSlice<RunTimeEndian>;

/// DwarfLiner maps addresses to source lines using the DWARF line tables of a module.
pub struct DwarfLiner {
    // Context caches parsed units lazily, so lookups go through the lock.
    ctx: Mutex<addr2line::Context<Reader>>,
}

impl DwarfLiner {
    pub fn try_new(e: &object::File<'_>) -> anyhow::Result<Self> {
        let endian = if e.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        // Load a section and copy it into an `Arc<[u8]>` so the context owns its data.
        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let data = match e.section_by_name(id.name()) {
                Some(section) => section.uncompressed_data().unwrap_or(Cow::Borrowed(&[][..])),
                None => Cow::Borrowed(&[][..]),
            };
            Ok(EndianArcSlice::new(Arc::<[u8]>::from(&*data), endian))
        };

        let dwarf = gimli::Dwarf::load(load_section).context("Failed to load Dwarf sections")?;

        // Constructing a Context is somewhat costly, so one is kept per module.
        let ctx = addr2line::Context::from_dwarf(dwarf).context("Failed to create Context")?;

        Ok(Self {
            ctx: Mutex::new(ctx),
        })
    }

    /// Source location of a stated virtual address, if the line tables cover it.
    pub fn source_line(&self, svma: u64) -> Option<SourceLine> {
        let ctx = match self.ctx.lock() {
            Ok(ctx) => ctx,
            Err(poisoned) => poisoned.into_inner(),
        };

        let location = match ctx.find_location(svma) {
            Ok(Some(location)) => location,
            Ok(None) => return None,
            Err(e) => {
                log::debug!("Failed to lookup address {:#x}: {}", svma, e);
                return None;
            }
        };

        Some(SourceLine {
            file: location.file?.to_string(),
            line: location.line?,
        })
    }
}

impl std::fmt::Debug for DwarfLiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwarfLiner").finish_non_exhaustive()
    }
}
