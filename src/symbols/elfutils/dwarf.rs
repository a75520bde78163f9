use object::{File, Object, ObjectSection, SectionKind};

const PREFIXES: [&str; 3] = [".debug_", ".zdebug_", "__debug_"];

/// There are many DWARF sections, but function ranges and line tables only
/// need these ones.
///
/// Possible candidates for future: "loc", "loclists", "rnglists"
const DWARF_SECTIONS: [&str; 5] = ["abbrev", "info", "str", "line", "ranges"];

/// has_dwarf reports whether the specified executable or library file contains DWARF debug information.
pub fn has_dwarf(e: &File<'_>) -> bool {
    e.sections().any(|section| {
        let name = match section.name() {
            Ok(name) => name,
            Err(_) => return false,
        };
        let suffix = match strip_dwarf_prefix(name) {
            Some(suffix) => suffix,
            None => return false,
        };

        // Sections stripped into a separate debug file keep their headers as NOBITS.
        DWARF_SECTIONS.contains(&suffix)
            && section.kind() != SectionKind::UninitializedData
            && section.size() > 0
    })
}

fn strip_dwarf_prefix(name: &str) -> Option<&str> {
    PREFIXES.iter().find_map(|prefix| name.strip_prefix(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_dwarf_prefix() {
        assert_eq!(strip_dwarf_prefix(".debug_info"), Some("info"));
        assert_eq!(strip_dwarf_prefix(".zdebug_line"), Some("line"));
        assert_eq!(strip_dwarf_prefix("__debug_str"), Some("str"));
        assert_eq!(strip_dwarf_prefix(".text"), None);
    }
}
