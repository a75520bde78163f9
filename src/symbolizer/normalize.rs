use crate::trace::ProfileImage;

/// Address used to look functions up in a module resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedAddress(pub(crate) u64);

impl NormalizedAddress {
    /// Native frames are made relative to the image base. Managed code has no
    /// image mapping, so its absolute address is kept.
    pub fn new(ip: u64, image: &ProfileImage, is_managed: bool) -> Self {
        if is_managed {
            return NormalizedAddress(ip);
        }
        NormalizedAddress(ip.saturating_sub(image.base_address))
    }

    pub fn rva(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ImageId;

    #[test]
    fn test_native_and_managed_addresses() {
        let image = ProfileImage {
            id: ImageId(1),
            module_name: "app.dll".to_string(),
            file_path: String::new(),
            base_address: 0x40_0000,
            size: 0x1000,
            checksum: 0,
            timestamp: 0,
            build_id: None,
        };
        assert_eq!(NormalizedAddress::new(0x40_0123, &image, false).rva(), 0x123);
        assert_eq!(NormalizedAddress::new(0x7f00_0000, &image, true).rva(), 0x7f00_0000);
    }
}
