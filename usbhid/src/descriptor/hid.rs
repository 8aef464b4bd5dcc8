use std::fmt;

use thiserror::Error;

use crate::request::DescriptorType;

/// The length of a HID descriptor announcing exactly one class descriptor.
pub const HID_DESCRIPTOR_LENGTH: usize = 9;

/// The number of bytes every class descriptor entry past the first occupies.
pub const CLASS_DESCRIPTOR_ENTRY_LENGTH: usize = 3;

/// An entry of the class descriptor list of a HID descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClassDescriptor {
    /// The type of the class descriptor, usually [`DescriptorType::Report`].
    pub descriptor_type: u8,

    /// The total length of the class descriptor.
    pub length: u16,
}

/// The HID descriptor of an interface.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct HidDescriptor {
    /// `bLength`: the total size of the descriptor.
    pub length: u8,

    /// `bDescriptorType`: always [`DescriptorType::Hid`].
    pub descriptor_type: u8,

    /// `bcdHID`: the HID class specification release.
    pub hid_version: u16,

    /// `bCountryCode`: the country code of localized hardware, `0` if the
    /// hardware is not localized.
    pub country_code: u8,

    /// `bNumDescriptors`: the number of class descriptors, at least one.
    pub num_descriptors: u8,

    /// The type of the first (mandatory) class descriptor.
    pub class_descriptor_type: u8,

    /// The length of the first class descriptor.
    pub class_descriptor_length: u16,

    /// Every class descriptor past the first one.
    pub optional_descriptors: Vec<ClassDescriptor>,
}

impl HidDescriptor {
    /// Decodes a complete HID descriptor.
    ///
    /// Every class descriptor announced by `bNumDescriptors` must be present.
    pub fn decode(buf: &[u8]) -> Result<Self, HidDescriptorError> {
        Self::decode_inner(buf, false)
    }

    /// Decodes the fixed header of a HID descriptor, plus as many optional
    /// class descriptor entries as `buf` happens to contain.
    ///
    /// This is used for the first request of a two-phase retrieval, where
    /// the buffer is sized for a single class descriptor.
    pub fn decode_prefix(buf: &[u8]) -> Result<Self, HidDescriptorError> {
        Self::decode_inner(buf, true)
    }

    fn decode_inner(buf: &[u8], allow_short: bool) -> Result<Self, HidDescriptorError> {
        let Some(header) = buf.get(..HID_DESCRIPTOR_LENGTH) else {
            return Err(HidDescriptorError::Truncated {
                expected: HID_DESCRIPTOR_LENGTH,
                actual: buf.len(),
            });
        };

        if header[1] != u8::from(DescriptorType::Hid) {
            return Err(HidDescriptorError::InvalidType(header[1]));
        }

        let mut desc = Self {
            length: header[0],
            descriptor_type: header[1],
            hid_version: u16::from_le_bytes([header[2], header[3]]),
            country_code: header[4],
            num_descriptors: header[5],
            class_descriptor_type: header[6],
            class_descriptor_length: u16::from_le_bytes([header[7], header[8]]),
            optional_descriptors: Vec::new(),
        };

        let expected = desc.total_length();
        if buf.len() < expected && !allow_short {
            return Err(HidDescriptorError::Truncated {
                expected,
                actual: buf.len(),
            });
        }

        desc.optional_descriptors = buf[HID_DESCRIPTOR_LENGTH..buf.len().min(expected)]
            .chunks_exact(CLASS_DESCRIPTOR_ENTRY_LENGTH)
            .map(|entry| ClassDescriptor {
                descriptor_type: entry[0],
                length: u16::from_le_bytes([entry[1], entry[2]]),
            })
            .collect();

        Ok(desc)
    }

    /// The number of bytes the complete descriptor occupies, as derived from
    /// `bNumDescriptors`.
    pub fn total_length(&self) -> usize {
        let extra = usize::from(self.num_descriptors.saturating_sub(1));
        HID_DESCRIPTOR_LENGTH + extra * CLASS_DESCRIPTOR_ENTRY_LENGTH
    }

    /// Whether every announced class descriptor entry has been decoded.
    pub fn is_complete(&self) -> bool {
        self.optional_descriptors.len() + 1 >= usize::from(self.num_descriptors)
    }

    /// Iterates over all class descriptors, starting with the mandatory one.
    pub fn class_descriptors(&self) -> impl Iterator<Item = ClassDescriptor> {
        std::iter::once(ClassDescriptor {
            descriptor_type: self.class_descriptor_type,
            length: self.class_descriptor_length,
        })
        .chain(self.optional_descriptors.iter().copied())
    }

    /// The announced length of the report descriptor, if any.
    pub fn report_descriptor_length(&self) -> Option<u16> {
        self.class_descriptors()
            .find(|desc| desc.descriptor_type == u8::from(DescriptorType::Report))
            .map(|desc| desc.length)
    }
}

impl fmt::Debug for HidDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [maj, min] = self.hid_version.to_be_bytes();
        f.debug_struct(stringify!(HidDescriptor))
            .field("length", &self.length)
            .field("hid_version", &format_args!("{:x}.{:02x}", maj, min))
            .field("country_code", &self.country_code)
            .field("num_descriptors", &self.num_descriptors)
            .field(
                "class_descriptor_type",
                &format_args!("{:#04x}", self.class_descriptor_type),
            )
            .field("class_descriptor_length", &self.class_descriptor_length)
            .field("optional_descriptors", &self.optional_descriptors)
            .finish()
    }
}

/// Represents an error that occurred when decoding a HID descriptor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HidDescriptorError {
    /// Indicates that fewer bytes were available than the descriptor needs.
    #[error("the HID descriptor is truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Indicates that the descriptor type byte is not `0x21`.
    #[error("unexpected descriptor type {0:#04x}")]
    InvalidType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: [u8; 9] = [0x09, 0x21, 0x10, 0x01, 0x01, 0x01, 0x22, 0x3f, 0x00];
    const TRIPLE: [u8; 15] = [
        0x0f, 0x21, 0x10, 0x01, 0x01, 0x03, 0x22, 0x3f, 0x00, 0x22, 0x41, 0x00, 0x22, 0x42, 0x00,
    ];

    #[test]
    fn decodes_single_class_descriptor() {
        let desc = HidDescriptor::decode(&SINGLE).unwrap();
        assert_eq!(desc.length, 9);
        assert_eq!(desc.hid_version, 0x0110);
        assert_eq!(desc.country_code, 1);
        assert_eq!(desc.num_descriptors, 1);
        assert_eq!(desc.class_descriptor_type, 0x22);
        assert_eq!(desc.class_descriptor_length, 0x3f);
        assert!(desc.optional_descriptors.is_empty());
        assert!(desc.is_complete());
        assert_eq!(desc.report_descriptor_length(), Some(0x3f));
    }

    #[test]
    fn prefix_tolerates_missing_entries() {
        let desc = HidDescriptor::decode_prefix(&TRIPLE[..9]).unwrap();
        assert_eq!(desc.num_descriptors, 3);
        assert_eq!(desc.total_length(), 15);
        assert!(desc.optional_descriptors.is_empty());
        assert!(!desc.is_complete());

        // A prefix that already holds part of the list keeps what is there.
        let desc = HidDescriptor::decode_prefix(&TRIPLE[..13]).unwrap();
        assert_eq!(desc.optional_descriptors.len(), 1);
    }

    #[test]
    fn full_decode_requires_every_entry() {
        assert_eq!(
            HidDescriptor::decode(&TRIPLE[..12]),
            Err(HidDescriptorError::Truncated {
                expected: 15,
                actual: 12
            })
        );

        let desc = HidDescriptor::decode(&TRIPLE).unwrap();
        assert_eq!(
            desc.optional_descriptors,
            vec![
                ClassDescriptor {
                    descriptor_type: 0x22,
                    length: 0x41
                },
                ClassDescriptor {
                    descriptor_type: 0x22,
                    length: 0x42
                },
            ]
        );
        assert_eq!(desc.class_descriptors().count(), 3);
    }

    #[test]
    fn rejects_short_header_and_wrong_type() {
        assert_eq!(
            HidDescriptor::decode_prefix(&SINGLE[..5]),
            Err(HidDescriptorError::Truncated {
                expected: 9,
                actual: 5
            })
        );

        let mut wrong = SINGLE;
        wrong[1] = 0x04;
        assert_eq!(
            HidDescriptor::decode(&wrong),
            Err(HidDescriptorError::InvalidType(0x04))
        );
    }

    #[test]
    fn debug_shows_bcd_version() {
        let desc = HidDescriptor::decode(&SINGLE).unwrap();
        assert!(format!("{:?}", desc).contains("hid_version: 1.10"));
    }
}
