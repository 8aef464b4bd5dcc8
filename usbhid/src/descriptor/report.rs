use std::ops::Deref;

/// The largest report descriptor requested from a device.
pub const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

/// The raw report descriptor of a HID interface.
///
/// This crate does not interpret report descriptors itself. [`Self::parse`]
/// hands the bytes to [`hidreport`].
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ReportDescriptor(Vec<u8>);

impl ReportDescriptor {
    /// Parses the descriptor into its reports and fields.
    pub fn parse(&self) -> Result<hidreport::ReportDescriptor, hidreport::ParserError> {
        hidreport::ReportDescriptor::try_from(self.0.as_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for ReportDescriptor {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Deref for ReportDescriptor {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use hidreport::Report;

    use super::*;

    // A boot mouse: three buttons plus relative X/Y.
    const MOUSE: [u8; 50] = [
        0x05, 0x01, 0x09, 0x02, 0xa1, 0x01, 0x09, 0x01, 0xa1, 0x00, 0x05, 0x09, 0x19, 0x01, 0x29,
        0x03, 0x15, 0x00, 0x25, 0x01, 0x95, 0x03, 0x75, 0x01, 0x81, 0x02, 0x95, 0x01, 0x75, 0x05,
        0x81, 0x01, 0x05, 0x01, 0x09, 0x30, 0x09, 0x31, 0x15, 0x81, 0x25, 0x7f, 0x75, 0x08, 0x95,
        0x02, 0x81, 0x06, 0xc0, 0xc0,
    ];

    #[test]
    fn parses_through_hidreport() {
        let desc = ReportDescriptor::from(MOUSE.to_vec());
        assert_eq!(desc.len(), MOUSE.len());

        let parsed = desc.parse().unwrap();
        let reports = parsed.input_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].size_in_bytes(), 3);
    }
}
