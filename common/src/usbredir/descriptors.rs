//! USB descriptor construction (spec section 4.3, section 6 "Emulated USB
//! device identity"). Byte-exact where the guest driver actually inspects
//! the fields.

pub const VENDOR_ID: u16 = 0x2B23;
pub const PRODUCT_ID: u16 = 0xCDCD;
pub const BCD_USB: u16 = 0x0200;
pub const MAX_PACKET_SIZE0: u8 = 64;

pub const INTERFACE_CLASS_MASS_STORAGE: u8 = 0x08;
pub const INTERFACE_SUBCLASS_SCSI: u8 = 0x06;
pub const INTERFACE_PROTOCOL_BULK_ONLY: u8 = 0x50;

pub const ENDPOINT_BULK_IN: u8 = 0x81;
pub const ENDPOINT_BULK_OUT: u8 = 0x02;
pub const ENDPOINT_MAX_PACKET_SIZE: u16 = 512;

pub const STRING_INDEX_MANUFACTURER: u8 = 1;
pub const STRING_INDEX_PRODUCT: u8 = 2;
pub const STRING_INDEX_SERIAL: u8 = 3;
pub const LANGUAGE_US_ENGLISH: u16 = 0x0409;

/// The 18-byte USB device descriptor (spec section 4.3).
pub fn device_descriptor() -> [u8; 18] {
    let mut d = [0u8; 18];
    d[0] = 18; // bLength
    d[1] = 0x01; // bDescriptorType = DEVICE
    d[2..4].copy_from_slice(&BCD_USB.to_le_bytes());
    d[4] = 0; // bDeviceClass (per-interface)
    d[5] = 0; // bDeviceSubClass
    d[6] = 0; // bDeviceProtocol
    d[7] = MAX_PACKET_SIZE0;
    d[8..10].copy_from_slice(&VENDOR_ID.to_le_bytes());
    d[10..12].copy_from_slice(&PRODUCT_ID.to_le_bytes());
    d[12..14].copy_from_slice(&0x0100u16.to_le_bytes()); // bcdDevice
    d[14] = STRING_INDEX_MANUFACTURER;
    d[15] = STRING_INDEX_PRODUCT;
    d[16] = STRING_INDEX_SERIAL;
    d[17] = 1; // bNumConfigurations
    d
}

/// The 32-byte configuration descriptor: configuration (9) + interface (9)
/// + two bulk endpoints (7 each) (spec section 4.3).
pub fn configuration_descriptor() -> [u8; 32] {
    let mut d = [0u8; 32];

    d[0] = 9; // bLength
    d[1] = 0x02; // bDescriptorType = CONFIGURATION
    d[2..4].copy_from_slice(&32u16.to_le_bytes()); // wTotalLength
    d[4] = 1; // bNumInterfaces
    d[5] = 1; // bConfigurationValue
    d[6] = 0; // iConfiguration
    d[7] = 0x80; // bmAttributes (bus-powered)
    d[8] = 50; // bMaxPower (100 mA)

    d[9] = 9; // bLength
    d[10] = 0x04; // bDescriptorType = INTERFACE
    d[11] = 0; // bInterfaceNumber
    d[12] = 0; // bAlternateSetting
    d[13] = 2; // bNumEndpoints
    d[14] = INTERFACE_CLASS_MASS_STORAGE;
    d[15] = INTERFACE_SUBCLASS_SCSI;
    d[16] = INTERFACE_PROTOCOL_BULK_ONLY;
    d[17] = 0; // iInterface

    d[18] = 7; // bLength
    d[19] = 0x05; // bDescriptorType = ENDPOINT
    d[20] = ENDPOINT_BULK_IN;
    d[21] = 0x02; // bmAttributes = bulk
    d[22..24].copy_from_slice(&ENDPOINT_MAX_PACKET_SIZE.to_le_bytes());
    d[24] = 0; // bInterval

    d[25] = 7; // bLength
    d[26] = 0x05; // bDescriptorType = ENDPOINT
    d[27] = ENDPOINT_BULK_OUT;
    d[28] = 0x02; // bmAttributes = bulk
    d[29..31].copy_from_slice(&ENDPOINT_MAX_PACKET_SIZE.to_le_bytes());
    d[31] = 0; // bInterval

    d
}

/// Encode a USB string descriptor: `bLength, bDescriptorType=0x03` followed
/// by UTF-16LE code units.
pub fn string_descriptor(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut out = Vec::with_capacity(2 + units.len() * 2);
    out.push((2 + units.len() * 2) as u8);
    out.push(0x03);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// String descriptor zero: the list of supported language IDs.
pub fn language_descriptor() -> Vec<u8> {
    let mut out = vec![4u8, 0x03];
    out.extend_from_slice(&LANGUAGE_US_ENGLISH.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_matches_spec_identity() {
        let d = device_descriptor();
        assert_eq!(d[0], 18);
        assert_eq!(u16::from_le_bytes(d[8..10].try_into().unwrap()), VENDOR_ID);
        assert_eq!(u16::from_le_bytes(d[10..12].try_into().unwrap()), PRODUCT_ID);
        assert_eq!(d[7], MAX_PACKET_SIZE0);
        assert_eq!(u16::from_le_bytes(d[2..4].try_into().unwrap()), BCD_USB);
    }

    #[test]
    fn configuration_descriptor_declares_two_bulk_endpoints() {
        let d = configuration_descriptor();
        assert_eq!(u16::from_le_bytes(d[2..4].try_into().unwrap()), 32);
        assert_eq!(d[14], INTERFACE_CLASS_MASS_STORAGE);
        assert_eq!(d[15], INTERFACE_SUBCLASS_SCSI);
        assert_eq!(d[16], INTERFACE_PROTOCOL_BULK_ONLY);
        assert_eq!(d[20], ENDPOINT_BULK_IN);
        assert_eq!(d[27], ENDPOINT_BULK_OUT);
        assert_eq!(u16::from_le_bytes(d[22..24].try_into().unwrap()), 512);
    }

    #[test]
    fn string_descriptor_encodes_ascii_as_utf16le() {
        let d = string_descriptor("Hi");
        assert_eq!(d[0], 6);
        assert_eq!(d[1], 0x03);
        assert_eq!(&d[2..], &[b'H', 0, b'i', 0]);
    }
}
