use crate::error::{Code, Error};

/// Attribute type numbers this proxy inspects or rewrites (RFC 2865 §5, RFC
/// 2548 §2.4).
pub mod attr {
    pub const USER_NAME: u8 = 1;
    pub const USER_PASSWORD: u8 = 2;
    pub const NAS_IP_ADDRESS: u8 = 4;
    pub const NAS_PORT: u8 = 5;
    pub const REPLY_MESSAGE: u8 = 18;
    pub const STATE: u8 = 24;
    pub const VENDOR_SPECIFIC: u8 = 26;
    pub const TUNNEL_PASSWORD: u8 = 69;
    pub const MESSAGE_AUTHENTICATOR: u8 = 80;

    /// Microsoft vendor-id (RFC 2548).
    pub const VENDOR_MICROSOFT: u32 = 311;
    pub const MS_MPPE_SEND_KEY: u8 = 16;
    pub const MS_MPPE_RECV_KEY: u8 = 17;
}

/// A single decoded attribute TLV: `type`, `length` (implied by `value.len() +
/// 2`), `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(kind: u8, value: impl Into<Vec<u8>>) -> Self {
        Self { kind, value: value.into() }
    }

    fn wire_len(&self) -> usize {
        2 + self.value.len()
    }
}

/// A sub-attribute inside a Vendor-Specific attribute's value (RFC 2865 §5.26).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorAttribute {
    pub vendor_id: u32,
    pub kind: u8,
    pub value: Vec<u8>,
}

/// A decoded RADIUS packet (RFC 2865 §3).
///
/// Attributes are held as an ordered, owned list rather than a borrowed view
/// into the wire buffer: unlike a STUN/TURN message, a RADIUS packet
/// forwarded by this proxy is nearly always mutated in place (password
/// re-encryption, ID remapping, Message-Authenticator recomputation) before
/// it is re-encoded, so there is little to gain from zero-copy decoding here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadiusMessage {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

const HEADER_LEN: usize = 20;
pub const MIN_PACKET_LEN: usize = HEADER_LEN;
pub const MAX_PACKET_LEN: usize = 4096;

impl RadiusMessage {
    /// Peek the declared packet length without fully decoding it.
    ///
    /// Used by the TLS framing reader, where the header's length field IS the
    /// frame length (spec §4.5).
    ///
    /// ```
    /// use radsecproxy_codec::message::RadiusMessage;
    ///
    /// let header = [0x01u8, 0x05, 0x00, 0x19];
    /// assert_eq!(RadiusMessage::peek_length(&header).unwrap(), 25);
    /// ```
    pub fn peek_length(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::TooShort(bytes.len()));
        }

        Ok(u16::from_be_bytes([bytes[2], bytes[3]]) as usize)
    }

    /// Decode a complete RADIUS packet.
    ///
    /// Rejects packets shorter than 20 bytes, a declared length outside
    /// `[20, 4096]`, or a declared length exceeding the bytes actually
    /// received. Trailing bytes beyond the declared length are accepted (the
    /// caller logs this as padding). A single leftover byte after the last
    /// complete attribute (too short to be another TLV header) is logged as
    /// a warning and the packet is still accepted; any other malformed
    /// attribute TLV is rejected.
    ///
    /// ```
    /// use radsecproxy_codec::message::{RadiusMessage, attr};
    ///
    /// let buffer = [
    ///     0x01, 0x05, 0x00, 0x19,
    ///     0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    ///     0x01, 0x05, b'b', b'o', b'b',
    /// ];
    ///
    /// let message = RadiusMessage::decode(&buffer).unwrap();
    /// assert_eq!(message.identifier, 5);
    /// assert_eq!(message.get(attr::USER_NAME).unwrap(), b"bob");
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort(bytes.len()));
        }

        let code = Code::try_from(bytes[0])?;
        let identifier = bytes[1];
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        if declared < HEADER_LEN || declared > bytes.len() {
            return Err(Error::LengthMismatch { declared, actual: bytes.len() });
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&bytes[4..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < declared {
            if declared - offset < 2 {
                log::warn!("{}", Error::TrailingGarbage(declared - offset));
                break;
            }

            let kind = bytes[offset];
            let len = bytes[offset + 1] as usize;
            if len < 2 || offset + len > declared {
                return Err(Error::BadAttribute(offset));
            }

            attributes.push(Attribute::new(kind, &bytes[offset + 2..offset + len]));
            offset += len;
        }

        Ok(Self { code, identifier, authenticator, attributes })
    }

    /// Re-encode into a fresh byte buffer.
    pub fn encode(&self) -> Vec<u8> {
        let total = HEADER_LEN + self.attributes.iter().map(Attribute::wire_len).sum::<usize>();

        let mut out = Vec::with_capacity(total);
        out.push(self.code.into());
        out.push(self.identifier);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.extend_from_slice(&self.authenticator);

        for attribute in &self.attributes {
            out.push(attribute.kind);
            out.push(attribute.wire_len() as u8);
            out.extend_from_slice(&attribute.value);
        }

        out
    }

    /// First attribute of the given type, if present.
    pub fn get(&self, kind: u8) -> Option<&[u8]> {
        self.attributes.iter().find(|a| a.kind == kind).map(|a| a.value.as_slice())
    }

    /// All attributes of the given type, in wire order.
    pub fn get_all(&self, kind: u8) -> impl Iterator<Item = &[u8]> {
        self.attributes.iter().filter(move |a| a.kind == kind).map(|a| a.value.as_slice())
    }

    pub fn user_name(&self) -> Option<&str> {
        std::str::from_utf8(self.get(attr::USER_NAME)?).ok()
    }

    /// Walk every Vendor-Specific attribute belonging to `vendor_id`,
    /// decoding its (sub-type, sub-value) sub-attributes (RFC 2865 §5.26).
    pub fn vendor_attributes(&self, vendor_id: u32) -> Vec<VendorAttribute> {
        let mut out = Vec::new();

        for value in self.get_all(attr::VENDOR_SPECIFIC) {
            if value.len() < 4 {
                continue;
            }

            let id = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            if id != vendor_id {
                continue;
            }

            let mut offset = 4;
            while offset + 2 <= value.len() {
                let kind = value[offset];
                let len = value[offset + 1] as usize;
                if len < 2 || offset + len > value.len() {
                    break;
                }

                out.push(VendorAttribute {
                    vendor_id: id,
                    kind,
                    value: value[offset + 2..offset + len].to_vec(),
                });

                offset += len;
            }
        }

        out
    }

    /// Replace every sub-attribute of `kind` inside `vendor_id`'s
    /// Vendor-Specific attributes with `new_value`, preserving attribute
    /// order. No-op if no matching sub-attribute exists.
    pub fn set_vendor_attribute(&mut self, vendor_id: u32, kind: u8, new_value: &[u8]) {
        for attribute in self.attributes.iter_mut().filter(|a| a.kind == attr::VENDOR_SPECIFIC) {
            if attribute.value.len() < 4 {
                continue;
            }

            let id = u32::from_be_bytes([
                attribute.value[0],
                attribute.value[1],
                attribute.value[2],
                attribute.value[3],
            ]);
            if id != vendor_id {
                continue;
            }

            let mut rebuilt = attribute.value[..4].to_vec();
            let mut offset = 4;
            while offset + 2 <= attribute.value.len() {
                let sub_kind = attribute.value[offset];
                let len = attribute.value[offset + 1] as usize;
                if len < 2 || offset + len > attribute.value.len() {
                    break;
                }

                if sub_kind == kind {
                    rebuilt.push(sub_kind);
                    rebuilt.push((2 + new_value.len()) as u8);
                    rebuilt.extend_from_slice(new_value);
                } else {
                    rebuilt.extend_from_slice(&attribute.value[offset..offset + len]);
                }

                offset += len;
            }

            attribute.value = rebuilt;
        }
    }
}
