use radsecproxy_codec::crypto::{
    decrypt_mppe_key, decrypt_password, encrypt_mppe_key, encrypt_password, fill_message_authenticator,
    verify_message_authenticator, verify_response_authenticator, sign_response,
};
use radsecproxy_codec::message::{attr, RadiusMessage, Attribute};
use radsecproxy_codec::Code;

fn sample_request() -> RadiusMessage {
    RadiusMessage {
        code: Code::AccessRequest,
        identifier: 42,
        authenticator: [3u8; 16],
        attributes: vec![Attribute::new(attr::USER_NAME, b"alice@example.com".to_vec())],
    }
}

#[test]
fn decode_is_the_inverse_of_encode() {
    let message = sample_request();
    let bytes = message.encode();
    let decoded = RadiusMessage::decode(&bytes).unwrap();
    assert_eq!(message, decoded);
}

#[test]
fn declared_length_shorter_than_header_is_rejected() {
    let mut bytes = sample_request().encode();
    bytes[2] = 0;
    bytes[3] = 10;
    assert!(RadiusMessage::decode(&bytes).is_err());
}

#[test]
fn declared_length_longer_than_buffer_is_rejected() {
    let mut bytes = sample_request().encode();
    let len = bytes.len() as u16 + 50;
    bytes[2..4].copy_from_slice(&len.to_be_bytes());
    assert!(RadiusMessage::decode(&bytes).is_err());
}

#[test]
fn single_trailing_byte_after_last_attribute_is_accepted() {
    let message = sample_request();
    let mut bytes = message.encode();
    let declared = bytes.len() as u16 + 1;
    bytes[2..4].copy_from_slice(&declared.to_be_bytes());
    bytes.push(0xff);

    let decoded = RadiusMessage::decode(&bytes).unwrap();
    assert_eq!(decoded.attributes, message.attributes);
}

#[test]
fn user_password_round_trips_for_every_valid_length() {
    let secret = b"testing123";
    let authenticator = [5u8; 16];

    for len in (16..=128).step_by(16) {
        let original = vec![0x5Au8; len];
        let mut value = original.clone();

        encrypt_password(&mut value, secret, &authenticator).unwrap();
        assert_ne!(value, original, "len={len}: ciphertext must differ from plaintext");

        decrypt_password(&mut value, secret, &authenticator).unwrap();
        assert_eq!(value, original, "len={len}: round trip must recover plaintext");
    }
}

#[test]
fn user_password_rejects_non_block_aligned_length() {
    let mut value = vec![0u8; 17];
    assert!(encrypt_password(&mut value, b"secret", &[0u8; 16]).is_err());
}

#[test]
fn ms_mppe_key_round_trips_with_arbitrary_salt() {
    let secret = b"testing123";
    let authenticator = [9u8; 16];

    for salt in [[0x00, 0x00], [0x80, 0x01], [0xFF, 0xFF]] {
        let original = vec![0x11u8; 32];
        let mut value = original.clone();

        encrypt_mppe_key(&mut value, secret, &authenticator, salt).unwrap();
        decrypt_mppe_key(&mut value, secret, &authenticator, salt).unwrap();

        assert_eq!(value, original);
    }
}

#[test]
fn message_authenticator_fill_then_verify_succeeds() {
    let mut message = sample_request();
    message.attributes.push(Attribute::new(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16]));

    let mut bytes = message.encode();
    let ma_offset = bytes.len() - 16;

    fill_message_authenticator(&mut bytes, ma_offset, b"sharedsecret").unwrap();
    assert!(verify_message_authenticator(&bytes, ma_offset, b"sharedsecret").unwrap());
}

#[test]
fn message_authenticator_falsified_by_any_bit_flip_outside_the_field() {
    let mut message = sample_request();
    message.attributes.push(Attribute::new(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16]));

    let mut bytes = message.encode();
    let ma_offset = bytes.len() - 16;
    fill_message_authenticator(&mut bytes, ma_offset, b"sharedsecret").unwrap();

    bytes[1] ^= 0x01; // identifier byte, outside the MA field
    assert!(!verify_message_authenticator(&bytes, ma_offset, b"sharedsecret").unwrap());
}

#[test]
fn response_authenticator_sign_then_verify_succeeds() {
    let mut reply = RadiusMessage {
        code: Code::AccessAccept,
        identifier: 42,
        authenticator: [0u8; 16],
        attributes: vec![],
    }
    .encode();

    let request_authenticator = [7u8; 16];
    sign_response(&mut reply, &request_authenticator, b"sharedsecret");
    assert!(verify_response_authenticator(&reply, &request_authenticator, b"sharedsecret"));
}

#[test]
fn response_authenticator_mismatch_is_detected() {
    let mut reply = RadiusMessage {
        code: Code::AccessReject,
        identifier: 1,
        authenticator: [0u8; 16],
        attributes: vec![],
    }
    .encode();

    sign_response(&mut reply, &[1u8; 16], b"secret-a");
    assert!(!verify_response_authenticator(&reply, &[1u8; 16], b"secret-b"));
}

#[test]
fn vendor_specific_round_trips_ms_mppe_keys() {
    let mut vendor_value = Vec::new();
    vendor_value.extend_from_slice(&attr::VENDOR_MICROSOFT.to_be_bytes());
    vendor_value.push(attr::MS_MPPE_SEND_KEY);
    vendor_value.push(2 + 18);
    vendor_value.extend_from_slice(&[0x80, 0x01]);
    vendor_value.extend_from_slice(&[0u8; 16]);

    let message = RadiusMessage {
        code: Code::AccessAccept,
        identifier: 1,
        authenticator: [0u8; 16],
        attributes: vec![Attribute::new(attr::VENDOR_SPECIFIC, vendor_value)],
    };

    let found = message.vendor_attributes(attr::VENDOR_MICROSOFT);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, attr::MS_MPPE_SEND_KEY);
    assert_eq!(found[0].value.len(), 18);
}
