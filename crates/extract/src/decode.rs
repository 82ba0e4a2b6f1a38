use encoding_rs::Encoding;

/// Decodes a body with its declared encoding. Unknown labels, missing
/// declarations and malformed sequences all degrade to UTF-8 with
/// replacement characters; decoding never fails.
pub fn decode_body(body: &[u8], declared: Option<&str>) -> String {
    if let Some(label) = declared {
        if let Some(encoding) = Encoding::for_label(label.trim().as_bytes()) {
            let (text, _, _) = encoding.decode(body);
            return text.into_owned();
        }
    }
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_encoding_is_honoured() {
        // "你好" in GBK
        let body = [0xc4, 0xe3, 0xba, 0xc3];
        assert_eq!(decode_body(&body, Some("gbk")), "你好");
        assert_eq!(decode_body(&body, Some("GBK")), "你好");
    }

    #[test]
    fn test_unknown_label_falls_back_to_utf8() {
        assert_eq!(decode_body("héllo".as_bytes(), Some("no-such-charset")), "héllo");
        assert_eq!(decode_body("héllo".as_bytes(), None), "héllo");
    }

    #[test]
    fn test_malformed_bytes_are_replaced() {
        let decoded = decode_body(&[0x68, 0x69, 0xff, 0xfe], None);
        assert!(decoded.starts_with("hi"));
        assert!(decoded.contains('\u{FFFD}'));
    }
}
