// TLS ClientHello parser: extracts the server_name (SNI) extension.
//
// Only the first record of the payload is inspected; reads are bounded by
// both the stated record_length and the captured payload. Any malformed
// length aborts with `None`.

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Extension type for server_name.
const EXT_SERVER_NAME: u16 = 0;

/// host_name type inside the server_name extension.
const SNI_TYPE_HOSTNAME: u8 = 0;

/// Extract the SNI hostname from a TCP payload that starts with a TLS
/// handshake record. Returns `None` for anything that is not a well-formed
/// ClientHello carrying a server_name extension.
pub fn parse_client_hello_sni(payload: &[u8]) -> Option<String> {
    // Record header: content_type(1) + version(2) + length(2)
    if payload.len() < 5 {
        return None;
    }
    if payload[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    // Record versions 3.0 (SSLv3 framing used by TLS 1.0+) through 3.4.
    if payload[1] != 3 || payload[2] > 4 {
        return None;
    }

    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    // Never read past the stated record length, nor past what was captured.
    let record = &payload[5..payload.len().min(5 + record_len)];

    // Handshake header: msg_type(1) + length(3)
    if record.len() < 4 || record[0] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let hs_len =
        ((record[1] as usize) << 16) | ((record[2] as usize) << 8) | (record[3] as usize);
    let body = &record[4..record.len().min(4 + hs_len)];

    // client_version(2) + random(32)
    let mut pos = 34;
    if body.len() < pos + 1 {
        return None;
    }

    // session_id
    let sid_len = body[pos] as usize;
    pos += 1 + sid_len;

    // cipher_suites
    if body.len() < pos + 2 {
        return None;
    }
    let cs_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2 + cs_len;

    // compression_methods
    if body.len() < pos + 1 {
        return None;
    }
    let cm_len = body[pos] as usize;
    pos += 1 + cm_len;

    // extensions
    if body.len() < pos + 2 {
        return None;
    }
    let ext_total = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    let ext_end = body.len().min(pos + ext_total);

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > ext_end {
            return None;
        }

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name_list(&body[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

/// Parse the server_name extension body: list_length(2) then entries of
/// name_type(1) + name_length(2) + name. Returns the first host_name entry.
fn parse_server_name_list(ext: &[u8]) -> Option<String> {
    if ext.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    let list = &ext[2..ext.len().min(2 + list_len)];

    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > list.len() {
            return None;
        }
        if name_type == SNI_TYPE_HOSTNAME {
            let name = std::str::from_utf8(&list[pos..pos + name_len]).ok()?;
            if name.is_empty() {
                return None;
            }
            return Some(name.to_string());
        }
        pos += name_len;
    }

    None
}

/// Build a minimal ClientHello record carrying `sni`. Shared by the tests
/// here and in the session module.
#[cfg(test)]
pub fn tests_build_client_hello(sni: &str) -> Vec<u8> {
    tests::build_client_hello(Some(sni))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Helper: build a minimal ClientHello record carrying `sni`.
    // ---------------------------------------------------------------
    pub(super) fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id length
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites length
        body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        body.push(1); // compression_methods length
        body.push(0); // null compression

        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let mut entry = Vec::new();
            entry.push(SNI_TYPE_HOSTNAME);
            entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
            entry.extend_from_slice(name.as_bytes());

            let mut ext_body = Vec::new();
            ext_body.extend_from_slice(&(entry.len() as u16).to_be_bytes()); // list length
            ext_body.extend_from_slice(&entry);

            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext_body);
        }
        // A padding-ish extension after SNI to prove the walk stops correctly.
        extensions.extend_from_slice(&21u16.to_be_bytes());
        extensions.extend_from_slice(&2u16.to_be_bytes());
        extensions.extend_from_slice(&[0, 0]);

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]); // record version TLS 1.0
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_hostname() {
        let payload = build_client_hello(Some("www.example.com"));
        assert_eq!(
            parse_client_hello_sni(&payload).as_deref(),
            Some("www.example.com")
        );
    }

    #[test]
    fn no_sni_extension_yields_none() {
        let payload = build_client_hello(None);
        assert!(parse_client_hello_sni(&payload).is_none());
    }

    #[test]
    fn non_handshake_record_yields_none() {
        let mut payload = build_client_hello(Some("www.example.com"));
        payload[0] = 23; // application data
        assert!(parse_client_hello_sni(&payload).is_none());
    }

    #[test]
    fn server_hello_yields_none() {
        let mut payload = build_client_hello(Some("www.example.com"));
        payload[5] = 2; // handshake type ServerHello
        assert!(parse_client_hello_sni(&payload).is_none());
    }

    #[test]
    fn bad_record_version_yields_none() {
        let mut payload = build_client_hello(Some("www.example.com"));
        payload[1] = 2;
        assert!(parse_client_hello_sni(&payload).is_none());
        let mut payload = build_client_hello(Some("www.example.com"));
        payload[2] = 9;
        assert!(parse_client_hello_sni(&payload).is_none());
    }

    #[test]
    fn record_length_beyond_payload_is_safe() {
        // Claim a huge record; the parser must clamp to the captured bytes
        // and fail cleanly rather than read out of bounds.
        let mut payload = build_client_hello(Some("www.example.com"));
        payload[3] = 0xFF;
        payload[4] = 0xFF;
        // Still parses: the clamped slice contains the whole handshake.
        assert_eq!(
            parse_client_hello_sni(&payload).as_deref(),
            Some("www.example.com")
        );

        // Truncate mid-extension as well: must be None, not a panic.
        let truncated = &payload[..payload.len() - 20];
        assert!(parse_client_hello_sni(truncated).is_none());
    }

    #[test]
    fn malformed_extension_length_yields_none() {
        let mut payload = build_client_hello(Some("www.example.com"));
        // Corrupt the SNI extension length to point past the end.
        // Extension block starts after 5 (record) + 4 (handshake) + 34
        // (version+random) + 1 (sid) + 2+2 (ciphers) + 1+1 (compression).
        let ext_len_offset = 5 + 4 + 34 + 1 + 4 + 2 + 2 + 2;
        payload[ext_len_offset] = 0xFF;
        assert!(parse_client_hello_sni(&payload).is_none());
    }

    #[test]
    fn empty_hostname_yields_none() {
        let payload = build_client_hello(Some(""));
        assert!(parse_client_hello_sni(&payload).is_none());
    }

    #[test]
    fn short_payload_yields_none() {
        assert!(parse_client_hello_sni(&[]).is_none());
        assert!(parse_client_hello_sni(&[0x16, 0x03]).is_none());
        assert!(parse_client_hello_sni(&[0x16, 0x03, 0x01, 0x00, 0x05]).is_none());
    }
}
