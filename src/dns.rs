// DNS wire format parser.
//
// Parses the header, question section (with name decompression), and answer
// section of packets seen on port 53. Bounded against adversarial input: a
// pointer-depth cap and a total bytes-read cap reject compression loops.

use std::net::Ipv6Addr;

use crate::error::NetWatchError;

/// Maximum pointer hops allowed during name decompression.
const MAX_POINTER_DEPTH: usize = 10;

/// Maximum allowed label length per RFC 1035 Section 2.3.4.
const MAX_LABEL_LENGTH: usize = 63;

/// DNS header size in bytes.
const HEADER_SIZE: usize = 12;

// Record type constants.
const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_SRV: u16 = 33;

/// Textual tag for a record type, `TYPE_<n>` for anything unrecognized.
pub fn record_type_tag(rtype: u16) -> String {
    match rtype {
        TYPE_A => "A".to_string(),
        TYPE_NS => "NS".to_string(),
        TYPE_CNAME => "CNAME".to_string(),
        TYPE_SOA => "SOA".to_string(),
        TYPE_PTR => "PTR".to_string(),
        TYPE_MX => "MX".to_string(),
        TYPE_TXT => "TXT".to_string(),
        TYPE_AAAA => "AAAA".to_string(),
        TYPE_SRV => "SRV".to_string(),
        n => format!("TYPE_{n}"),
    }
}

/// A single question entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    /// Textual record-type tag (A, AAAA, ..., TYPE_<n>).
    pub qtype: String,
}

/// Parsed DNS message, reduced to what the recorder persists.
#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub is_response: bool,
    pub questions: Vec<DnsQuestion>,
    /// A/AAAA answer RDATA rendered as printable addresses.
    pub answers: Vec<String>,
    /// CNAME answer RDATA rendered as names.
    pub cnames: Vec<String>,
}

/// Parse a DNS message from its wire format representation.
///
/// `payload` begins at the DNS header (the UDP payload for DNS-over-UDP).
/// If an answer record is unparseable, answers already parsed are kept and
/// the remainder of the answer section is skipped.
pub fn parse_dns(payload: &[u8]) -> Result<DnsMessage, NetWatchError> {
    if payload.len() < HEADER_SIZE {
        return Err(NetWatchError::DnsParse {
            offset: 0,
            detail: "truncated DNS header".to_string(),
        });
    }

    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;

    let is_response = (flags >> 15) & 1 == 1;

    let mut offset = HEADER_SIZE;

    // -- Question section --
    let mut questions = Vec::with_capacity(qdcount.min(4));
    for _ in 0..qdcount {
        let (name, new_offset) = decompress_name(payload, offset)?;
        offset = new_offset;

        if offset + 4 > payload.len() {
            return Err(NetWatchError::DnsParse {
                offset,
                detail: "truncated question section".to_string(),
            });
        }

        let qtype = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        offset += 4; // QTYPE + QCLASS

        questions.push(DnsQuestion {
            name,
            qtype: record_type_tag(qtype),
        });
    }

    // -- Answer section --
    // A malformed record aborts the rest of the section but keeps what was
    // already extracted.
    let mut answers = Vec::new();
    let mut cnames = Vec::new();
    for _ in 0..ancount {
        match parse_answer(payload, offset) {
            Ok((answer, new_offset)) => {
                offset = new_offset;
                match answer {
                    AnswerData::Address(addr) => answers.push(addr),
                    AnswerData::Cname(name) => cnames.push(name),
                    AnswerData::Other => {}
                }
            }
            Err(e) => {
                log::debug!("DNS answer parse aborted: {e}");
                break;
            }
        }
    }

    Ok(DnsMessage {
        is_response,
        questions,
        answers,
        cnames,
    })
}

enum AnswerData {
    /// A or AAAA RDATA as a printable address.
    Address(String),
    /// CNAME RDATA as a name.
    Cname(String),
    Other,
}

/// Parse one answer resource record starting at `offset`. Returns the
/// extracted data and the offset immediately after the record.
fn parse_answer(buf: &[u8], offset: usize) -> Result<(AnswerData, usize), NetWatchError> {
    let (_name, mut offset) = decompress_name(buf, offset)?;

    if offset + 10 > buf.len() {
        return Err(NetWatchError::DnsParse {
            offset,
            detail: "truncated resource record header".to_string(),
        });
    }

    let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
    offset += 10;

    if offset + rdlength > buf.len() {
        return Err(NetWatchError::DnsParse {
            offset,
            detail: "truncated resource record rdata".to_string(),
        });
    }

    let data = match rtype {
        TYPE_A => {
            if rdlength != 4 {
                return Err(NetWatchError::DnsParse {
                    offset,
                    detail: format!("A record rdata length {rdlength} != 4"),
                });
            }
            AnswerData::Address(format!(
                "{}.{}.{}.{}",
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3]
            ))
        }
        TYPE_AAAA => {
            if rdlength != 16 {
                return Err(NetWatchError::DnsParse {
                    offset,
                    detail: format!("AAAA record rdata length {rdlength} != 16"),
                });
            }
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&buf[offset..offset + 16]);
            AnswerData::Address(Ipv6Addr::from(bytes).to_string())
        }
        TYPE_CNAME => {
            let (name, _) = decompress_name(buf, offset)?;
            AnswerData::Cname(name)
        }
        _ => AnswerData::Other,
    };

    Ok((data, offset + rdlength))
}

/// Decompress a DNS name starting at `offset` in `buf`.
///
/// Follows RFC 1035 Section 4.1.4 compression with two caps: at most
/// [`MAX_POINTER_DEPTH`] pointer hops, and no more total bytes read than the
/// buffer holds. Returns the name (no trailing dot) and the offset
/// immediately after the name field.
fn decompress_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), NetWatchError> {
    let mut name = String::new();
    let mut followed_pointer = false;
    let mut end_offset = 0;
    let mut hops = 0usize;
    let mut bytes_read = 0usize;

    loop {
        if offset >= buf.len() {
            return Err(NetWatchError::DnsParse {
                offset,
                detail: "truncated name".to_string(),
            });
        }
        if bytes_read > buf.len() {
            return Err(NetWatchError::DnsParse {
                offset,
                detail: "name exceeds message size".to_string(),
            });
        }

        let len = buf[offset] as usize;

        if len == 0 {
            if !followed_pointer {
                end_offset = offset + 1;
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            // Compression pointer (2 bytes).
            if offset + 1 >= buf.len() {
                return Err(NetWatchError::DnsParse {
                    offset,
                    detail: "truncated compression pointer".to_string(),
                });
            }
            hops += 1;
            if hops > MAX_POINTER_DEPTH {
                return Err(NetWatchError::DnsParse {
                    offset,
                    detail: "compression pointer depth exceeded".to_string(),
                });
            }
            if !followed_pointer {
                end_offset = offset + 2;
            }
            offset = ((len & 0x3F) << 8) | (buf[offset + 1] as usize);
            followed_pointer = true;
            bytes_read += 2;
            continue;
        }

        if len > MAX_LABEL_LENGTH {
            return Err(NetWatchError::DnsParse {
                offset,
                detail: format!("label length {len} exceeds maximum of {MAX_LABEL_LENGTH}"),
            });
        }

        offset += 1;
        if offset + len > buf.len() {
            return Err(NetWatchError::DnsParse {
                offset,
                detail: "truncated label".to_string(),
            });
        }

        let label =
            std::str::from_utf8(&buf[offset..offset + len]).map_err(|_| NetWatchError::DnsParse {
                offset,
                detail: "invalid UTF-8 in label".to_string(),
            })?;

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        offset += len;
        bytes_read += 1 + len;
    }

    Ok((name, end_offset))
}
