//! implements the client side of the DNS wire protocol

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{BufferError, PacketReader, PacketWriter};

/// Smallest buffer a request packet is assembled into.
pub const DNS_PACKET_MIN_LEN: usize = 512;

/// Fixed DNS header size.
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error, From)]
pub enum ProtocolError {
    Buffer(BufferError),
    /// A record's payload length does not match its type.
    MalformedRecord,
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// `QueryType` represents the requested record type of a query.
///
/// The resolver only asks for (and extracts) address records; everything
/// else is carried as `Unknown` and skipped.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum QueryType {
    Unknown(u16),
    A,    // 1
    Aaaa, // 28
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Aaaa => 28,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            28 => QueryType::Aaaa,
            _ => QueryType::Unknown(num),
        }
    }
}

/// The result code for a DNS response, as described in the RFC.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write(&self, buffer: &mut PacketWriter) {
        buffer.write_u16(self.id);

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        );

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        );

        buffer.write_u16(self.questions);
        buffer.write_u16(self.answers);
        buffer.write_u16(self.authoritative_entries);
        buffer.write_u16(self.resource_entries);
    }

    pub fn read(&mut self, buffer: &mut PacketReader<'_>) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion { name, qtype }
    }

    pub fn write(&self, buffer: &mut PacketWriter) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num());
        buffer.write_u16(1); // class IN

        Ok(())
    }

    pub fn read(&mut self, buffer: &mut PacketReader<'_>) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        let _ = buffer.read_u16()?; // class

        Ok(())
    }
}

/// A resource record as the resolver sees it: address records carry
/// their payload, everything else is skipped over by length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecord {
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: u32,
    },
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: u32,
    },
    Unknown {
        domain: String,
        qtype: u16,
        data_len: u16,
        ttl: u32,
    },
}

impl DnsRecord {
    pub fn read(buffer: &mut PacketReader<'_>) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let _class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        match qtype {
            QueryType::A => {
                if data_len != 4 {
                    return Err(ProtocolError::MalformedRecord);
                }
                let raw_addr = buffer.read_u32()?;
                let addr = Ipv4Addr::from(raw_addr);

                Ok(DnsRecord::A { domain, addr, ttl })
            }
            QueryType::Aaaa => {
                if data_len != 16 {
                    return Err(ProtocolError::MalformedRecord);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(buffer.read_bytes(16)?);
                let addr = Ipv6Addr::from(octets);

                Ok(DnsRecord::Aaaa { domain, addr, ttl })
            }
            QueryType::Unknown(_) => {
                buffer.step(data_len as usize)?;

                Ok(DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    data_len,
                    ttl,
                })
            }
        }
    }

    /// The record's address when it matches the requested family.
    pub fn address_for(&self, family: QueryType) -> Option<(IpAddr, u32)> {
        match (self, family) {
            (DnsRecord::A { addr, ttl, .. }, QueryType::A) => Some((IpAddr::V4(*addr), *ttl)),
            (DnsRecord::Aaaa { addr, ttl, .. }, QueryType::Aaaa) => {
                Some((IpAddr::V6(*addr), *ttl))
            }
            _ => None,
        }
    }
}

/// Representation of a complete DNS packet, as parsed from a response.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn from_bytes(bytes: &[u8]) -> Result<DnsPacket> {
        let mut buffer = PacketReader::new(bytes);
        let mut result = DnsPacket::default();
        result.header.read(&mut buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), QueryType::Unknown(0));
            question.read(&mut buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            result.answers.push(DnsRecord::read(&mut buffer)?);
        }
        for _ in 0..result.header.authoritative_entries {
            result.authorities.push(DnsRecord::read(&mut buffer)?);
        }
        for _ in 0..result.header.resource_entries {
            result.resources.push(DnsRecord::read(&mut buffer)?);
        }

        Ok(result)
    }

    /// All records in answer, authority, additional order.
    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
    }
}

/// Assembles a single-question query packet with recursion desired.
pub fn build_query(id: u16, qname: &str, qtype: QueryType) -> Result<Vec<u8>> {
    let mut header = DnsHeader::new();
    header.id = id;
    header.recursion_desired = true;
    header.questions = 1;

    let mut buffer = PacketWriter::new();
    header.write(&mut buffer);
    DnsQuestion::new(qname.to_string(), qtype).write(&mut buffer)?;

    Ok(buffer.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::buffer::PacketWriter;

    fn answer_packet(id: u16, qname: &str, records: &[DnsRecord]) -> Vec<u8> {
        let mut header = DnsHeader::new();
        header.id = id;
        header.response = true;
        header.recursion_available = true;
        header.questions = 1;
        header.answers = records.len() as u16;

        let mut buffer = PacketWriter::new();
        header.write(&mut buffer);
        DnsQuestion::new(qname.to_string(), QueryType::A)
            .write(&mut buffer)
            .unwrap();
        for record in records {
            buffer.write_qname(qname).unwrap();
            match record {
                DnsRecord::A { addr, ttl, .. } => {
                    buffer.write_u16(1);
                    buffer.write_u16(1);
                    buffer.write_u32(*ttl);
                    buffer.write_u16(4);
                    buffer.write_u32(u32::from(*addr));
                }
                DnsRecord::Aaaa { addr, ttl, .. } => {
                    buffer.write_u16(28);
                    buffer.write_u16(1);
                    buffer.write_u32(*ttl);
                    buffer.write_u16(16);
                    for segment in addr.segments() {
                        buffer.write_u16(segment);
                    }
                }
                DnsRecord::Unknown {
                    qtype,
                    data_len,
                    ttl,
                    ..
                } => {
                    buffer.write_u16(*qtype);
                    buffer.write_u16(1);
                    buffer.write_u32(*ttl);
                    buffer.write_u16(*data_len);
                    for _ in 0..*data_len {
                        buffer.write_u8(0);
                    }
                }
            }
        }
        buffer.into_bytes()
    }

    #[test]
    fn query_roundtrip_preserves_name_and_family() {
        let bytes = build_query(1337, "example.com", QueryType::Aaaa).unwrap();
        assert!(bytes.len() >= HEADER_LEN);

        let packet = DnsPacket::from_bytes(&bytes).unwrap();
        assert_eq!(packet.header.id, 1337);
        assert!(packet.header.recursion_desired);
        assert!(!packet.header.response);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.questions[0].name, "example.com");
        assert_eq!(packet.questions[0].qtype, QueryType::Aaaa);
    }

    #[test]
    fn response_with_a_record_parses() {
        let record = DnsRecord::A {
            domain: "example.test".to_string(),
            addr: "93.184.216.34".parse().unwrap(),
            ttl: 300,
        };
        let bytes = answer_packet(7, "example.test", &[record.clone()]);

        let packet = DnsPacket::from_bytes(&bytes).unwrap();
        assert!(packet.header.response);
        assert_eq!(packet.header.rescode, ResultCode::NOERROR);
        assert_eq!(packet.answers, vec![record]);
        assert_eq!(
            packet.answers[0].address_for(QueryType::A),
            Some(("93.184.216.34".parse().unwrap(), 300))
        );
        assert_eq!(packet.answers[0].address_for(QueryType::Aaaa), None);
    }

    #[test]
    fn unknown_records_are_skipped_by_length() {
        let records = [
            DnsRecord::Unknown {
                domain: "example.test".to_string(),
                qtype: 16, // TXT
                data_len: 11,
                ttl: 60,
            },
            DnsRecord::Aaaa {
                domain: "example.test".to_string(),
                addr: "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap(),
                ttl: 600,
            },
        ];
        let bytes = answer_packet(8, "example.test", &records);

        let packet = DnsPacket::from_bytes(&bytes).unwrap();
        let found = packet
            .records()
            .find_map(|record| record.address_for(QueryType::Aaaa));
        assert_eq!(
            found,
            Some(("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap(), 600))
        );
    }

    #[test]
    fn short_record_payload_is_malformed() {
        let mut header = DnsHeader::new();
        header.id = 9;
        header.response = true;
        header.questions = 0;
        header.answers = 1;

        let mut buffer = PacketWriter::new();
        header.write(&mut buffer);
        buffer.write_qname("example.test").unwrap();
        buffer.write_u16(1); // type A
        buffer.write_u16(1);
        buffer.write_u32(60);
        buffer.write_u16(2); // bogus length for an A record
        buffer.write_u16(0);

        assert_eq!(
            DnsPacket::from_bytes(&buffer.into_bytes()).unwrap_err(),
            ProtocolError::MalformedRecord
        );
    }
}
