//! property-based testing for the DNS wire codec and the scanner

use proptest::prelude::*;

use riptide::dns::buffer::{PacketReader, PacketWriter};
use riptide::dns::protocol::{build_query, DnsPacket, QueryType};
use riptide::scan::Scanner;

// Strategy for generating valid domain names
fn domain_name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9-]{0,20}[a-z0-9]", 1..5).prop_map(|parts| parts.join("."))
}

fn family_strategy() -> impl Strategy<Value = QueryType> {
    prop_oneof![Just(QueryType::A), Just(QueryType::Aaaa)]
}

proptest! {
    #[test]
    fn qname_roundtrip(name in domain_name_strategy()) {
        let mut writer = PacketWriter::new();
        writer.write_qname(&name).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let mut decoded = String::new();
        reader.read_qname(&mut decoded).unwrap();

        prop_assert_eq!(decoded, name);
        prop_assert_eq!(reader.pos(), bytes.len());
    }

    #[test]
    fn query_packet_roundtrip(
        id in any::<u16>(),
        name in domain_name_strategy(),
        family in family_strategy(),
    ) {
        let bytes = build_query(id, &name, family).unwrap();
        let packet = DnsPacket::from_bytes(&bytes).unwrap();

        prop_assert_eq!(packet.header.id, id);
        prop_assert!(packet.header.recursion_desired);
        prop_assert_eq!(packet.questions.len(), 1);
        prop_assert_eq!(&packet.questions[0].name, &name);
        prop_assert_eq!(packet.questions[0].qtype, family);
    }

    #[test]
    fn scanner_recovers_lines_however_the_bytes_arrive(
        lines in prop::collection::vec("[a-zA-Z0-9 ]{0,40}", 1..10),
        chunk in 1usize..17,
    ) {
        let mut wire = Vec::new();
        for line in &lines {
            wire.extend_from_slice(line.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }

        let mut scanner = Scanner::new();
        let mut recovered = Vec::new();
        for piece in wire.chunks(chunk) {
            scanner.feed(piece);
            while let Some(token) = scanner.next().unwrap() {
                recovered.push(String::from_utf8(token).unwrap());
            }
        }

        prop_assert_eq!(recovered, lines);
    }
}
