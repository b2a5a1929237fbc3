fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use canbridge_discovery::{HeaderVariant, Packet, PacketType, PairingState};
    use canbridge_protocol::messages::{HelloRequest, PairingSubmitRequest};
    use canbridge_protocol::{ControlMessage, DataMessage, MessageType};
    use canbridge_remp::message::FLAG_ACK_REQUESTED;
    use canbridge_remp::{CanFrame, MessageType as RempType, PairingPayload, PairingStatus, RempMessage};

    const DEVICE: [u8; 8] = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 1];

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_text(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a hex fixture as raw bytes.
    fn load_hex(name: &str) -> Vec<u8> {
        hex::decode(load_text(name).trim())
            .unwrap_or_else(|e| panic!("fixture {name} is not hex: {e}"))
    }

    fn load_json(name: &str) -> serde_json::Value {
        serde_json::from_str(&load_text(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    fn corr_id() -> [u8; 16] {
        std::array::from_fn(|i| 0x10 + i as u8)
    }

    fn nonce() -> [u8; 16] {
        std::array::from_fn(|i| 0xa0 + i as u8)
    }

    // --- REMP ---

    fn can_frame_message() -> RempMessage {
        let frame = CanFrame::new(0x18DA_F110, true, vec![0x02, 0x10, 0x03]).unwrap();
        RempMessage {
            msg_type: RempType::CanFrame,
            flags: FLAG_ACK_REQUESTED,
            fw_build: 0x0102,
            device_id: DEVICE,
            seq: 7,
            timestamp_us: 1_700_000_000_000_000,
            token: b"tok".to_vec(),
            payload: frame.encode().unwrap(),
        }
    }

    #[test]
    fn remp_can_frame_encodes_to_golden_bytes() {
        let golden = load_hex("remp_can_frame.hex");
        assert_eq!(can_frame_message().encode().unwrap(), golden);
    }

    #[test]
    fn remp_can_frame_decodes_from_golden_bytes() {
        let msg = RempMessage::decode(&load_hex("remp_can_frame.hex")).unwrap();
        assert_eq!(msg, can_frame_message());

        let frame = msg.can_frame().unwrap();
        assert!(frame.extended);
        assert_eq!(frame.can_id, 0x18DA_F110);
        assert_eq!(frame.data, vec![0x02, 0x10, 0x03]);
        assert!(!frame.simulated);
    }

    #[test]
    fn remp_pairing_submit_matches_golden_bytes() {
        let submit = PairingPayload::Submit {
            corr_id: corr_id(),
            pin: "482913".into(),
            nonce: nonce(),
            token: vec![0x42; 4],
        };
        let golden = load_hex("remp_pairing_submit.hex");
        assert_eq!(submit.encode().unwrap(), golden);
        assert_eq!(PairingPayload::decode(&golden).unwrap(), submit);
    }

    #[test]
    fn remp_pairing_acks_decode_from_golden_bytes() {
        let ok = PairingPayload::decode(&load_hex("remp_pairing_ack.hex")).unwrap();
        assert_eq!(
            ok,
            PairingPayload::Ack {
                corr_id: corr_id(),
                status: PairingStatus::Ok,
                seconds: 120,
                nonce: nonce().to_vec(),
            }
        );

        let cooldown = PairingPayload::decode(&load_hex("remp_pairing_cooldown.hex")).unwrap();
        match cooldown {
            PairingPayload::Ack {
                status,
                seconds,
                nonce,
                ..
            } => {
                assert_eq!(status, PairingStatus::Cooldown);
                assert_eq!(seconds, 30);
                assert!(nonce.is_empty());
            }
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    // --- Discovery ---

    #[test]
    fn discovery_discover_matches_golden_bytes() {
        let golden = load_hex("discovery_discover.hex");
        assert_eq!(Packet::discover(42).encode().unwrap(), golden);

        let parsed = Packet::decode(&golden).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Discover);
        assert_eq!(parsed.seq, 42);
    }

    #[test]
    fn discovery_announce_decodes_every_field() {
        let golden = load_hex("discovery_announce.hex");
        let packet = Packet::decode(&golden).unwrap();
        assert_eq!(packet.packet_type, PacketType::Announce);
        assert_eq!(packet.variant, HeaderVariant::Current);
        assert_eq!(packet.seq, 0x0102_0304);

        let a = &packet.announce;
        assert_eq!(a.device_id, Some(DEVICE));
        assert_eq!(a.fw_build, Some(0x0203));
        assert_eq!(a.udp_port, Some(48_101));
        assert_eq!(a.capabilities, Some(5));
        assert_eq!(a.proto_ver, Some(1));
        assert_eq!(a.lan_ip, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(a.pairing_state, Some(PairingState::Armed));
        assert_eq!(a.pairing_nonce, Some(nonce()));

        // Re-encoding reproduces the device's bytes, CRC included.
        assert_eq!(packet.encode().unwrap(), golden);
    }

    #[test]
    fn discovery_legacy_announce_skips_unknown_tlvs() {
        let golden = load_hex("discovery_announce_legacy.hex");
        let packet = Packet::decode(&golden).unwrap();
        assert_eq!(packet.variant, HeaderVariant::Legacy);
        assert_eq!(packet.seq, 0x0102);
        assert_eq!(packet.announce.device_id, Some(DEVICE));
        assert_eq!(packet.announce.udp_port, Some(48_101));
        assert_eq!(packet.announce.fw_build, None);
    }

    #[test]
    fn discovery_rejects_corrupted_golden_bytes() {
        let mut bytes = load_hex("discovery_announce.hex");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(Packet::decode(&bytes).is_err());
    }

    // --- Backend channels ---

    /// Parses a fixture, re-serializes it, and compares the JSON values.
    fn control_roundtrip(name: &str) -> ControlMessage {
        let fixture = load_json(name);
        let msg = ControlMessage::from_json(&fixture.to_string())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized: serde_json::Value =
            serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(fixture, reserialized, "roundtrip mismatch for {name}");
        msg
    }

    #[test]
    fn control_hello_fixture() {
        let msg = control_roundtrip("control_hello.json");
        assert_eq!(msg.msg_type, MessageType::Hello);
        assert_eq!(msg.request_id.as_deref(), Some("r-1"));
        let hello: HelloRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(hello.agent_id, "agent-a");
        assert_eq!(hello.version, 1);
    }

    #[test]
    fn control_pairing_submit_fixture() {
        let msg = control_roundtrip("control_pairing_submit.json");
        assert_eq!(msg.msg_type, MessageType::PairingSubmit);
        let req: PairingSubmitRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(req.pin, "482913");
        assert_eq!(hex::decode(&req.nonce).unwrap(), nonce().to_vec());
        assert_eq!(req.token, b"BBBB".to_vec());
    }

    #[test]
    fn data_can_frame_fixture() {
        let fixture = load_json("data_can_frame.json");
        let parsed = DataMessage::from_json(&fixture.to_string()).unwrap();
        let DataMessage::CanFrame(relay) = &parsed else {
            panic!("expected a can_frame, got {parsed:?}");
        };
        assert_eq!(relay.group_id.as_deref(), Some("g1"));
        assert!(relay.frame.extended);
        assert_eq!(relay.frame.can_id, 0x18DA_F110);

        let reserialized: serde_json::Value =
            serde_json::from_str(&parsed.to_json().unwrap()).unwrap();
        assert_eq!(fixture, reserialized);
    }
}
