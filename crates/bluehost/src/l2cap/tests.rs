//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::packet::*;
    use super::super::psm::*;
    use super::super::*;
    use crate::gap::{LinkType, Role, SecurityLevel};
    use crate::hci::PacketBoundary;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    const CLASSIC: u16 = 0x0001;
    const LE: u16 = 0x0002;
    const PEER_CID: u16 = 0x0070;
    const PEER_LE_CID: u16 = 0x0050;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Record {
        Opened(ChannelId),
        OpenFailed(ChannelId, L2capError),
        Data(ChannelId, Vec<u8>),
        CanSend(ChannelId),
        Closed(ChannelId, CloseReason),
    }

    /// Handler that logs every callback
    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<Record>>>);

    impl Recorder {
        fn handler(&self) -> Box<dyn ChannelHandler> {
            Box::new(self.clone())
        }

        fn take(&self) -> Vec<Record> {
            self.0.borrow_mut().drain(..).collect()
        }
    }

    impl ChannelHandler for Recorder {
        fn on_opened(&mut self, ctx: &mut ChannelContext<'_>) {
            self.0.borrow_mut().push(Record::Opened(ctx.cid()));
        }

        fn on_open_failed(&mut self, cid: ChannelId, error: &L2capError) {
            self.0.borrow_mut().push(Record::OpenFailed(cid, error.clone()));
        }

        fn on_data(&mut self, ctx: &mut ChannelContext<'_>, sdu: &[u8]) {
            self.0.borrow_mut().push(Record::Data(ctx.cid(), sdu.to_vec()));
        }

        fn on_can_send_now(&mut self, ctx: &mut ChannelContext<'_>) {
            self.0.borrow_mut().push(Record::CanSend(ctx.cid()));
        }

        fn on_closed(&mut self, cid: ChannelId, reason: &CloseReason) {
            self.0.borrow_mut().push(Record::Closed(cid, reason.clone()));
        }
    }

    /// Handler that sends every SDU straight back
    struct Echo;

    impl ChannelHandler for Echo {
        fn on_data(&mut self, ctx: &mut ChannelContext<'_>, sdu: &[u8]) {
            ctx.send(sdu).unwrap();
        }
    }

    struct Accept(Recorder);

    impl ServiceAcceptor for Accept {
        fn accept(&mut self, _request: &IncomingChannel) -> Option<Box<dyn ChannelHandler>> {
            Some(self.0.handler())
        }
    }

    struct AcceptEcho;

    impl ServiceAcceptor for AcceptEcho {
        fn accept(&mut self, _request: &IncomingChannel) -> Option<Box<dyn ChannelHandler>> {
            Some(Box::new(Echo))
        }
    }

    fn new_mux() -> L2capMux {
        let mut mux = L2capMux::default();
        mux.add_link(CLASSIC, LinkType::Classic, Role::Central);
        mux.add_link(LE, LinkType::Le, Role::Central);
        mux
    }

    fn feed(mux: &mut L2capMux, handle: u16, pdu: &[u8]) {
        mux.on_acl_received(handle, PacketBoundary::FirstFlushable, pdu).unwrap();
    }

    fn feed_signal(mux: &mut L2capMux, handle: u16, message: SignalingMessage) {
        feed(mux, handle, &message.to_packet(handle == LE).to_bytes());
    }

    /// Every queued PDU, assuming no ACL fragmentation
    fn outgoing(mux: &mut L2capMux) -> Vec<L2capPacket> {
        let mut packets = Vec::new();
        while let Some(acl) = mux.pop_transmit() {
            mux.on_packets_completed(acl.handle, 1);
            packets.push(L2capPacket::parse(&acl.packet[5..]).unwrap());
        }
        packets
    }

    fn signals_in(packets: &[L2capPacket]) -> Vec<SignalingMessage> {
        packets
            .iter()
            .filter(|packet| {
                packet.header.channel_id == L2CAP_SIGNALING_CID || packet.header.channel_id == L2CAP_LE_SIGNALING_CID
            })
            .flat_map(|packet| {
                SignalingMessage::parse_all(&packet.payload, packet.header.channel_id == L2CAP_LE_SIGNALING_CID)
            })
            .map(|message| message.unwrap())
            .collect()
    }

    fn signals(mux: &mut L2capMux) -> Vec<SignalingMessage> {
        let packets = outgoing(mux);
        signals_in(&packets)
    }

    fn ertm_options(tx_window: u8, mps: u16) -> ConfigOptions {
        ConfigOptions {
            mtu: Some(L2CAP_DEFAULT_MTU),
            retransmission: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::EnhancedRetransmission,
                tx_window_size: tx_window,
                max_transmit: 3,
                retransmit_timeout: 2000,
                monitor_timeout: 12000,
                max_pdu_size: mps,
            }),
            fcs: Some(L2CAP_FCS_CRC16),
            ..Default::default()
        }
    }

    /// Run the BR/EDR handshake of an outgoing channel; the peer uses `PEER_CID`
    fn open_classic(mux: &mut L2capMux, spec: ChannelSpec, recorder: &Recorder, peer: ConfigOptions) -> ChannelId {
        let cid = mux.open_channel(CLASSIC, spec, recorder.handler()).unwrap();

        let sent = signals(mux);
        let SignalingMessage::ConnectionRequest { identifier, .. } = &sent[0] else {
            panic!("Expected ConnectionRequest, got {:?}", sent);
        };
        feed_signal(
            mux,
            CLASSIC,
            SignalingMessage::ConnectionResponse {
                identifier: *identifier,
                destination_cid: PEER_CID,
                source_cid: cid,
                result: L2CAP_RESULT_SUCCESS,
                status: 0,
            },
        );

        let sent = signals(mux);
        let SignalingMessage::ConfigureRequest { identifier, .. } = &sent[0] else {
            panic!("Expected ConfigureRequest, got {:?}", sent);
        };
        feed_signal(
            mux,
            CLASSIC,
            SignalingMessage::ConfigureResponse {
                identifier: *identifier,
                source_cid: cid,
                flags: 0,
                result: L2CAP_CONF_SUCCESS,
                options: ConfigOptions::default(),
            },
        );
        feed_signal(
            mux,
            CLASSIC,
            SignalingMessage::ConfigureRequest {
                identifier: 0x20,
                destination_cid: cid,
                flags: 0,
                options: peer,
            },
        );

        let sent = signals(mux);
        assert!(
            matches!(
                sent.as_slice(),
                [SignalingMessage::ConfigureResponse {
                    result: L2CAP_CONF_SUCCESS,
                    source_cid: PEER_CID,
                    ..
                }]
            ),
            "{:?}",
            sent
        );
        cid
    }

    /// Open an outgoing LE channel; the peer grants `credits` and an MPS of 23
    fn open_le(mux: &mut L2capMux, recorder: &Recorder, credits: u16) -> ChannelId {
        let cid = mux
            .open_channel(LE, ChannelSpec::le_credit_based(0x0080), recorder.handler())
            .unwrap();
        // Requests queued earlier on other links may go out first
        let sent = signals(mux);
        let Some(identifier) = sent.iter().find_map(|message| match message {
            SignalingMessage::LeCreditBasedConnectionRequest { identifier, .. } => Some(identifier),
            _ => None,
        }) else {
            panic!("Expected LE connection request, got {:?}", sent);
        };
        feed_signal(
            mux,
            LE,
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier: *identifier,
                destination_cid: PEER_LE_CID,
                mtu: 100,
                mps: 23,
                initial_credits: credits,
                result: L2CAP_RESULT_SUCCESS,
            },
        );
        cid
    }

    #[test]
    fn test_psm_value_conversion() {
        assert_eq!(Psm::Sdp.value(), 0x0001);
        assert_eq!(Psm::Rfcomm.value(), 0x0003);
        assert_eq!(Psm::Att.value(), 0x001F);
        assert_eq!(u16::from(Psm::Avdtp), 0x0019);

        assert_eq!(Psm::from_value(0x0001), Psm::Sdp);
        assert_eq!(Psm::from_value(0x1001), Psm::Dynamic(0x1001));

        assert!(Psm::Sdp.is_valid());
        assert!(Psm::Dynamic(0x1001).is_valid());
        assert!(!Psm::Dynamic(0x0002).is_valid());
        assert!(!Psm::Dynamic(0x0101).is_valid());

        assert!(is_valid_le_psm(0x0080));
        assert!(!is_valid_le_psm(0x0100));
        assert!(!is_valid_le_psm(0x0000));
    }

    #[test]
    fn test_dynamic_psm_allocation_is_per_instance() {
        let mut first = L2capMux::default();
        let mut second = L2capMux::default();

        assert_eq!(first.allocate_psm(false), Some(0x1001));
        assert_eq!(second.allocate_psm(false), Some(0x1001));
        assert_eq!(first.allocate_psm(true), Some(0x0080));

        second
            .register_service(0x1003, ServicePolicy::default(), Box::new(AcceptEcho))
            .unwrap();
        assert_eq!(second.allocate_psm(false), Some(0x1005));
    }

    #[test]
    fn test_l2cap_header() {
        let header = L2capHeader::new(10, 0x0040);
        let parsed = L2capHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(L2capHeader::parse(&[0x01, 0x00, 0x40]).is_none());
    }

    #[test]
    fn test_signaling_message_connection_request() {
        let request = SignalingMessage::ConnectionRequest {
            identifier: 1,
            psm: Psm::Sdp.value(),
            source_cid: 0x0040,
        };
        assert_eq!(request.command_code(), L2CAP_CONNECTION_REQUEST);
        assert_eq!(request.identifier(), 1);

        let bytes = request.serialize();
        assert_eq!(bytes, vec![0x02, 0x01, 0x04, 0x00, 0x01, 0x00, 0x40, 0x00]);
        assert_eq!(SignalingMessage::parse(&bytes, false).unwrap(), request);
    }

    #[test]
    fn test_signaling_config_request_with_rfc() {
        let request = SignalingMessage::ConfigureRequest {
            identifier: 2,
            destination_cid: 0x0041,
            flags: 0,
            options: ertm_options(4, 500),
        };
        let bytes = request.serialize();
        // MTU (4) + RFC (11) + FCS (3) options after the 4 fixed bytes
        assert_eq!(bytes.len(), L2CAP_COMMAND_HEADER_SIZE + 4 + 4 + 11 + 3);
        assert_eq!(SignalingMessage::parse(&bytes, false).unwrap(), request);
    }

    #[test]
    fn test_unknown_config_option_is_reported() {
        // MTU option, then an unknown non-hint option type 0x42, then a hint 0x83
        let data = [0x01, 0x02, 0x80, 0x00, 0x42, 0x01, 0xFF, 0x83, 0x00];
        let options = SignalingMessage::parse_config_options(&data);
        assert_eq!(options.mtu, Some(128));
        assert_eq!(options.unknown, vec![0x42]);
    }

    #[test]
    fn test_parse_all_keeps_commands_before_truncation() {
        let mut data = SignalingMessage::EchoRequest {
            identifier: 1,
            data: vec![0xAA],
        }
        .serialize();
        data.extend_from_slice(&[0x08, 0x02, 0x05, 0x00, 0x01]);

        let messages = SignalingMessage::parse_all(&data, false);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_ok());
        assert!(messages[1].is_err());
    }

    #[test]
    fn test_le_only_command_on_classic_link_is_unknown() {
        let credit = SignalingMessage::LeFlowControlCredit {
            identifier: 3,
            cid: 0x0040,
            credits: 1,
        };
        let parsed = SignalingMessage::parse(&credit.serialize(), false).unwrap();
        assert!(matches!(
            parsed,
            SignalingMessage::Unknown {
                identifier: 3,
                code: L2CAP_LE_FLOW_CONTROL_CREDIT,
                ..
            }
        ));
    }

    #[test]
    fn test_connection_parameter_validation() {
        let good = ConnectionParameterUpdate {
            conn_interval_min: 24,
            conn_interval_max: 40,
            conn_latency: 0,
            supervision_timeout: 500,
        };
        assert!(good.validate());

        let timeout_too_short = ConnectionParameterUpdate {
            supervision_timeout: 10,
            conn_latency: 20,
            ..good
        };
        assert!(!timeout_too_short.validate());

        let inverted = ConnectionParameterUpdate {
            conn_interval_min: 50,
            ..good
        };
        assert!(!inverted.validate());
    }

    #[test]
    fn test_classic_channel_open_and_data() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let peer = ConfigOptions {
            mtu: Some(100),
            ..Default::default()
        };
        let cid = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, peer);

        assert_eq!(recorder.take(), vec![Record::Opened(cid)]);
        let channel = mux.channel(cid).unwrap();
        assert_eq!(channel.state(), L2capChannelState::Open);
        assert_eq!(channel.remote_cid(), PEER_CID);
        assert_eq!(channel.remote_mtu(), 100);

        assert_eq!(
            mux.send(cid, &[0u8; 101]),
            Err(L2capError::MtuExceeded { size: 101, mtu: 100 })
        );
        mux.send(cid, &[1, 2, 3, 4]).unwrap();
        let sent = outgoing(&mut mux);
        assert_eq!(sent, vec![L2capPacket::new(PEER_CID, vec![1, 2, 3, 4])]);

        feed(&mut mux, CLASSIC, &L2capPacket::new(cid, vec![9, 9]).to_bytes());
        assert_eq!(recorder.take(), vec![Record::Data(cid, vec![9, 9])]);
    }

    #[test]
    fn test_outgoing_config_request_carries_local_mtu() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = mux
            .open_channel(CLASSIC, ChannelSpec::basic(0x1001).with_mtu(200), recorder.handler())
            .unwrap();
        let sent = signals(&mut mux);
        let SignalingMessage::ConnectionRequest { identifier, psm, source_cid } = sent[0].clone() else {
            panic!("{:?}", sent);
        };
        assert_eq!((psm, source_cid), (0x1001, cid));

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: cid,
                result: L2CAP_RESULT_SUCCESS,
                status: 0,
            },
        );
        let sent = signals(&mut mux);
        match &sent[..] {
            [SignalingMessage::ConfigureRequest {
                destination_cid,
                options,
                ..
            }] => {
                assert_eq!(*destination_cid, PEER_CID);
                assert_eq!(options.mtu, Some(200));
                assert!(options.retransmission.is_none());
            }
            other => panic!("Expected ConfigureRequest, got {:?}", other),
        }
        assert_eq!(mux.channel(cid).unwrap().state(), L2capChannelState::Config);
    }

    #[test]
    fn test_connection_refused_by_peer() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = mux
            .open_channel(CLASSIC, ChannelSpec::basic(0x1001), recorder.handler())
            .unwrap();
        let identifier = signals(&mut mux)[0].identifier();

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: 0,
                source_cid: cid,
                result: L2CAP_RESULT_PSM_NOT_SUPPORTED,
                status: 0,
            },
        );
        assert_eq!(
            recorder.take(),
            vec![Record::OpenFailed(
                cid,
                L2capError::ConnectionRejected(L2CAP_RESULT_PSM_NOT_SUPPORTED)
            )]
        );
        assert_eq!(mux.channel_count(), 0);
        assert!(signals(&mut mux).is_empty());
    }

    #[test]
    fn test_unacceptable_config_is_retried_once() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = mux
            .open_channel(CLASSIC, ChannelSpec::basic(0x1001), recorder.handler())
            .unwrap();
        let identifier = signals(&mut mux)[0].identifier();
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: cid,
                result: L2CAP_RESULT_SUCCESS,
                status: 0,
            },
        );

        let unacceptable = |identifier| SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: cid,
            flags: 0,
            result: L2CAP_CONF_UNACCEPTABLE_PARAMS,
            options: ConfigOptions {
                mtu: Some(100),
                ..Default::default()
            },
        };

        let identifier = signals(&mut mux)[0].identifier();
        feed_signal(&mut mux, CLASSIC, unacceptable(identifier));
        let sent = signals(&mut mux);
        let SignalingMessage::ConfigureRequest { identifier, options, .. } = sent[0].clone() else {
            panic!("{:?}", sent);
        };
        assert_eq!(options.mtu, Some(100));

        feed_signal(&mut mux, CLASSIC, unacceptable(identifier));
        assert_eq!(
            recorder.take(),
            vec![Record::OpenFailed(
                cid,
                L2capError::ConnectionRejected(L2CAP_CONF_UNACCEPTABLE_PARAMS)
            )]
        );
        let sent = signals(&mut mux);
        assert!(matches!(
            sent.as_slice(),
            [SignalingMessage::DisconnectionRequest {
                destination_cid: PEER_CID,
                ..
            }]
        ));
    }

    #[test]
    fn test_incoming_classic_channel() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        mux.register_service(0x1001, ServicePolicy::default(), Box::new(Accept(recorder.clone())))
            .unwrap();

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConnectionRequest {
                identifier: 3,
                psm: 0x1001,
                source_cid: 0x0041,
            },
        );
        let sent = signals(&mut mux);
        assert_eq!(
            sent[0],
            SignalingMessage::ConnectionResponse {
                identifier: 3,
                destination_cid: 0x0040,
                source_cid: 0x0041,
                result: L2CAP_RESULT_SUCCESS,
                status: 0,
            }
        );
        let SignalingMessage::ConfigureRequest { identifier, destination_cid, .. } = sent[1].clone() else {
            panic!("{:?}", sent);
        };
        assert_eq!(destination_cid, 0x0041);

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConfigureRequest {
                identifier: 4,
                destination_cid: 0x0040,
                flags: 0,
                options: ConfigOptions::default(),
            },
        );
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid: 0x0040,
                flags: 0,
                result: L2CAP_CONF_SUCCESS,
                options: ConfigOptions::default(),
            },
        );
        assert_eq!(recorder.take(), vec![Record::Opened(0x0040)]);
        assert_eq!(mux.channel(0x0040).unwrap().remote_mtu(), L2CAP_DEFAULT_MTU);
    }

    #[test]
    fn test_incoming_connection_refusals() {
        let mut mux = new_mux();
        let policy = ServicePolicy {
            min_security_level: SecurityLevel::Level2,
            ..Default::default()
        };
        mux.register_service(0x1003, policy, Box::new(AcceptEcho)).unwrap();

        let request = |psm| SignalingMessage::ConnectionRequest {
            identifier: 7,
            psm,
            source_cid: 0x0041,
        };

        feed_signal(&mut mux, CLASSIC, request(0x1001));
        feed_signal(&mut mux, CLASSIC, request(0x1003));
        let results: Vec<u16> = signals(&mut mux)
            .into_iter()
            .map(|message| match message {
                SignalingMessage::ConnectionResponse {
                    result, destination_cid, ..
                } => {
                    assert_eq!(destination_cid, 0);
                    result
                }
                other => panic!("Expected ConnectionResponse, got {:?}", other),
            })
            .collect();
        assert_eq!(results, vec![L2CAP_RESULT_PSM_NOT_SUPPORTED, L2CAP_RESULT_SECURITY_BLOCK]);
        assert_eq!(mux.channel_count(), 0);

        mux.set_link_security(CLASSIC, SecurityLevel::Level2);
        feed_signal(&mut mux, CLASSIC, request(0x1003));
        assert!(matches!(
            signals(&mut mux)[0],
            SignalingMessage::ConnectionResponse {
                result: L2CAP_RESULT_SUCCESS,
                ..
            }
        ));
    }

    #[test]
    fn test_config_mode_mismatch_is_unacceptable() {
        let mut mux = new_mux();
        mux.register_service(0x1001, ServicePolicy::default(), Box::new(AcceptEcho))
            .unwrap();
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConnectionRequest {
                identifier: 1,
                psm: 0x1001,
                source_cid: 0x0041,
            },
        );
        outgoing(&mut mux);

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConfigureRequest {
                identifier: 2,
                destination_cid: 0x0040,
                flags: 0,
                options: ertm_options(8, 1010),
            },
        );
        match &signals(&mut mux)[..] {
            [SignalingMessage::ConfigureResponse { result, options, .. }] => {
                assert_eq!(*result, L2CAP_CONF_UNACCEPTABLE_PARAMS);
                assert_eq!(options.retransmission.map(|rfc| rfc.mode), Some(RetransmissionMode::Basic));
            }
            other => panic!("Expected ConfigureResponse, got {:?}", other),
        }

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::ConfigureRequest {
                identifier: 3,
                destination_cid: 0x0040,
                flags: 0,
                options: ConfigOptions {
                    mtu: Some(20),
                    ..Default::default()
                },
            },
        );
        match &signals(&mut mux)[..] {
            [SignalingMessage::ConfigureResponse { result, options, .. }] => {
                assert_eq!(*result, L2CAP_CONF_UNACCEPTABLE_PARAMS);
                assert_eq!(options.mtu, Some(L2CAP_MIN_MTU));
            }
            other => panic!("Expected ConfigureResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_close_channel_is_unconditional() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, ConfigOptions::default());
        recorder.take();

        mux.close_channel(cid).unwrap();
        assert_eq!(recorder.take(), vec![Record::Closed(cid, CloseReason::Local)]);
        assert!(mux.channel(cid).is_none());
        assert_eq!(mux.send(cid, &[1]), Err(L2capError::ChannelNotFound(cid)));

        let sent = signals(&mut mux);
        assert!(matches!(
            sent.as_slice(),
            [SignalingMessage::DisconnectionRequest {
                destination_cid: PEER_CID,
                source_cid,
                ..
            }] if *source_cid == cid
        ));
        assert_eq!(mux.pending_disconnects(), 1);

        // The peer never answers
        mux.tick(Instant::now() + Duration::from_secs(11));
        assert_eq!(mux.pending_disconnects(), 0);
        assert!(recorder.take().is_empty());
        assert_eq!(mux.close_channel(cid), Err(L2capError::ChannelNotFound(cid)));
    }

    #[test]
    fn test_disconnection_response_clears_pending() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, ConfigOptions::default());
        mux.close_channel(cid).unwrap();
        let identifier = signals(&mut mux)[0].identifier();

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid: PEER_CID,
                source_cid: cid,
            },
        );
        assert_eq!(mux.pending_disconnects(), 0);
    }

    #[test]
    fn test_remote_disconnect() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, ConfigOptions::default());
        recorder.take();

        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::DisconnectionRequest {
                identifier: 5,
                destination_cid: cid,
                source_cid: PEER_CID,
            },
        );
        assert_eq!(recorder.take(), vec![Record::Closed(cid, CloseReason::Remote)]);
        assert_eq!(
            signals(&mut mux),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 5,
                destination_cid: cid,
                source_cid: PEER_CID,
            }]
        );

        // Unknown channel gets an invalid CID reject
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::DisconnectionRequest {
                identifier: 6,
                destination_cid: cid,
                source_cid: PEER_CID,
            },
        );
        assert!(matches!(
            signals(&mut mux)[0],
            SignalingMessage::CommandReject {
                identifier: 6,
                reason: L2CAP_REJECT_INVALID_CID,
                ..
            }
        ));
    }

    #[test]
    fn test_cascading_teardown_on_link_loss() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let open = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, ConfigOptions::default());
        let pending = mux
            .open_channel(CLASSIC, ChannelSpec::basic(0x1003), recorder.handler())
            .unwrap();
        let le = open_le(&mut mux, &recorder, 5);
        recorder.take();

        assert_eq!(mux.remove_link(CLASSIC), 2);
        assert!(mux.channels_on_link(CLASSIC).is_empty());
        assert_eq!(mux.channels_on_link(LE), vec![le]);
        assert_eq!(mux.queued_packets(), 0);

        let records = recorder.take();
        assert_eq!(records.len(), 2);
        assert!(records.contains(&Record::Closed(open, CloseReason::LinkLost)));
        assert!(records.contains(&Record::OpenFailed(pending, L2capError::ConnectionTerminated)));

        assert_eq!(mux.remove_link(CLASSIC), 0);
        assert_eq!(
            mux.open_channel(CLASSIC, ChannelSpec::basic(0x1001), recorder.handler()),
            Err(L2capError::UnknownLink(CLASSIC))
        );
    }

    #[test]
    fn test_credit_channel_send_waits_for_credit() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_le(&mut mux, &recorder, 0);
        assert_eq!(recorder.take(), vec![Record::Opened(cid)]);
        assert_eq!(mux.channel(cid).unwrap().tx_credits(), Some(0));

        assert_eq!(mux.send(cid, b"hello"), Err(L2capError::WouldBlock));
        assert_eq!(mux.queued_packets(), 0);

        feed_signal(
            &mut mux,
            LE,
            SignalingMessage::LeFlowControlCredit {
                identifier: 9,
                cid: PEER_LE_CID,
                credits: 1,
            },
        );
        assert_eq!(recorder.take(), vec![Record::CanSend(cid)]);

        mux.send(cid, b"hello").unwrap();
        assert_eq!(mux.channel(cid).unwrap().tx_credits(), Some(0));
        let sent = outgoing(&mut mux);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.channel_id, PEER_LE_CID);
        assert_eq!(sent[0].payload, b"\x05\x00hello".to_vec());
    }

    #[test]
    fn test_credit_counter_never_goes_negative() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_le(&mut mux, &recorder, 2);

        // 50 bytes at MPS 23 needs three K-frames
        assert_eq!(mux.send(cid, &[0xAB; 50]), Err(L2capError::WouldBlock));
        assert_eq!(mux.channel(cid).unwrap().tx_credits(), Some(2));

        mux.send(cid, b"a").unwrap();
        mux.send(cid, b"b").unwrap();
        assert_eq!(mux.channel(cid).unwrap().tx_credits(), Some(0));
        assert_eq!(mux.send(cid, b"c"), Err(L2capError::WouldBlock));
        assert_eq!(outgoing(&mut mux).len(), 2);

        feed_signal(
            &mut mux,
            LE,
            SignalingMessage::LeFlowControlCredit {
                identifier: 1,
                cid: PEER_LE_CID,
                credits: 3,
            },
        );
        mux.send(cid, &[0xAB; 50]).unwrap();
        assert_eq!(mux.channel(cid).unwrap().tx_credits(), Some(0));

        let frames = outgoing(&mut mux);
        let sizes: Vec<usize> = frames.iter().map(|frame| frame.payload.len()).collect();
        assert_eq!(sizes, vec![23, 23, 6]);
        assert_eq!(&frames[0].payload[..2], &[50, 0]);
    }

    #[test]
    fn test_credit_overflow_saturates() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_le(&mut mux, &recorder, 0xFFF0);

        feed_signal(
            &mut mux,
            LE,
            SignalingMessage::LeFlowControlCredit {
                identifier: 1,
                cid: PEER_LE_CID,
                credits: 0x20,
            },
        );
        assert_eq!(mux.channel(cid).unwrap().tx_credits(), Some(L2CAP_LE_MAX_CREDITS));
        assert_eq!(mux.stats().protocol_violations, 1);
        assert!(mux.channel(cid).is_some());
    }

    #[test]
    fn test_incoming_le_channel_reassembles_and_replenishes() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let policy = ServicePolicy {
            mode: ChannelMode::LeCreditBased,
            ..Default::default()
        };
        mux.register_service(0x0080, policy, Box::new(Accept(recorder.clone())))
            .unwrap();

        feed_signal(
            &mut mux,
            LE,
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier: 7,
                le_psm: 0x0080,
                source_cid: 0x0041,
                mtu: 64,
                mps: 23,
                initial_credits: 3,
            },
        );
        assert_eq!(
            signals(&mut mux),
            vec![SignalingMessage::LeCreditBasedConnectionResponse {
                identifier: 7,
                destination_cid: 0x0040,
                mtu: L2CAP_DEFAULT_MTU,
                mps: L2CAP_LE_DEFAULT_MPS,
                initial_credits: L2CAP_LE_DEFAULT_CREDITS,
                result: L2CAP_RESULT_SUCCESS,
            }]
        );
        assert_eq!(recorder.take(), vec![Record::Opened(0x0040)]);
        assert_eq!(mux.channel(0x0040).unwrap().tx_credits(), Some(3));

        let sdu: Vec<u8> = (0..30).collect();
        feed(&mut mux, LE, &build_k_frame(0x0040, Some(30), &sdu[..21]));
        assert!(recorder.take().is_empty());
        feed(&mut mux, LE, &build_k_frame(0x0040, None, &sdu[21..]));
        assert_eq!(recorder.take(), vec![Record::Data(0x0040, sdu)]);
        assert_eq!(mux.channel(0x0040).unwrap().rx_credits(), Some(8));
        assert!(signals(&mut mux).is_empty());

        for byte in 0..3u8 {
            feed(&mut mux, LE, &build_k_frame(0x0040, Some(1), &[byte]));
        }
        assert_eq!(
            signals(&mut mux),
            vec![SignalingMessage::LeFlowControlCredit {
                identifier: 1,
                cid: 0x0040,
                credits: 5,
            }]
        );
        assert_eq!(mux.channel(0x0040).unwrap().rx_credits(), Some(L2CAP_LE_DEFAULT_CREDITS));
    }

    #[test]
    fn test_incoming_le_refusals() {
        let mut mux = new_mux();
        let policy = ServicePolicy {
            mode: ChannelMode::LeCreditBased,
            min_security_level: SecurityLevel::Level2,
            ..Default::default()
        };
        mux.register_service(0x0081, policy, Box::new(AcceptEcho)).unwrap();

        let request = |le_psm, source_cid| SignalingMessage::LeCreditBasedConnectionRequest {
            identifier: 2,
            le_psm,
            source_cid,
            mtu: 64,
            mps: 23,
            initial_credits: 1,
        };
        feed_signal(&mut mux, LE, request(0x0080, 0x0041));
        feed_signal(&mut mux, LE, request(0x0081, 0x0041));
        feed_signal(&mut mux, LE, request(0x0081, 0x0090));

        let results: Vec<u16> = signals(&mut mux)
            .into_iter()
            .map(|message| match message {
                SignalingMessage::LeCreditBasedConnectionResponse { result, .. } => result,
                other => panic!("Expected LE connection response, got {:?}", other),
            })
            .collect();
        assert_eq!(
            results,
            vec![
                L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED,
                L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION,
                L2CAP_LE_RESULT_INVALID_SCID,
            ]
        );
    }

    #[test]
    fn test_handler_can_send_from_callback() {
        let mut mux = new_mux();
        let policy = ServicePolicy {
            mode: ChannelMode::LeCreditBased,
            ..Default::default()
        };
        mux.register_service(0x0080, policy, Box::new(AcceptEcho)).unwrap();
        feed_signal(
            &mut mux,
            LE,
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier: 1,
                le_psm: 0x0080,
                source_cid: 0x0041,
                mtu: 64,
                mps: 23,
                initial_credits: 2,
            },
        );
        outgoing(&mut mux);

        feed(&mut mux, LE, &build_k_frame(0x0040, Some(3), b"abc"));
        let sent = outgoing(&mut mux);
        assert_eq!(sent, vec![L2capPacket::new(0x0041, b"\x03\x00abc".to_vec())]);
    }

    #[test]
    fn test_security_gates_outgoing_channel() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let spec = ChannelSpec::basic(0x1001).with_security(SecurityLevel::Level2);
        let cid = mux.open_channel(CLASSIC, spec, recorder.handler()).unwrap();

        assert_eq!(mux.channel(cid).unwrap().state(), L2capChannelState::WaitSecurity);
        assert_eq!(
            mux.take_events(),
            vec![MuxEvent::SecurityRequired {
                handle: CLASSIC,
                level: SecurityLevel::Level2,
            }]
        );
        assert!(signals(&mut mux).is_empty());

        mux.set_link_security(CLASSIC, SecurityLevel::Level2);
        assert!(matches!(
            signals(&mut mux).as_slice(),
            [SignalingMessage::ConnectionRequest { psm: 0x1001, .. }]
        ));

        let spec = ChannelSpec::le_credit_based(0x0080).with_security(SecurityLevel::Level3);
        let second = mux.open_channel(LE, spec, recorder.handler()).unwrap();
        mux.security_failed(LE);
        assert_eq!(
            recorder.take(),
            vec![Record::OpenFailed(second, L2capError::SecurityRequirementsNotMet)]
        );
    }

    #[test]
    fn test_signaling_timeout_fails_open() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = mux
            .open_channel(CLASSIC, ChannelSpec::basic(0x1001), recorder.handler())
            .unwrap();
        outgoing(&mut mux);

        mux.tick(Instant::now());
        assert!(recorder.take().is_empty());

        mux.tick(Instant::now() + Duration::from_secs(11));
        assert_eq!(recorder.take(), vec![Record::OpenFailed(cid, L2capError::Timeout)]);
        assert_eq!(mux.channel_count(), 0);
    }

    #[test]
    fn test_open_channel_validates_parameters() {
        let mut mux = new_mux();
        let recorder = Recorder::default();

        assert!(matches!(
            mux.open_channel(CLASSIC, ChannelSpec::basic(0x1002), recorder.handler()),
            Err(L2capError::InvalidParameter(_))
        ));
        assert!(matches!(
            mux.open_channel(LE, ChannelSpec::basic(0x1001), recorder.handler()),
            Err(L2capError::InvalidParameter(_))
        ));
        assert!(matches!(
            mux.open_channel(CLASSIC, ChannelSpec::basic(0x1001).with_mtu(20), recorder.handler()),
            Err(L2capError::InvalidParameter(_))
        ));
        assert_eq!(mux.channel_count(), 0);
    }

    #[test]
    fn test_acl_reassembly() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, ConfigOptions::default());
        recorder.take();

        let pdu = L2capPacket::new(cid, (0..40).collect()).to_bytes();
        mux.on_acl_received(CLASSIC, PacketBoundary::FirstFlushable, &pdu[..3])
            .unwrap();
        mux.on_acl_received(CLASSIC, PacketBoundary::Continuation, &pdu[3..20])
            .unwrap();
        assert!(recorder.take().is_empty());
        mux.on_acl_received(CLASSIC, PacketBoundary::Continuation, &pdu[20..])
            .unwrap();
        assert_eq!(recorder.take(), vec![Record::Data(cid, (0..40).collect())]);

        mux.on_acl_received(CLASSIC, PacketBoundary::Continuation, &[1, 2])
            .unwrap();
        assert_eq!(mux.stats().protocol_violations, 1);

        assert_eq!(
            mux.on_acl_received(0x0099, PacketBoundary::FirstFlushable, &pdu),
            Err(L2capError::UnknownLink(0x0099))
        );
    }

    #[test]
    fn test_data_for_unknown_channel_is_dropped() {
        let mut mux = new_mux();
        feed(&mut mux, CLASSIC, &L2capPacket::new(0x0123, vec![1]).to_bytes());
        assert_eq!(mux.stats().protocol_violations, 1);
        assert!(mux.has_link(CLASSIC));
    }

    #[test]
    fn test_fixed_channel_data_is_forwarded() {
        let mut mux = new_mux();
        feed(
            &mut mux,
            LE,
            &L2capPacket::new(L2CAP_ATTRIBUTE_PROTOCOL_CID, vec![0x0A, 0x03, 0x00]).to_bytes(),
        );
        assert_eq!(
            mux.take_events(),
            vec![MuxEvent::FixedChannelData {
                handle: LE,
                cid: L2CAP_ATTRIBUTE_PROTOCOL_CID,
                data: vec![0x0A, 0x03, 0x00],
            }]
        );
    }

    #[test]
    fn test_information_and_echo_requests_are_answered() {
        let mut mux = new_mux();
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::InformationRequest {
                identifier: 1,
                info_type: L2CAP_INFO_EXTENDED_FEATURES,
            },
        );
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::InformationRequest {
                identifier: 2,
                info_type: L2CAP_INFO_FIXED_CHANNELS,
            },
        );
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::EchoRequest {
                identifier: 3,
                data: vec![0xCA, 0xFE],
            },
        );

        assert_eq!(
            signals(&mut mux),
            vec![
                SignalingMessage::InformationResponse {
                    identifier: 1,
                    info_type: L2CAP_INFO_EXTENDED_FEATURES,
                    result: L2CAP_INFO_SUCCESS,
                    data: vec![0xB8, 0x00, 0x00, 0x00],
                },
                SignalingMessage::InformationResponse {
                    identifier: 2,
                    info_type: L2CAP_INFO_FIXED_CHANNELS,
                    result: L2CAP_INFO_SUCCESS,
                    data: vec![0x06, 0, 0, 0, 0, 0, 0, 0],
                },
                SignalingMessage::EchoResponse {
                    identifier: 3,
                    data: vec![0xCA, 0xFE],
                },
            ]
        );

        mux.echo_request(CLASSIC, &[1]).unwrap();
        let identifier = signals(&mut mux)[0].identifier();
        feed_signal(
            &mut mux,
            CLASSIC,
            SignalingMessage::EchoResponse {
                identifier,
                data: vec![1],
            },
        );
        assert_eq!(
            mux.take_events(),
            vec![MuxEvent::EchoResponse {
                handle: CLASSIC,
                data: vec![1],
            }]
        );
        assert_eq!(mux.echo_request(LE, &[1]), Err(L2capError::NotSupported));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let mut mux = new_mux();
        let raw = L2capPacket::new(L2CAP_SIGNALING_CID, vec![0x30, 0x05, 0x00, 0x00]).to_bytes();
        feed(&mut mux, CLASSIC, &raw);
        assert_eq!(
            signals(&mut mux),
            vec![SignalingMessage::CommandReject {
                identifier: 5,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                data: Vec::new(),
            }]
        );
    }

    #[test]
    fn test_connection_parameter_update_request() {
        let mut mux = new_mux();
        mux.add_link(0x0003, LinkType::Le, Role::Peripheral);
        let params = ConnectionParameterUpdate {
            conn_interval_min: 24,
            conn_interval_max: 40,
            conn_latency: 0,
            supervision_timeout: 500,
        };

        feed_signal(
            &mut mux,
            LE,
            SignalingMessage::ConnectionParameterUpdateRequest { identifier: 4, params },
        );
        assert_eq!(
            signals(&mut mux),
            vec![SignalingMessage::ConnectionParameterUpdateResponse {
                identifier: 4,
                result: L2CAP_CONN_PARAM_ACCEPTED,
            }]
        );
        assert_eq!(
            mux.take_events(),
            vec![MuxEvent::ConnectionParametersRequested { handle: LE, params }]
        );

        // As peripheral we do not apply parameters ourselves
        let request = SignalingMessage::ConnectionParameterUpdateRequest { identifier: 5, params };
        feed(&mut mux, 0x0003, &request.to_packet(true).to_bytes());
        assert!(matches!(
            signals(&mut mux)[0],
            SignalingMessage::CommandReject { identifier: 5, .. }
        ));

        mux.request_connection_parameter_update(0x0003, params).unwrap();
        assert!(matches!(
            signals(&mut mux)[0],
            SignalingMessage::ConnectionParameterUpdateRequest { .. }
        ));
        assert_eq!(
            mux.request_connection_parameter_update(LE, params),
            Err(L2capError::InvalidState)
        );
    }

    #[test]
    fn test_controller_buffers_limit_sends() {
        let mut mux = new_mux();
        mux.set_acl_buffers(27, 2);
        let recorder = Recorder::default();
        let cid = open_classic(&mut mux, ChannelSpec::basic(0x1001), &recorder, ConfigOptions::default());
        recorder.take();
        assert_eq!(mux.acl_buffers_available(), Some(2));

        // 64-byte PDU needs three 27-byte fragments
        assert_eq!(mux.send(cid, &[0; 60]), Err(L2capError::WouldBlock));
        mux.send(cid, &[0; 40]).unwrap();
        assert_eq!(mux.queued_packets(), 2);
        assert_eq!(mux.send(cid, &[0; 4]), Err(L2capError::WouldBlock));

        let first = mux.pop_transmit().unwrap();
        let second = mux.pop_transmit().unwrap();
        assert!(mux.pop_transmit().is_none());
        assert_eq!(mux.acl_buffers_available(), Some(0));
        assert_eq!(first.packet[2] >> 4, PacketBoundary::FirstFlushable.bits());
        assert_eq!(second.packet[2] >> 4, PacketBoundary::Continuation.bits());

        mux.restore_transmit(second);
        assert_eq!(mux.acl_buffers_available(), Some(1));
        let second = mux.pop_transmit().unwrap();
        assert_eq!(second.handle, CLASSIC);

        mux.on_packets_completed(CLASSIC, 2);
        assert_eq!(mux.acl_buffers_available(), Some(2));
        assert_eq!(recorder.take(), vec![Record::CanSend(cid)]);
        mux.send(cid, &[0; 4]).unwrap();
    }

    #[test]
    fn test_ertm_window_and_acknowledgement() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(
            &mut mux,
            ChannelSpec::enhanced_retransmission(0x1001),
            &recorder,
            ertm_options(2, 50),
        );
        assert_eq!(recorder.take(), vec![Record::Opened(cid)]);

        mux.send(cid, b"one").unwrap();
        mux.send(cid, b"two").unwrap();
        assert_eq!(mux.send(cid, b"three"), Err(L2capError::WouldBlock));
        assert_eq!(mux.channel(cid).unwrap().unacked_frames(), Some(2));

        let frames = outgoing(&mut mux);
        assert_eq!(frames.len(), 2);
        let bytes = frames[1].to_bytes();
        let (control, info) = parse_frame(&bytes, true).unwrap();
        assert!(!control.supervisory);
        assert_eq!(control.tx_seq, 1);
        assert_eq!(control.sar, L2CAP_SAR_UNSEGMENTED);
        assert_eq!(info, b"two");

        let ack = L2capControlField::new_s_frame(L2CAP_SUPERVISORY_RR, 2, false, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, ack, None, &[], true));
        assert_eq!(mux.channel(cid).unwrap().unacked_frames(), Some(0));
        assert_eq!(recorder.take(), vec![Record::CanSend(cid)]);

        // Peer I-frame is delivered and acknowledged
        let data = L2capControlField::new_i_frame(0, 2, L2CAP_SAR_UNSEGMENTED, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, data, None, b"ping", true));
        assert_eq!(recorder.take(), vec![Record::Data(cid, b"ping".to_vec())]);
        let frames = outgoing(&mut mux);
        let (control, _) = parse_frame(&frames[0].to_bytes(), true).unwrap();
        assert!(control.supervisory);
        assert_eq!(control.supervisory_function, L2CAP_SUPERVISORY_RR);
        assert_eq!(control.req_seq, 1);

        // A gap in TxSeq is answered with a single REJ
        let gap = L2capControlField::new_i_frame(2, 2, L2CAP_SAR_UNSEGMENTED, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, gap, None, b"late", true));
        let gap = L2capControlField::new_i_frame(3, 2, L2CAP_SAR_UNSEGMENTED, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, gap, None, b"later", true));
        let frames = outgoing(&mut mux);
        assert_eq!(frames.len(), 1);
        let (control, _) = parse_frame(&frames[0].to_bytes(), true).unwrap();
        assert_eq!(control.supervisory_function, L2CAP_SUPERVISORY_REJ);
        assert_eq!(control.req_seq, 1);
        assert!(recorder.take().is_empty());

        // Corrupted FCS is a violation, not a delivery
        let mut corrupt = build_frame(cid, L2capControlField::new_i_frame(1, 2, 0, false), None, b"x", true);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        let before = mux.stats().protocol_violations;
        feed(&mut mux, CLASSIC, &corrupt);
        assert_eq!(mux.stats().protocol_violations, before + 1);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_ertm_segments_to_remote_mps() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(
            &mut mux,
            ChannelSpec::enhanced_retransmission(0x1001),
            &recorder,
            ertm_options(8, 50),
        );

        mux.send(cid, &[7; 120]).unwrap();
        let frames = outgoing(&mut mux);
        let sars: Vec<u8> = frames
            .iter()
            .map(|frame| parse_frame(&frame.to_bytes(), true).unwrap().0.sar)
            .collect();
        assert_eq!(sars, vec![L2CAP_SAR_START, L2CAP_SAR_CONTINUATION, L2CAP_SAR_END]);
        assert_eq!(mux.channel(cid).unwrap().unacked_frames(), Some(3));
    }

    #[test]
    fn test_ertm_retransmission_exhaustion_closes_channel() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let cid = open_classic(
            &mut mux,
            ChannelSpec::enhanced_retransmission(0x1001),
            &recorder,
            ertm_options(4, 100),
        );
        recorder.take();

        mux.send(cid, b"lost").unwrap();
        outgoing(&mut mux);
        let base = Instant::now();

        mux.tick(base + Duration::from_secs(3));
        let resent = outgoing(&mut mux);
        assert_eq!(resent.len(), 1);
        let bytes = resent[0].to_bytes();
        let (control, info) = parse_frame(&bytes, true).unwrap();
        assert_eq!((control.tx_seq, info), (0, &b"lost"[..]));

        mux.tick(base + Duration::from_secs(6));
        assert_eq!(outgoing(&mut mux).len(), 1);

        mux.tick(base + Duration::from_secs(9));
        assert_eq!(recorder.take(), vec![Record::Closed(cid, CloseReason::RetransmissionFailed)]);
        assert!(matches!(
            signals(&mut mux).as_slice(),
            [SignalingMessage::DisconnectionRequest { .. }]
        ));
    }

    #[test]
    fn test_streaming_drops_incomplete_sdu() {
        let mut mux = new_mux();
        let recorder = Recorder::default();
        let peer = ConfigOptions {
            retransmission: Some(RetransmissionFlowControl::for_mode(RetransmissionMode::Streaming, 0, 100)),
            fcs: Some(L2CAP_FCS_CRC16),
            ..Default::default()
        };
        let cid = open_classic(&mut mux, ChannelSpec::streaming(0x1001), &recorder, peer);
        recorder.take();

        let start = L2capControlField::new_i_frame(0, 0, L2CAP_SAR_START, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, start, Some(4), b"ab", true));
        // TxSeq 1 lost; the end segment cannot complete the SDU
        let end = L2capControlField::new_i_frame(2, 0, L2CAP_SAR_END, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, end, None, b"cd", true));
        assert!(recorder.take().is_empty());

        let whole = L2capControlField::new_i_frame(3, 0, L2CAP_SAR_UNSEGMENTED, false);
        feed(&mut mux, CLASSIC, &build_frame(cid, whole, None, b"abcd", true));
        assert_eq!(recorder.take(), vec![Record::Data(cid, b"abcd".to_vec())]);
        // Streaming mode never acknowledges
        assert!(outgoing(&mut mux).is_empty());
    }
}
