//! Tests for the protocol module
//!
//! These verify envelope layout, kind/target validation and the payload
//! layouts for requests and replies.

#[cfg(test)]
mod tests {
    use super::super::payload::*;
    use super::super::*;
    use crate::coder::{Archive, ClassRegistry, ObjectGraph, Value};

    fn registry() -> ClassRegistry {
        ClassRegistry::new().with_class(RemoteReference::class_info())
    }

    // ========================================================================
    // Envelopes
    // ========================================================================

    #[test]
    fn test_method_request_layout() {
        let envelope = Envelope::method_request(7, 3, vec![0xAB, 0xCD]);
        let bytes = envelope.encode();
        assert_eq!(&bytes[..], &[0, 0, 0, 0, 7, 0, 0, 0, 3, 0xAB, 0xCD]);
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
        assert_eq!(envelope.encoded_len(), bytes.len());
    }

    #[test]
    fn test_bare_kinds_have_no_target_or_payload() {
        for envelope in [Envelope::root_proxy_request(9), Envelope::shutdown()] {
            let bytes = envelope.encode();
            assert_eq!(bytes.len(), ENVELOPE_PREFIX_LEN);
            let decoded = Envelope::decode(&bytes).unwrap();
            assert_eq!(decoded.target, None);
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn test_retain_carries_target_only() {
        let bytes = Envelope::proxy_retain(4, 12).encode();
        assert_eq!(bytes.len(), ENVELOPE_PREFIX_LEN + 4);
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, MessageKind::ProxyRetain);
        assert_eq!(decoded.target, Some(12));
    }

    #[test]
    fn test_reply_has_no_target() {
        let envelope = Envelope::reply(MessageKind::MethodReply, 5, vec![1]);
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.sequence, 5);
        assert_eq!(decoded.target, None);
        assert_eq!(&decoded.payload[..], &[1]);
    }

    #[test]
    fn test_unknown_kind_is_protocol_violation() {
        let err = Envelope::decode(&[42, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, DistobjError::ProtocolViolation(_)));
    }

    #[test]
    fn test_missing_payload_is_protocol_violation() {
        let bytes = [MessageKind::MethodRequest as u8, 0, 0, 0, 1, 0, 0, 0, 2];
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(DistobjError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unexpected_payload_is_protocol_violation() {
        let bytes = [MessageKind::RootProxyRequest as u8, 0, 0, 0, 1, 0xFF];
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(DistobjError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_short_envelopes_are_truncated() {
        assert!(matches!(
            Envelope::decode(&[0, 0, 0]),
            Err(DistobjError::TruncatedStream { .. })
        ));
        assert!(matches!(
            Envelope::decode(&[MessageKind::MethodRequest as u8, 0, 0, 0, 1, 0]),
            Err(DistobjError::TruncatedStream { .. })
        ));
    }

    #[test]
    fn test_peek_survives_invalid_kind() {
        assert_eq!(Envelope::peek(&[200, 0, 0, 1, 0]).unwrap(), (200, 256));
    }

    #[test]
    fn test_reply_kinds() {
        assert_eq!(MessageKind::MethodRequest.reply_kind(), Some(MessageKind::MethodReply));
        assert_eq!(MessageKind::ProxyRetain.reply_kind(), Some(MessageKind::RetainReply));
        assert_eq!(MessageKind::ProxyRelease.reply_kind(), None);
        assert!(MessageKind::RetainReply.is_reply());
        assert!(!MessageKind::ConnectionShutdown.is_reply());
        for byte in 0..10u8 {
            assert_eq!(MessageKind::from_u8(byte).map(|k| k as u8), Some(byte));
        }
        assert_eq!(MessageKind::from_u8(10), None);
    }

    // ========================================================================
    // Payloads
    // ========================================================================

    #[test]
    fn test_method_call_payload() {
        let mut graph = ObjectGraph::new();
        let text = graph.cstring("hi");
        let arguments = Archive::new(graph, vec![Value::Int(1), text]);

        let bytes = encode_method_call("greet:times:", FLAG_ONEWAY, &arguments).unwrap().into_data();
        let call = decode_method_call(&bytes, &registry()).unwrap();
        assert_eq!(call.selector, "greet:times:");
        assert!(call.is_oneway());
        assert_eq!(call.arguments.roots.len(), 2);
        assert_eq!(call.arguments.graph.text(&call.arguments.roots[1]), Some("hi"));
    }

    #[test]
    fn test_method_call_requires_selector() {
        let bytes = crate::coder::archive(&ObjectGraph::new(), &[Value::Int(1), Value::UInt(0)]).unwrap();
        assert!(matches!(
            decode_method_call(&bytes, &registry()),
            Err(DistobjError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_success_reply_payload() {
        let results = Archive::new(ObjectGraph::new(), vec![Value::Long(99)]);
        let bytes = encode_success(&results).unwrap().into_data();
        match decode_reply(&bytes, &registry()).unwrap() {
            ReplyOutcome::Success(archive) => assert_eq!(archive.roots, vec![Value::Long(99)]),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_failure_reply_maps_back_to_error() {
        let failure = RemoteFailure::from_error(&DistobjError::ProtocolViolation("no such target 4".into()));
        let bytes = encode_failure(&failure).unwrap();
        let outcome = decode_reply(&bytes, &registry()).unwrap();
        assert_eq!(outcome, ReplyOutcome::Failure(failure));

        let ReplyOutcome::Failure(failure) = outcome else { unreachable!() };
        assert!(matches!(failure.into_error(), DistobjError::ProtocolViolation(msg) if msg == "no such target 4"));
    }

    #[test]
    fn test_failure_kind_classification() {
        let truncated = DistobjError::TruncatedStream { offset: 0, needed: 4, available: 1 };
        assert_eq!(RemoteFailure::from_error(&truncated).kind, FailureKind::MalformedStream);
        assert_eq!(
            RemoteFailure::from_error(&DistobjError::UnknownClass("X".into())).kind,
            FailureKind::UnknownClass
        );
        assert_eq!(
            RemoteFailure::from_error(&DistobjError::ConnectionLost("gone".into())).kind,
            FailureKind::RemoteInvocation
        );
    }

    #[test]
    fn test_retain_reply_names_its_target() {
        let bytes = encode_retain_reply(12, true).unwrap();
        let ReplyOutcome::Success(archive) = decode_reply(&bytes, &registry()).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(granted_target(&archive.roots), Some(12));

        let bytes = encode_retain_reply(12, false).unwrap();
        let ReplyOutcome::Success(archive) = decode_reply(&bytes, &registry()).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(archive.roots, vec![Value::Bool(false), Value::UInt(12)]);
        assert_eq!(granted_target(&archive.roots), None);
    }

    #[test]
    fn test_count_and_selector_payloads() {
        let registry = registry();
        assert_eq!(decode_count(&encode_count(17).unwrap(), &registry).unwrap(), 17);
        assert_eq!(decode_selector(&encode_selector("value").unwrap(), &registry).unwrap(), "value");
        assert!(decode_count(&encode_selector("value").unwrap(), &registry).is_err());
    }

    // ========================================================================
    // Remote references
    // ========================================================================

    #[test]
    fn test_reference_round_trip_through_archive() {
        let mut graph = ObjectGraph::new();
        let reference = RemoteReference::new(8, Origin::Sender).with_class_hint("Counter");
        let node = reference.insert_into(&mut graph);
        let results = Archive::new(graph, vec![Value::Object(Some(node))]);

        let bytes = encode_success(&results).unwrap().into_data();
        let ReplyOutcome::Success(archive) = decode_reply(&bytes, &registry()).unwrap() else {
            panic!("expected success");
        };
        let found = RemoteReference::collect(&archive.graph).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, reference);
        assert_eq!(Some(found[0].0), archive.roots[0].as_object());
    }

    #[test]
    fn test_reference_with_bad_origin_is_malformed() {
        let mut graph = ObjectGraph::new();
        graph.insert(
            DISTANT_OBJECT_CLASS,
            vec![Value::UInt(1), Value::UChar(7), Value::CString(None)],
        );
        assert!(matches!(
            RemoteReference::collect(&graph),
            Err(DistobjError::MalformedStream(_))
        ));
    }
}
