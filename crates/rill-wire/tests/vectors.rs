use rill_wire::{ControlMessage, MessageKind};

// Frozen wire vectors; decoding any of these must keep working across
// releases, and re-encoding must parse back to the same message.
const VECTORS: &[(&str, &str)] = &[
    (
        "subscribe_request",
        r#"{"type":"subscribeRequest","requestId":"r1","streamId":"s1","streamPartition":0,"sessionToken":"session-token"}"#,
    ),
    (
        "subscribe_response",
        r#"{"type":"subscribeResponse","requestId":"r1","streamId":"s1","streamPartition":0}"#,
    ),
    (
        "unsubscribe_request",
        r#"{"type":"unsubscribeRequest","requestId":"r2","streamId":"s1","streamPartition":0}"#,
    ),
    (
        "resend_last_request",
        r#"{"type":"resendLastRequest","requestId":"r3","streamId":"s1","streamPartition":0,"numberLast":5,"sessionToken":null}"#,
    ),
    (
        "resend_range_request",
        r#"{"type":"resendRangeRequest","requestId":"r4","streamId":"s1","streamPartition":0,"fromMsgRef":{"timestamp":1,"sequenceNumber":1},"toMsgRef":{"timestamp":3,"sequenceNumber":0},"publisherId":"ab","msgChainId":"main","sessionToken":null}"#,
    ),
    (
        "resend_response_no_resend",
        r#"{"type":"resendResponseNoResend","requestId":"r3","streamId":"s1","streamPartition":0}"#,
    ),
    (
        "broadcast_message",
        r#"{"type":"broadcastMessage","streamMessage":{"messageId":{"streamId":"s1","streamPartition":0,"timestamp":1,"sequenceNumber":0,"publisherId":"ab","msgChainId":"main"},"prevMsgRef":null,"content":"{\"v\":1}","contentType":"json","encryptionType":"none","signatureType":"none","signature":null}}"#,
    ),
    (
        "unicast_message",
        r#"{"type":"unicastMessage","requestId":"r3","streamMessage":{"messageId":{"streamId":"s1","streamPartition":0,"timestamp":2,"sequenceNumber":0,"publisherId":"ab","msgChainId":"main"},"prevMsgRef":{"timestamp":1,"sequenceNumber":0},"content":"{}","contentType":"json","encryptionType":"none","signatureType":"none","signature":null}}"#,
    ),
    (
        "error_response",
        r#"{"type":"errorResponse","requestId":"r9","errorCode":"not_found","errorMessage":"no such stream"}"#,
    ),
];

#[test]
fn vectors_decode_and_round_trip() {
    for (name, raw) in VECTORS {
        let decoded = ControlMessage::decode(raw.as_bytes())
            .unwrap_or_else(|err| panic!("decode {name}: {err}"));
        let encoded = decoded.encode().unwrap_or_else(|err| panic!("encode {name}: {err}"));
        let round = ControlMessage::decode(&encoded)
            .unwrap_or_else(|err| panic!("re-decode {name}: {err}"));
        assert_eq!(decoded, round, "round trip mismatch for {name}");
    }
}

#[test]
fn vectors_carry_expected_kinds() {
    let kinds: Vec<MessageKind> = VECTORS
        .iter()
        .map(|(name, raw)| {
            ControlMessage::decode(raw.as_bytes())
                .unwrap_or_else(|err| panic!("decode {name}: {err}"))
                .kind()
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            MessageKind::SubscribeRequest,
            MessageKind::SubscribeResponse,
            MessageKind::UnsubscribeRequest,
            MessageKind::ResendLastRequest,
            MessageKind::ResendRangeRequest,
            MessageKind::ResendResponseNoResend,
            MessageKind::BroadcastMessage,
            MessageKind::UnicastMessage,
            MessageKind::ErrorResponse,
        ]
    );
}
