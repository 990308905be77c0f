//! Property tests for the identifier and E2AP codecs.

use proptest::prelude::*;
use submgr::e2ap::{
    self, ActionNotAdmitted, ActionType, Cause, CauseGroup, Indication, IndicationType,
    SubscriptionDeleteFailure, SubscriptionDeleteRequest, SubscriptionDeleteResponse,
    SubscriptionFailure, SubscriptionRequest, SubscriptionResponse, SubsequentAction,
    SubsequentActionKind, HEADER_LEN, MAX_ACTIONS,
};
use submgr::identifier::{self, pack_digits, unpack_digits};
use submgr::{
    ActionDefinition, DecodeErrorKind, E2apMessage, Identifier, PlmnIdentity, RequestId,
    SubscriptionDetails,
};

fn identifier_strategy() -> impl Strategy<Value = Identifier> {
    ("[0-9]{3}", "[0-9]{2,3}", "[a-z0-9-]{1,24}").prop_map(|(mcc, mnc, node)| {
        Identifier::new(PlmnIdentity::new(&mcc, &mnc).unwrap(), node).unwrap()
    })
}

fn action_strategy() -> impl Strategy<Value = ActionDefinition> {
    (
        prop_oneof![
            Just(ActionType::Report),
            Just(ActionType::Insert),
            Just(ActionType::Policy)
        ],
        proptest::collection::vec(any::<u8>(), 0..32),
        proptest::option::of((any::<bool>(), 0u8..18)),
    )
        .prop_map(|(action_type, definition, subsequent)| ActionDefinition {
            action_id: 0,
            action_type,
            definition,
            subsequent: subsequent.map(|(wait, time_to_wait)| SubsequentAction {
                kind: if wait {
                    SubsequentActionKind::Wait
                } else {
                    SubsequentActionKind::Continue
                },
                time_to_wait,
            }),
        })
}

fn request_strategy() -> impl Strategy<Value = E2apMessage> {
    (
        any::<u32>(),
        any::<u32>(),
        identifier_strategy(),
        any::<u16>(),
        proptest::collection::vec(any::<u8>(), 0..64),
        proptest::collection::vec(action_strategy(), 1..=16),
    )
        .prop_map(|(requestor, instance, target, ran_function_id, event_trigger, mut actions)| {
            for (i, action) in actions.iter_mut().enumerate() {
                action.action_id = i as u8;
            }
            E2apMessage::SubscriptionRequest(SubscriptionRequest {
                request_id: RequestId::new(requestor, instance),
                target,
                details: SubscriptionDetails {
                    ran_function_id,
                    event_trigger,
                    actions,
                },
            })
        })
}

fn cause_strategy() -> impl Strategy<Value = Cause> {
    (
        prop_oneof![
            Just(CauseGroup::RicRequest),
            Just(CauseGroup::RicService),
            Just(CauseGroup::Transport),
            Just(CauseGroup::Protocol),
            Just(CauseGroup::Misc)
        ],
        any::<u8>(),
    )
        .prop_map(|(group, value)| Cause::new(group, value))
}

fn not_admitted_strategy() -> impl Strategy<Value = Vec<ActionNotAdmitted>> {
    proptest::collection::vec(
        (any::<u8>(), cause_strategy()).prop_map(|(action_id, cause)| ActionNotAdmitted { action_id, cause }),
        0..=MAX_ACTIONS,
    )
}

fn request_id_strategy() -> impl Strategy<Value = RequestId> {
    (any::<u32>(), any::<u32>()).prop_map(|(requestor, instance)| RequestId::new(requestor, instance))
}

/// Every message variant, including the responses and failures.
fn message_strategy() -> impl Strategy<Value = E2apMessage> {
    let response = (
        request_id_strategy(),
        any::<u16>(),
        identifier_strategy(),
        proptest::collection::vec(any::<u8>(), 0..=MAX_ACTIONS),
        not_admitted_strategy(),
    )
        .prop_map(|(request_id, ran_function_id, target, admitted, not_admitted)| {
            E2apMessage::SubscriptionResponse(SubscriptionResponse {
                request_id,
                ran_function_id,
                target,
                admitted,
                not_admitted,
            })
        });
    let failure = (
        request_id_strategy(),
        any::<u16>(),
        identifier_strategy(),
        cause_strategy(),
        not_admitted_strategy(),
    )
        .prop_map(|(request_id, ran_function_id, target, cause, not_admitted)| {
            E2apMessage::SubscriptionFailure(SubscriptionFailure {
                request_id,
                ran_function_id,
                target,
                cause,
                not_admitted,
            })
        });
    let delete_request = (request_id_strategy(), any::<u16>(), identifier_strategy()).prop_map(
        |(request_id, ran_function_id, target)| {
            E2apMessage::SubscriptionDeleteRequest(SubscriptionDeleteRequest {
                request_id,
                ran_function_id,
                target,
            })
        },
    );
    let delete_response = (request_id_strategy(), any::<u16>(), identifier_strategy()).prop_map(
        |(request_id, ran_function_id, target)| {
            E2apMessage::SubscriptionDeleteResponse(SubscriptionDeleteResponse {
                request_id,
                ran_function_id,
                target,
            })
        },
    );
    let delete_failure = (
        request_id_strategy(),
        any::<u16>(),
        identifier_strategy(),
        cause_strategy(),
    )
        .prop_map(|(request_id, ran_function_id, target, cause)| {
            E2apMessage::SubscriptionDeleteFailure(SubscriptionDeleteFailure {
                request_id,
                ran_function_id,
                target,
                cause,
            })
        });
    let indication = (
        (request_id_strategy(), any::<u16>(), identifier_strategy(), any::<u8>()),
        (
            proptest::option::of(any::<u32>()),
            prop_oneof![Just(IndicationType::Report), Just(IndicationType::Insert)],
            proptest::collection::vec(any::<u8>(), 0..32),
            proptest::collection::vec(any::<u8>(), 0..64),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..16)),
        ),
    )
        .prop_map(
            |(
                (request_id, ran_function_id, target, action_id),
                (sequence_number, indication_type, header, message, call_process_id),
            )| {
                E2apMessage::Indication(Indication {
                    request_id,
                    ran_function_id,
                    target,
                    action_id,
                    sequence_number,
                    indication_type,
                    header,
                    message,
                    call_process_id,
                })
            },
        );

    prop_oneof![
        request_strategy(),
        response,
        failure,
        delete_request,
        delete_response,
        delete_failure,
        indication,
    ]
}

proptest! {
    #[test]
    fn identifier_roundtrips(id in identifier_strategy()) {
        let bytes = identifier::encode(&id).unwrap();
        prop_assert_eq!(identifier::decode(&bytes).unwrap(), id.clone());
        prop_assert_eq!(id.to_string().parse::<Identifier>().unwrap(), id);
    }

    #[test]
    fn digit_strings_roundtrip(digits in "[0-9]{1,16}") {
        let packed = pack_digits(&digits).unwrap();
        prop_assert_eq!(packed.len(), (digits.len() + 1) / 2);
        prop_assert_eq!(unpack_digits(&packed, digits.len()).unwrap(), digits);
    }

    #[test]
    fn subscription_request_roundtrips(msg in request_strategy()) {
        let bytes = e2ap::pack(&msg).unwrap();
        prop_assert_eq!(e2ap::pack(&msg).unwrap(), bytes.clone());
        prop_assert_eq!(e2ap::unpack(&bytes).unwrap(), msg);
    }

    #[test]
    fn every_message_variant_roundtrips(msg in message_strategy()) {
        let bytes = e2ap::pack(&msg).unwrap();
        prop_assert_eq!(e2ap::pack(&msg).unwrap(), bytes.clone());
        prop_assert_eq!(e2ap::unpack(&bytes).unwrap(), msg);
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        let first = e2ap::unpack(&bytes).map_err(|e| e.kind());
        let second = e2ap::unpack(&bytes).map_err(|e| e.kind());
        prop_assert_eq!(first, second);
        let _ = identifier::decode(&bytes);
    }

    #[test]
    fn every_strict_prefix_is_rejected(msg in message_strategy(), cut in any::<prop::sample::Index>()) {
        let bytes = e2ap::pack(&msg).unwrap();
        let len = cut.index(bytes.len());
        let err = e2ap::unpack(&bytes[..len]).unwrap_err();
        prop_assert_eq!(err.kind(), DecodeErrorKind::Truncated);
    }
}

#[test]
fn test_buffer_shorter_than_header_is_truncated() {
    for len in 0..HEADER_LEN {
        let bytes = vec![0u8; len];
        assert_eq!(
            e2ap::unpack(&bytes).unwrap_err().kind(),
            DecodeErrorKind::Truncated
        );
    }
}

#[test]
fn test_delete_failure_wire_header() {
    let msg = E2apMessage::SubscriptionDeleteFailure(SubscriptionDeleteFailure {
        request_id: RequestId::new(123, 0x0102_0304),
        ran_function_id: 0x0a0b,
        target: "310-410/cell-7".parse().unwrap(),
        cause: Cause::new(CauseGroup::Misc, 2),
    });
    let bytes = e2ap::pack(&msg).unwrap();
    assert_eq!(bytes[0], 2);
    assert_eq!(bytes[1], 9);
    assert_eq!(&bytes[2..6], &123u32.to_be_bytes());
    assert_eq!(&bytes[6..10], &[1, 2, 3, 4]);
    assert_eq!(&bytes[10..12], &[0x0a, 0x0b]);
    let body_len = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
    assert_eq!(body_len, bytes.len() - HEADER_LEN);
}
