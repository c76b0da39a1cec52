use bytes::Bytes;
use pretty_assertions::assert_eq;
use proptest::collection::vec;
use proptest::prelude::*;
use spacetimedb_client_api_messages::energy::EnergyQuanta;
use spacetimedb_client_api_messages::websocket::{
    BsatnRowList, CallReducer, CallReducerFlags, ClientMessage, CompressableQueryUpdate, CompressionError,
    DatabaseUpdate, IdentityToken, InitialSubscription, QueryId, QueryUpdate, ReducerCallInfo, ServerMessage,
    SubscribeMulti, SubscribeMultiApplied, SubscriptionError, TableUpdate, TransactionUpdate,
    TransactionUpdateLight, UnsubscribeMulti, UnsubscribeMultiApplied, UpdateStatus,
};
use spacetimedb_sats::bsatn::Reader;
use spacetimedb_sats::{ConnectionId, Identity, TimeDuration, Timestamp};
use std::io::Write;

fn gzip(bytes: &[u8]) -> Bytes {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(bytes).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

fn arb_bytes() -> impl Strategy<Value = Bytes> {
    vec(any::<u8>(), 0..64).prop_map(Bytes::from)
}

fn arb_row_list() -> impl Strategy<Value = BsatnRowList> {
    vec(arb_bytes(), 0..8).prop_map(|rows| rows.into_iter().collect())
}

fn arb_query_update() -> impl Strategy<Value = QueryUpdate> {
    (arb_row_list(), arb_row_list()).prop_map(|(deletes, inserts)| QueryUpdate { deletes, inserts })
}

fn arb_database_update() -> impl Strategy<Value = DatabaseUpdate> {
    vec(
        (".{0,12}", vec(arb_query_update(), 0..3)).prop_map(|(table_name, updates)| TableUpdate {
            table_name: table_name.into(),
            updates: updates.into_iter().map(CompressableQueryUpdate::Uncompressed).collect(),
        }),
        0..4,
    )
    .prop_map(|tables| DatabaseUpdate { tables })
}

fn arb_client_message() -> impl Strategy<Value = ClientMessage> {
    prop_oneof![
        (".{0,20}", arb_bytes(), any::<u32>(), any::<bool>()).prop_map(|(reducer, args, request_id, notify)| {
            ClientMessage::CallReducer(CallReducer {
                reducer: reducer.into(),
                args,
                request_id,
                flags: if notify {
                    CallReducerFlags::FullUpdate
                } else {
                    CallReducerFlags::NoSuccessNotify
                },
            })
        }),
        (vec(".{0,30}", 0..5), any::<u32>(), any::<u32>()).prop_map(|(queries, request_id, query_id)| {
            ClientMessage::SubscribeMulti(SubscribeMulti {
                query_strings: queries.into_iter().map(Into::into).collect(),
                request_id,
                query_id: QueryId::new(query_id),
            })
        }),
        (any::<u32>(), any::<u32>()).prop_map(|(request_id, query_id)| {
            ClientMessage::UnsubscribeMulti(UnsubscribeMulti {
                request_id,
                query_id: QueryId::new(query_id),
            })
        }),
    ]
}

fn arb_status() -> impl Strategy<Value = UpdateStatus> {
    prop_oneof![
        arb_database_update().prop_map(UpdateStatus::Committed),
        ".{0,40}".prop_map(|msg: String| UpdateStatus::Failed(msg.into())),
        Just(UpdateStatus::OutOfEnergy),
    ]
}

fn arb_server_message() -> impl Strategy<Value = ServerMessage> {
    prop_oneof![
        (arb_database_update(), any::<u32>(), any::<i64>()).prop_map(|(database_update, request_id, micros)| {
            ServerMessage::InitialSubscription(InitialSubscription {
                database_update,
                request_id,
                total_host_execution_duration: TimeDuration::from_micros(micros),
            })
        }),
        (arb_status(), any::<i64>(), any::<[u8; 32]>(), any::<u128>(), ".{0,16}", arb_bytes(), any::<u128>()).prop_map(
            |(status, ts, identity, conn_id, reducer, args, energy)| {
                ServerMessage::TransactionUpdate(TransactionUpdate {
                    status,
                    timestamp: Timestamp::from_micros(ts),
                    caller_identity: Identity::from_le_byte_array(identity),
                    caller_connection_id: ConnectionId::from_u128(conn_id),
                    reducer_call: ReducerCallInfo {
                        reducer_name: reducer.into(),
                        request_id: 0,
                        args,
                    },
                    energy_quanta_used: EnergyQuanta::new(energy),
                    total_host_execution_duration: TimeDuration::ZERO,
                })
            }
        ),
        (any::<u32>(), arb_database_update()).prop_map(|(request_id, update)| {
            ServerMessage::TransactionUpdateLight(TransactionUpdateLight { request_id, update })
        }),
        (any::<[u8; 32]>(), ".{0,32}", any::<u128>()).prop_map(|(identity, token, conn_id)| {
            ServerMessage::IdentityToken(IdentityToken {
                identity: Identity::from_le_byte_array(identity),
                token: token.into(),
                connection_id: ConnectionId::from_u128(conn_id),
            })
        }),
        (any::<u32>(), any::<u32>(), arb_database_update()).prop_map(|(request_id, query_id, update)| {
            ServerMessage::SubscribeMultiApplied(SubscribeMultiApplied {
                request_id,
                total_host_execution_duration: TimeDuration::ZERO,
                query_id: QueryId::new(query_id),
                update,
            })
        }),
        (any::<u32>(), any::<u32>(), arb_database_update()).prop_map(|(request_id, query_id, update)| {
            ServerMessage::UnsubscribeMultiApplied(UnsubscribeMultiApplied {
                request_id,
                total_host_execution_duration: TimeDuration::ZERO,
                query_id: QueryId::new(query_id),
                update,
            })
        }),
        (proptest::option::of(any::<u32>()), proptest::option::of(any::<u32>()), ".{0,40}").prop_map(
            |(request_id, query_id, error)| {
                ServerMessage::SubscriptionError(SubscriptionError {
                    total_host_execution_duration: TimeDuration::ZERO,
                    request_id,
                    query_id: query_id.map(QueryId::new),
                    error: error.into(),
                })
            }
        ),
    ]
}

proptest! {
    #[test]
    fn client_message_round_trips(msg in arb_client_message()) {
        let bytes = msg.to_vec();
        let decoded = ClientMessage::decode(&mut Reader::new(&bytes)).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn server_message_round_trips(msg in arb_server_message()) {
        let bytes = msg.to_vec();
        let decoded = ServerMessage::decode(&mut Reader::new(&bytes)).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn gzipped_query_update_inflates(update in arb_query_update()) {
        let mut plain = Vec::new();
        update.encode(&mut plain);
        let compressed = CompressableQueryUpdate::Gzip(gzip(&plain));
        prop_assert_eq!(compressed.maybe_decompress().unwrap(), update);
    }
}

#[test]
fn call_reducer_flags_map_to_wire() {
    assert_eq!(CallReducerFlags::FullUpdate.to_u8(), 0);
    assert_eq!(CallReducerFlags::NoSuccessNotify.to_u8(), 1);
}

#[test]
fn one_off_query_response_decodes_as_marker() {
    let bytes = ServerMessage::OneOffQueryResponse.to_vec();
    assert_eq!(bytes, [4]);
    let decoded = ServerMessage::decode(&mut Reader::new(&bytes)).unwrap();
    assert_eq!(decoded, ServerMessage::OneOffQueryResponse);
}

#[test]
fn brotli_query_update_is_rejected() {
    let update = CompressableQueryUpdate::Brotli(Bytes::from_static(b"\x0b\x02\x80hi\x03"));
    let err = update.maybe_decompress().unwrap_err();
    assert!(matches!(err, CompressionError::BrotliUnsupported));
    assert!(err.to_string().contains("Brotli"));
}

#[test]
fn zero_connection_id_is_the_none_sentinel() {
    let msg = ServerMessage::IdentityToken(IdentityToken {
        identity: Identity::ZERO,
        token: "tok".into(),
        connection_id: ConnectionId::ZERO,
    });
    let bytes = msg.to_vec();
    match ServerMessage::decode(&mut Reader::new(&bytes)).unwrap() {
        ServerMessage::IdentityToken(tok) => assert_eq!(tok.connection_id.none_if_zero(), None),
        other => panic!("unexpected message {other:?}"),
    }
}
