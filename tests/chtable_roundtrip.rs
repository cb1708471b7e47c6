//! The server's mirrored hierarchy tracks the client's through deltas alone.

mod common;

use jitserver::chtable::{ClientChTable, ServerChTable};
use jitserver::core::{ClassId, ThreadBitSet};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Load { class: u64, super_class: u64, interface: Option<u64> },
    Unload(u64),
    ClearReservable(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..12u64, 1..12u64, proptest::option::of(1..12u64))
            .prop_filter("a class cannot extend itself", |(c, s, i)| c != s && *i != Some(*c))
            .prop_map(|(class, super_class, interface)| Op::Load { class, super_class, interface }),
        1 => (1..12u64).prop_map(Op::Unload),
        1 => (1..12u64).prop_map(Op::ClearReservable),
    ]
}

fn apply(client: &mut ClientChTable, op: &Op) {
    let none = ThreadBitSet::new();
    match *op {
        Op::Load {
            class,
            super_class,
            interface,
        } => {
            let interfaces: Vec<ClassId> = interface.map(ClassId::new).into_iter().collect();
            client.class_loaded(ClassId::new(class), Some(ClassId::new(super_class)), &interfaces, &none);
        }
        Op::Unload(class) => client.class_unloaded(ClassId::new(class)),
        Op::ClearReservable(class) => client.clear_reservable(ClassId::new(class)),
    }
}

proptest! {
    #[test]
    fn server_mirror_matches_client_after_every_delta(
        initial in prop::collection::vec(op(), 0..8),
        batches in prop::collection::vec(prop::collection::vec(op(), 0..10), 1..6),
    ) {
        common::init_logging();
        let mut client = ClientChTable::new();
        for op in &initial {
            apply(&mut client, op);
        }
        let mut server = ServerChTable::new();
        server.apply_update(&client.serialize_all());
        prop_assert_eq!(server.table().snapshot(), client.table().snapshot());

        for batch in &batches {
            for op in batch {
                apply(&mut client, op);
            }
            server.apply_update(&client.serialize_updates());
            prop_assert!(!client.has_pending_delta());
            prop_assert_eq!(server.table().snapshot(), client.table().snapshot());
        }
    }
}

#[test]
fn test_delta_before_initialization_is_dropped() {
    common::init_logging();
    let mut client = ClientChTable::new();
    let none = ThreadBitSet::new();
    client.class_loaded(ClassId::new(2), Some(ClassId::new(1)), &[], &none);

    let mut server = ServerChTable::new();
    server.apply_update(&client.serialize_updates());
    assert!(!server.is_initialized());
    assert!(server.table().is_empty());

    server.apply_update(&client.serialize_all());
    assert!(server.is_initialized());
    assert_eq!(server.table().snapshot(), client.table().snapshot());
}
