// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Property tests over envelope encode/decode.

use crate::envelope::{Envelope, MessageKind};
use crate::frame::{encode, read_frame};
use proptest::prelude::*;
use tokio::io::BufReader;

fn kind_strategy() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Auth),
        Just(MessageKind::Registration),
        Just(MessageKind::Task),
        Just(MessageKind::Event),
        Just(MessageKind::Heartbeat),
        Just(MessageKind::Ping),
        Just(MessageKind::Pong),
    ]
}

fn envelope_strategy() -> impl Strategy<Value = Envelope> {
    (
        "[a-z0-9-]{1,23}",
        kind_strategy(),
        "[a-z_]{1,16}",
        proptest::option::of("[a-zA-Z0-9 \n\"\\\\]{0,64}"),
    )
        .prop_map(|(id, kind, agent, data)| {
            Envelope::new(
                id,
                kind,
                agent,
                "2026-01-01T00:00:00+00:00",
                match data {
                    // Strings with embedded newlines and quotes must
                    // survive framing via JSON escaping.
                    Some(s) => serde_json::Value::String(s),
                    None => serde_json::Value::Null,
                },
            )
        })
}

proptest! {
    #[test]
    fn any_envelope_roundtrips_through_a_frame(env in envelope_strategy()) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let bytes = encode(&env).unwrap();
            let mut reader = BufReader::new(std::io::Cursor::new(bytes));
            let back = read_frame(&mut reader).await.unwrap();
            prop_assert_eq!(back, env);
            Ok(())
        })?;
    }

    #[test]
    fn frames_never_contain_interior_newlines(env in envelope_strategy()) {
        let bytes = encode(&env).unwrap();
        prop_assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        prop_assert_eq!(bytes.last(), Some(&b'\n'));
    }
}
