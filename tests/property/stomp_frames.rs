//! Property tests for the STOMP codec.
//!
//! 1. Arbitrary bytes never make `decode` panic.
//! 2. Header escaping is lossless for any string.
//! 3. A frame built from arbitrary headers and body decodes to itself.

use proptest::prelude::*;
use taskflow_proto::stomp::{self, Command, Frame};

fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::Send),
        Just(Command::Subscribe),
        Just(Command::Unsubscribe),
        Just(Command::Message),
        Just(Command::Receipt),
        Just(Command::Error),
        Just(Command::Disconnect),
    ]
}

fn arb_headers() -> impl Strategy<Value = Vec<(String, String)>> {
    // content-length is derived by the encoder, so keep it out of the input.
    prop::collection::vec(("[a-z][a-z:\\\\\n-]{0,12}", "\\PC{0,24}"), 0..6).prop_map(|hs| {
        hs.into_iter()
            .filter(|(k, _)| k != "content-length")
            .collect()
    })
}

proptest! {
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = stomp::decode(&bytes);
    }

    #[test]
    fn escape_is_lossless(s in "\\PC*") {
        let escaped = stomp::escape_header(&s);
        prop_assert!(!escaped.contains('\n'));
        prop_assert!(!escaped.contains(':'));
        prop_assert_eq!(stomp::unescape_header(&escaped).unwrap(), s);
    }

    #[test]
    fn frames_survive_the_wire(
        command in arb_command(),
        headers in arb_headers(),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let frame = Frame { command, headers, body };
        let decoded = stomp::decode(&stomp::encode(&frame)).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0].body, &frame.body);
        let original: Vec<_> = frame.headers.iter().collect();
        let wire: Vec<_> = decoded[0]
            .headers
            .iter()
            .filter(|(k, _)| k != "content-length" || frame.body.is_empty())
            .collect();
        prop_assert_eq!(wire, original);
    }
}
