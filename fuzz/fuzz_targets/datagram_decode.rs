#![no_main]

use libfuzzer_sys::fuzz_target;
use wire::{decode_datagram, encode_datagram, encoded_len, Limits};

fuzz_target!(|data: &[u8]| {
    let Ok(datagram) = decode_datagram(data, &Limits::default()) else {
        return;
    };

    // Accepted datagrams are canonical.
    let mut buf = vec![0u8; encoded_len(&datagram.commands)];
    let len = encode_datagram(&datagram.header, &datagram.commands, &mut buf)
        .expect("decoded datagram re-encodes");
    assert_eq!(&buf[..len], data);
});
