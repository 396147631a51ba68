#![no_main]

use std::net::SocketAddr;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use proto::{Host, HostConfig, LinkConditioner, SimNetwork};

fuzz_target!(|data: &[u8]| {
    let network = SimNetwork::new(0);
    network.set_conditioner(LinkConditioner::perfect());
    let remote = SocketAddr::from(([203, 0, 113, 1], 9000));
    let local = SocketAddr::from(([203, 0, 113, 2], 9000));
    let mut host = Host::new(HostConfig::for_testing(), network.endpoint(local))
        .expect("test config is valid");

    // Split the input into datagrams: one length byte, then the bytes.
    let mut idx = 0usize;
    while idx < data.len() && idx < 8192 {
        let len = usize::from(data[idx]).saturating_add(1);
        idx += 1;
        let end = (idx + len).min(data.len());
        network.inject(remote, local, data[idx..end].to_vec());
        idx = end;

        if let Ok(events) = host.service(Duration::ZERO) {
            events.for_each(drop);
        }
        network.advance(Duration::from_millis(7));
    }
    let _ = host.flush();
});
