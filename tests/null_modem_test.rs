// Integration tests for the virtual null-modem pair
//
// Usage: cargo test --test null_modem_test

use std::sync::Arc;
use std::time::Duration;

use null_modem::{
    EventMask, IoRequest, ModemError, NullModem, PortConfig, PortPair, Side, Status, Transport,
    VirtualPort,
};

fn open_pair(a: PortConfig, b: PortConfig) -> PortPair {
    let mut pair = PortPair::new(a, b);
    pair.open(Side::A).unwrap();
    pair.open(Side::B).unwrap();
    pair
}

fn read_now(pair: &mut PortPair, side: Side, len: usize) -> Vec<u8> {
    let dispatch = pair.submit(side, IoRequest::Read { len }).unwrap();
    let id = dispatch.handle.id;
    let mut data = dispatch
        .completed
        .into_iter()
        .find(|c| c.id == id)
        .map(|c| c.data);
    if data.is_none() {
        // Still pending: take what arrived and give the rest up.
        data = pair
            .cancel(&dispatch.handle)
            .into_iter()
            .find(|c| c.id == id)
            .map(|c| c.data);
    }
    data.unwrap_or_default()
}

#[test]
fn test_bytes_are_conserved_minus_overrun() {
    let mut b = PortConfig {
        buffer_size: 32,
        ..PortConfig::default()
    };
    b.options.emulate_overrun = true;
    let mut pair = open_pair(PortConfig::default(), b);

    let payload: Vec<u8> = (0u8..100).collect();
    let mut read = Vec::new();
    for chunk in payload.chunks(10) {
        let write = pair.submit(Side::A, IoRequest::Write(chunk.to_vec())).unwrap();
        assert_eq!(write.status, Status::Success, "overrun emulation never holds the writer");
        read.extend(read_now(&mut pair, Side::B, 3));
    }
    let in_ring = pair.comm_status(Side::B).in_queue;
    read.extend(read_now(&mut pair, Side::B, in_ring));

    let a = pair.stats(Side::A);
    let b = pair.stats(Side::B);
    assert_eq!(a.transmitted, 100);
    assert_eq!(b.received, 100);
    assert!(b.overrun > 0);
    assert_eq!(read.len() as u64, a.transmitted - b.overrun);

    // What arrived is an in-order subsequence of what was sent.
    let mut sent = payload.iter();
    for byte in &read {
        assert!(sent.any(|b| b == byte), "byte {byte} out of order");
    }
}

#[test]
fn test_direct_and_buffered_paths_deliver_identical_bytes() {
    let escape = 0x7E;
    let config = PortConfig {
        escape: Some(escape),
        ..PortConfig::default()
    };
    let payload: Vec<u8> = (0..64).map(|i| if i % 9 == 0 { escape } else { i as u8 }).collect();

    // Buffered: data lands in the ring before the read arrives.
    let mut buffered = open_pair(PortConfig::default(), config.clone());
    buffered.purge(Side::B, null_modem::PurgeFlags::RXCLEAR);
    buffered.submit(Side::A, IoRequest::Write(payload.clone())).unwrap();
    let in_ring = buffered.comm_status(Side::B).in_queue;
    let via_ring = read_now(&mut buffered, Side::B, in_ring);

    // Direct: the read is already waiting.
    let mut direct = open_pair(PortConfig::default(), config);
    direct.purge(Side::B, null_modem::PurgeFlags::RXCLEAR);
    let read = direct.submit(Side::B, IoRequest::Read { len: in_ring }).unwrap();
    let write = direct.submit(Side::A, IoRequest::Write(payload)).unwrap();
    let via_read = write
        .completed
        .into_iter()
        .find(|c| c.id == read.handle.id)
        .map(|c| c.data)
        .unwrap();

    assert_eq!(via_ring, via_read);
    assert_eq!(direct.comm_status(Side::B).in_queue, 0);
}

#[test]
fn test_exclusive_and_plug_in_modes() {
    let mut a = PortConfig::default();
    a.options.exclusive_mode = true;
    let mut b = PortConfig::default();
    b.options.plug_in_mode = true;
    let mut pair = PortPair::new(a, b);

    assert_eq!(pair.open(Side::B).unwrap_err(), ModemError::NotConnected(Side::B));
    pair.open(Side::A).unwrap();
    assert_eq!(pair.open(Side::A).unwrap_err(), ModemError::Busy(Side::A));

    pair.open(Side::B).unwrap();
    pair.open(Side::B).unwrap();
    pair.close(Side::B).unwrap();
    assert!(pair.is_open(Side::B), "B still has one open handle");
    pair.close(Side::B).unwrap();
    assert_eq!(pair.close(Side::B).unwrap_err(), ModemError::NotOpen(Side::B));
}

#[tokio::test]
async fn test_dsr_change_reaches_waiter() {
    let modem = NullModem::new(PortConfig::default(), PortConfig::default());
    modem.open(Side::A).unwrap();
    modem.open(Side::B).unwrap();

    modem.update(|pair| pair.set_wait_mask(Side::B, EventMask::DSR | EventMask::RLSD));
    let wait = modem.submit(Side::B, IoRequest::WaitEvent).unwrap();
    modem.update(|pair| pair.set_control_lines(Side::A, None, Some(false)));

    let done = wait.wait().await.unwrap();
    assert_eq!(done.status, Status::Success);
    assert_eq!(done.events, EventMask::DSR | EventMask::RLSD);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_race_yields_one_completion_each() {
    let modem = Arc::new(NullModem::new(PortConfig::default(), PortConfig::default()));
    modem.open(Side::A).unwrap();
    modem.open(Side::B).unwrap();

    const ROUNDS: usize = 200;
    let reader = {
        let modem = modem.clone();
        tokio::spawn(async move {
            let mut got = 0;
            for _ in 0..ROUNDS {
                let read = modem.submit(Side::B, IoRequest::Read { len: 4 }).unwrap();
                tokio::task::yield_now().await;
                modem.cancel(read.handle());
                let done = read.wait().await.expect("every request completes");
                assert!(matches!(done.status, Status::Success | Status::Cancelled));
                got += done.data.len();
            }
            got
        })
    };
    let writer = {
        let modem = modem.clone();
        tokio::spawn(async move {
            for i in 0..ROUNDS {
                let write = modem.submit(Side::A, IoRequest::Write(vec![i as u8; 4])).unwrap();
                let done = write.wait().await.unwrap();
                assert_eq!(done.status, Status::Success);
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    let got = reader.await.unwrap();
    let left = modem.comm_status(Side::B).in_queue;
    assert_eq!(got + left, ROUNDS * 4);
}

#[tokio::test]
async fn test_virtual_ports_echo() {
    let modem = Arc::new(NullModem::new(PortConfig::default(), PortConfig::default()));
    modem.start();
    let a = VirtualPort::open(modem.clone(), Side::A).unwrap();
    let b = VirtualPort::open(modem.clone(), Side::B).unwrap();

    let echo = tokio::spawn(async move {
        let mut buffer = [0u8; 32];
        let n = b.receive(&mut buffer).await.unwrap();
        b.send(&buffer[..n]).await.unwrap();
    });

    a.send(b"marco").await.unwrap();
    let mut buffer = [0u8; 32];
    let n = tokio::time::timeout(Duration::from_secs(2), a.receive(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buffer[..n], b"marco");
    echo.await.unwrap();
    modem.stop();
}
