mod common;
use common::*;

use sma_bridge::coordinator::commands::read_data::ReadData;
use sma_bridge::sma::exchange::{Exchange, SessionContext};
use sma_bridge::sma::inverter::Transport;
use sma_bridge::sma::lri::DataSet;
use sma_bridge::sma::packet::{Request, Telegram, SEQUENCE_MASK};
use sma_bridge::sma::records::LiveSnapshot;
use std::time::Duration;

fn context() -> SessionContext {
    SessionContext::new(Connection::Speedwire, Duration::from_millis(10), 3)
}

fn bluetooth_context() -> SessionContext {
    SessionContext::new(Connection::Bluetooth, Duration::from_millis(10), 3)
}

fn grid_frequency(request: &Telegram) -> Telegram {
    Factory::reply(
        request,
        Factory::inverter(),
        Factory::records(&[Factory::dword(0x0046_5701, 1_700_000_000, 0x2244_6688)]),
    )
}

#[tokio::test]
async fn stale_reply_is_discarded_without_touching_the_snapshot() -> Result<()> {
    common_setup();

    let mut transport = MockTransport::new(|request, _| {
        let mut stale = Factory::reply(
            request,
            Factory::inverter(),
            Factory::records(&[Factory::dword(0x4046_4001, 1_700_000_000, 9_999)]),
        );
        stale.header.packet_id = request.sequence().wrapping_sub(1) & SEQUENCE_MASK;

        let fresh = Factory::reply(
            request,
            Factory::inverter(),
            Factory::records(&[Factory::dword(0x4046_4001, 1_700_000_300, 1_200)]),
        );
        vec![stale, fresh]
    });

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let mut snapshot = LiveSnapshot::default();

    ReadData::new(Factory::inverter(), Factory::ip(10), vec![DataSet::SpotACPower])
        .run(&mut exchange, &mut snapshot)
        .await?;

    assert_eq!(snapshot.ac[0].power, 1_200);
    assert_eq!(snapshot.timestamp, 1_700_000_300);
    Ok(())
}

#[tokio::test]
async fn fragments_are_collected_until_the_counter_reaches_zero() -> Result<()> {
    common_setup();

    let mut transport = MockTransport::new(|request, _| {
        let mut first = Factory::reply(
            request,
            Factory::inverter(),
            Factory::records(&[Factory::dword(0x4046_4001, 1_700_000_000, 1_000)]),
        );
        first.header.fragment = 1;
        let second = Factory::reply(
            request,
            Factory::inverter(),
            Factory::records(&[Factory::dword(0x4046_4101, 1_700_000_000, 1_100)]),
        );
        vec![first, second]
    });

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let request = Request::query(Factory::inverter(), 0x5100_0200, 0x0046_4000, 0x0046_42FF);
    let telegrams = exchange.request(&request, &Factory::ip(10)).await?;

    assert_eq!(telegrams.len(), 2);
    assert_eq!(telegrams[0].fragments_remaining(), 1);
    assert_eq!(telegrams[1].fragments_remaining(), 0);
    Ok(())
}

#[tokio::test]
async fn silence_ends_in_no_data() {
    common_setup();

    let mut transport = MockTransport::new(|_, _| Vec::new());
    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);

    let err = ReadData::new(Factory::inverter(), Factory::ip(10), vec![DataSet::SpotGridFrequency])
        .run(&mut exchange, &mut LiveSnapshot::default())
        .await
        .unwrap_err();

    assert_eq!(ProtocolError::of(&err), Some(&ProtocolError::NoData));
    assert_eq!(transport.sent.len(), 1);
}

#[tokio::test]
async fn rejected_set_is_skipped() -> Result<()> {
    common_setup();

    let mut transport = MockTransport::new(|request, _| {
        if request.word(4) == Some(0x0029_5A00) {
            vec![Factory::error_reply(request, Factory::inverter(), 0x0015)]
        } else {
            vec![Factory::reply(
                request,
                Factory::inverter(),
                Factory::records(&[Factory::dword(0x0026_3F01, 1_700_000_000, 2_500)]),
            )]
        }
    });

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let mut snapshot = LiveSnapshot::default();

    let missing = ReadData::new(
        Factory::inverter(),
        Factory::ip(10),
        vec![DataSet::BatteryChargeStatus, DataSet::SpotACTotalPower],
    )
    .run(&mut exchange, &mut snapshot)
    .await?;

    assert_eq!(snapshot.pac_total, 2_500);
    assert!(missing.contains(&0x0029_5A00));
    Ok(())
}

#[tokio::test]
async fn link_frames_alone_end_in_no_data() {
    common_setup();

    let mut transport = MockTransport::wire(Connection::Bluetooth, |_, _| {
        std::iter::repeat_with(Factory::topology).take(64).collect()
    });
    let ctx = bluetooth_context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let request = Request::query(Factory::inverter(), 0x5100_0200, 0x0046_5700, 0x0046_57FF);

    let err = exchange
        .request(&request, &Address::Bluetooth(Factory::bt_peer()))
        .await
        .unwrap_err();

    assert_eq!(ProtocolError::of(&err), Some(&ProtocolError::NoData));
    assert_eq!(transport.sent.len(), 1);
}

#[tokio::test]
async fn link_frames_between_replies_are_passed_over() -> Result<()> {
    common_setup();

    let mut transport = MockTransport::wire(Connection::Bluetooth, |request, _| {
        vec![
            Factory::topology(),
            Factory::topology(),
            Factory::bluetooth(grid_frequency(request)),
        ]
    });
    let ctx = bluetooth_context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let request = Request::query(Factory::inverter(), 0x5100_0200, 0x0046_5700, 0x0046_57FF);

    let telegrams = exchange
        .request(&request, &Address::Bluetooth(Factory::bt_peer()))
        .await?;
    assert_eq!(telegrams.len(), 1);
    Ok(())
}

#[tokio::test]
async fn corrupt_checksum_aborts_the_request() {
    common_setup();

    let mut transport = MockTransport::wire(Connection::Bluetooth, |request, _| {
        let mut corrupt = Factory::bluetooth(grid_frequency(request));
        let at = corrupt
            .windows(4)
            .position(|w| w == [0x88, 0x66, 0x44, 0x22])
            .unwrap();
        corrupt[at] = 0x89;

        vec![corrupt, Factory::bluetooth(grid_frequency(request))]
    });
    let ctx = bluetooth_context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let request = Request::query(Factory::inverter(), 0x5100_0200, 0x0046_5700, 0x0046_57FF);

    let err = exchange
        .request(&request, &Address::Bluetooth(Factory::bt_peer()))
        .await
        .unwrap_err();

    assert!(matches!(
        ProtocolError::of(&err),
        Some(ProtocolError::ChecksumInvalid { .. })
    ));

    // the intact copy is still queued, nobody read it
    let leftover = transport.receive(Duration::from_millis(10)).await.unwrap();
    assert!(leftover.is_some());
    assert!(transport.receive(Duration::from_millis(10)).await.unwrap().is_none());
}
