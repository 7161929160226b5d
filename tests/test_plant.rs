mod common;
use common::*;

use chrono::{NaiveDate, TimeZone, Utc};
use sma_bridge::coordinator::commands::archive_events::ArchiveEvents;
use sma_bridge::coordinator::plant::{Cycle, Plant, Settings, Target};
use sma_bridge::coordinator::session::SessionState;
use sma_bridge::coordinator::PacketStats;
use sma_bridge::export;
use sma_bridge::sma::exchange::{Exchange, SessionContext};
use sma_bridge::sma::lri::{CMD_DAY_ARCHIVE, CMD_DEVICE_LIST, CMD_EVENTS_USER, DEVICE_LIST_FIRST};
use sma_bridge::sma::packet::{Telegram, CMD_IDENTIFY, CMD_LOGOFF, CMD_LOGON};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TYPE_LABEL: (u32, u32) = (0x5800_0200, 0x0082_1E00);

fn context() -> SessionContext {
    SessionContext::new(Connection::Speedwire, Duration::from_millis(10), 3)
}

fn settings() -> Settings {
    Settings {
        user_group: UserGroup::User,
        password: "0000".to_string(),
        archive_days: 1,
        archive_months: 0,
        archive_events_months: 0,
    }
}

fn plant(settings: Settings) -> (Plant, Arc<Mutex<PacketStats>>) {
    let stats = Arc::new(Mutex::new(PacketStats::default()));
    (Plant::new(settings, stats.clone()), stats)
}

/// Answers identify, logon and everything else the way a healthy
/// inverter does; `extra` gets the first say.
fn inverter<F>(mut extra: F) -> impl FnMut(&Telegram, &Address) -> Vec<Telegram> + Send
where
    F: FnMut(&Telegram) -> Option<Vec<Telegram>> + Send,
{
    move |request, _| {
        if let Some(replies) = extra(request) {
            return replies;
        }
        let me = Factory::inverter();
        match (request.command(), request.word(4)) {
            (Some(CMD_IDENTIFY), Some(0)) => vec![Factory::reply(request, me, Factory::records(&[]))],
            (Some(CMD_LOGON), _) => vec![Factory::reply(request, me, request.payload.clone())],
            (Some(CMD_LOGOFF), _) => Vec::new(),
            _ => vec![Factory::reply(request, me, Factory::records(&[]))],
        }
    }
}

#[tokio::test]
async fn invalid_password_stops_the_device_before_any_data() -> Result<()> {
    common_setup();

    let mut transport = MockTransport::new(inverter(|request| {
        (request.command() == Some(CMD_LOGON))
            .then(|| vec![Factory::error_reply(request, Factory::inverter(), 0x0100)])
    }));
    let (mut plant, stats) = plant(settings());

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
    plant
        .run(&mut exchange, &[Target::new(Factory::ip(10))], Cycle::Full, now)
        .await?;

    assert_eq!(transport.sent_commands(), vec![CMD_IDENTIFY, CMD_LOGON, CMD_LOGOFF]);
    assert_eq!(stats.lock().unwrap().invalid_passwords, 1);

    let device = plant.registry.find(&Factory::inverter()).unwrap();
    assert_eq!(device.state, SessionState::LoggedOut);
    assert!(device.day.is_none());
    Ok(())
}

#[tokio::test]
async fn nobody_answering_is_an_init_failure() {
    common_setup();

    let mut transport = MockTransport::new(|_, _| Vec::new());
    let (mut plant, _) = plant(settings());

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let err = plant
        .run(&mut exchange, &[Target::new(Factory::ip(10))], Cycle::Live, Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(ProtocolError::of(&err), Some(ProtocolError::InitFailed(_))));
    assert!(plant.registry.is_empty());
}

#[tokio::test]
async fn event_paging_stops_at_the_first_record() -> Result<()> {
    common_setup();

    let mut page = 0;
    let mut transport = MockTransport::new(move |request, _| {
        page += 1;
        let events = match page {
            1 => vec![Factory::event(1_717_000_500, 5, 101), Factory::event(1_717_000_400, 4, 102)],
            2 => vec![Factory::event(1_714_000_200, 2, 103), Factory::event(1_714_000_100, 1, 104)],
            _ => vec![Factory::event(1_710_000_000, 9, 105)],
        };
        vec![Factory::reply(request, Factory::inverter(), Factory::records(&events))]
    });

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let events = ArchiveEvents::new(Factory::inverter(), Factory::ip(10), UserGroup::User, (2024, 6), 6)
        .run(&mut exchange)
        .await?;

    assert_eq!(transport.count(CMD_EVENTS_USER), 2);
    assert_eq!(events.len(), 4);
    assert_eq!(
        events.iter().map(|e| e.event_code).collect::<Vec<_>>(),
        vec![104, 103, 102, 101]
    );
    Ok(())
}

#[tokio::test]
async fn event_log_denied_to_user_group() {
    common_setup();

    let mut transport = MockTransport::new(|request, _| {
        vec![Factory::error_reply(request, Factory::inverter(), 0x0017)]
    });

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let err = ArchiveEvents::new(Factory::inverter(), Factory::ip(10), UserGroup::User, (2024, 6), 2)
        .run(&mut exchange)
        .await
        .unwrap_err();

    assert_eq!(ProtocolError::of(&err), Some(&ProtocolError::PrivilegeDenied));
}

#[tokio::test]
async fn every_gateway_logs_on_its_children() -> Result<()> {
    common_setup();

    let gateways = [
        (Factory::ip(2), Identity::new(0x00A0, 1_900_000_001)),
        (Factory::ip(3), Identity::new(0x00A0, 1_900_000_002)),
    ];
    let children = [
        vec![Identity::new(0x0083, 2_100_000_011), Identity::new(0x0083, 2_100_000_012)],
        vec![Identity::new(0x0083, 2_100_000_021), Identity::new(0x0083, 2_100_000_022)],
    ];

    let responder_children = children.clone();
    let mut transport = MockTransport::new(move |request, to| {
        let source = if request.header.destination.is_any() {
            gateways
                .iter()
                .find(|(address, _)| address == to)
                .map(|(_, identity)| *identity)
                .unwrap_or(Identity::ANY)
        } else {
            request.header.destination
        };
        let gateway = gateways.iter().position(|(_, identity)| *identity == source);

        let payload = match (request.command(), request.word(4)) {
            (Some(CMD_IDENTIFY), Some(0)) => Factory::records(&[]),
            (Some(CMD_LOGON), _) => request.payload.clone(),
            (Some(CMD_LOGOFF), _) => return Vec::new(),
            (Some(CMD_DEVICE_LIST), Some(DEVICE_LIST_FIRST)) => {
                let list: Vec<Vec<u8>> = gateway
                    .map(|g| responder_children[g].iter().map(|c| Factory::child(*c, 1)).collect())
                    .unwrap_or_default();
                Factory::records(&list)
            }
            (Some(command), Some(first)) if (command, first) == TYPE_LABEL => match gateway {
                Some(_) => Factory::records(&Factory::type_label("SMA Com Gateway", 8128)),
                None => Factory::records(&Factory::type_label("SB 3000HF-30", 8001)),
            },
            _ => Factory::records(&[]),
        };
        vec![Factory::reply(request, source, payload)]
    });

    let (mut plant, _) = plant(settings());
    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let targets: Vec<Target> = gateways.iter().map(|(address, _)| Target::new(*address)).collect();
    plant
        .run(&mut exchange, &targets, Cycle::Live, Utc::now())
        .await?;

    let registry = &plant.registry;
    assert_eq!(registry.len(), 6);
    assert_eq!(registry.gateways().len(), 2);

    for (g, (address, identity)) in gateways.iter().enumerate() {
        let gateway = registry.find(identity).unwrap();
        assert_eq!(gateway.class, DeviceClass::CommunicationProduct);

        let found: Vec<Identity> = registry.children_of(gateway.index).map(|d| d.identity).collect();
        assert_eq!(found, children[g]);
        for child in registry.children_of(gateway.index) {
            assert_eq!(child.address, *address);
            assert_eq!(child.class, DeviceClass::SolarInverter);
            assert_eq!(child.state, SessionState::LoggedOut);
        }
    }

    assert_eq!(transport.count(CMD_LOGON), 6);
    assert_eq!(transport.count(CMD_LOGOFF), 6);
    assert_eq!(
        transport
            .sent
            .iter()
            .filter(|t| t.command() == Some(CMD_DEVICE_LIST) && t.word(4) == Some(DEVICE_LIST_FIRST))
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn day_archive_reaches_the_exporters() -> Result<()> {
    common_setup();

    let date = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
    let ten = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap().timestamp() as u32;

    let mut transport = MockTransport::new(inverter(move |request| {
        (request.command() == Some(CMD_DAY_ARCHIVE)).then(|| {
            let samples = vec![
                Factory::archive_sample(ten, 1_000),
                Factory::archive_sample(ten + 300, 1_100),
                Factory::archive_sample(ten + 600, 1_250),
            ];
            vec![Factory::reply(request, Factory::inverter(), Factory::records(&samples))]
        })
    }));

    let exporters = broadcast::channel::<export::ChannelData>(16).0;
    let mut published = exporters.subscribe();
    let (plant, stats) = plant(settings());
    let mut plant = plant.with_exporters(exporters);

    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
    plant
        .run(&mut exchange, &[Target::new(Factory::ip(10))], Cycle::Archive, now)
        .await?;

    let export::ChannelData::Day(device, day) = published.recv().await? else {
        panic!("expected a day archive");
    };
    assert_eq!(device.serial, Factory::inverter().serial);
    assert_eq!(day.date, date);
    assert!(day.has_data);

    let slots: Vec<(usize, u64, i64)> = day
        .filled()
        .map(|(idx, slot)| (idx, slot.total_wh, slot.watt))
        .collect();
    assert_eq!(slots, vec![(120, 1_000, 0), (121, 1_100, 1_200), (122, 1_250, 1_800)]);

    assert_eq!(transport.count(CMD_DAY_ARCHIVE), 1);
    assert_eq!(stats.lock().unwrap().day_archives, 1);
    Ok(())
}

#[tokio::test]
async fn rejected_logon_is_not_repeated_for_gateway_children() -> Result<()> {
    common_setup();

    let gateway = (Factory::ip(2), Identity::new(0x00A0, 1_900_000_001));
    let inverter = (Factory::ip(10), Factory::inverter());
    let child = Identity::new(0x0083, 2_100_000_011);

    let mut transport = MockTransport::new(move |request, to| {
        let source = if request.header.destination.is_any() {
            if *to == gateway.0 { gateway.1 } else { inverter.1 }
        } else {
            request.header.destination
        };

        let payload = match (request.command(), request.word(4)) {
            (Some(CMD_IDENTIFY), Some(0)) => Factory::records(&[]),
            (Some(CMD_LOGON), _) if source == inverter.1 => {
                return vec![Factory::error_reply(request, source, 0x0100)];
            }
            (Some(CMD_LOGON), _) => request.payload.clone(),
            (Some(CMD_LOGOFF), _) => return Vec::new(),
            (Some(CMD_DEVICE_LIST), Some(DEVICE_LIST_FIRST)) if source == gateway.1 => {
                Factory::records(&[Factory::child(child, 1)])
            }
            (Some(command), Some(first)) if (command, first) == TYPE_LABEL && source == gateway.1 => {
                Factory::records(&Factory::type_label("SMA Com Gateway", 8128))
            }
            (Some(command), Some(first)) if (command, first) == TYPE_LABEL => {
                Factory::records(&Factory::type_label("SB 3000HF-30", 8001))
            }
            _ => Factory::records(&[]),
        };
        vec![Factory::reply(request, source, payload)]
    });

    let (mut plant, stats) = plant(settings());
    let ctx = context();
    let mut exchange = Exchange::new(&ctx, &mut transport);
    plant
        .run(
            &mut exchange,
            &[Target::new(gateway.0), Target::new(inverter.0)],
            Cycle::Live,
            Utc::now(),
        )
        .await?;

    let logons_to = |identity: Identity| {
        transport
            .sent
            .iter()
            .filter(|t| t.command() == Some(CMD_LOGON) && t.header.destination == identity)
            .count()
    };
    assert_eq!(logons_to(inverter.1), 1);
    assert_eq!(logons_to(gateway.1), 1);
    assert_eq!(logons_to(child), 1);
    assert_eq!(stats.lock().unwrap().invalid_passwords, 1);

    assert_eq!(plant.registry.len(), 3);
    let rejected = plant.registry.find(&inverter.1).unwrap();
    assert_eq!(rejected.state, SessionState::LoggedOut);
    Ok(())
}
