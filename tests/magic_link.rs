//! End-to-end behaviour of the magic link over an in-memory bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rusty_connector::config::FamilyConfig;
use rusty_connector::error::{AdmissionError, LinkError, PacketError, RoutingError, VerificationError};
use rusty_connector::events::LeaveReason;
use rusty_connector::family::{LockState, ServerRegistration};
use rusty_connector::link::SessionState;
use rusty_connector::packet::{codec, LinkKey, Packet, PacketIdentification, PacketState};
use rusty_connector::{LoaderSettings, ProxyEvent};
use uuid::Uuid;

mod common;

use common::{config, drain, eventually, Network};

#[tokio::test(start_paused = true)]
async fn test_loader_registers_and_heartbeats_player_count() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let loader = net.join("lobby").await;
    assert_eq!(loader.state(), SessionState::Registered);

    let family = net.proxy.families().family("lobby").unwrap();
    assert!(family.contains(loader.id()));
    assert_eq!(net.proxy.sessions().state(loader.id()), SessionState::Registered);

    loader.set_player_count(7);
    tokio::time::sleep(Duration::from_secs(6)).await;
    let record = net.proxy.families().record(loader.id()).unwrap();
    assert_eq!(record.player_count(), 7);

    loader.stop().await;
}

#[tokio::test]
async fn test_fourth_registration_past_hard_cap_is_rejected() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby").with_caps(2, 3)]));
    let mut events = net.events();

    let mut loaders = Vec::new();
    for _ in 0..3 {
        let loader = net.join("lobby").await;
        assert_eq!(loader.state(), SessionState::Registered);
        loaders.push(loader);
    }
    let fourth = net.join("lobby").await;
    assert_eq!(fourth.state(), SessionState::Rejected);
    assert_eq!(net.proxy.sessions().state(fourth.id()), SessionState::Rejected);

    let family = net.proxy.families().family("lobby").unwrap();
    assert_eq!(family.member_count(), 3);
    assert!(!family.contains(fourth.id()));

    let events = drain(&mut events);
    let breaches = events
        .iter()
        .filter(|e| matches!(e, ProxyEvent::SoftCapBreached { members: 3, .. }))
        .count();
    assert_eq!(breaches, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        ProxyEvent::RegistrationRejected {
            loader_id,
            reason: AdmissionError::HardCapExceeded { hard_cap: 3, .. },
        } if *loader_id == fourth.id()
    )));

    // Rejected loaders do not retry on their own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fourth.state(), SessionState::Rejected);
    assert_eq!(family.member_count(), 3);
}

#[tokio::test]
async fn test_unknown_family_is_rejected() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let loader = net.join("nowhere").await;
    assert_eq!(loader.state(), SessionState::Rejected);
    assert_eq!(net.proxy.families().server_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_loader_times_out_and_is_evicted() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let mut events = net.events();

    let loader = net.join("lobby").await;
    let id = loader.id();

    // Two heartbeats (5 s, 10 s) keep the 15 s window open.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(net.proxy.sessions().state(id), SessionState::Registered);
    assert!(net.proxy.families().family("lobby").unwrap().contains(id));

    // Gone without deregistering: 16+ s of silence since the last heartbeat.
    drop(loader);
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert_eq!(net.proxy.sessions().state(id), SessionState::TimedOut);
    assert!(!net.proxy.families().family("lobby").unwrap().contains(id));
    let events = drain(&mut events);
    assert!(events.contains(&ProxyEvent::SessionTimedOut { loader_id: id }));
    assert!(events.contains(&ProxyEvent::ServerUnregistered {
        family: "lobby".into(),
        server_id: id,
        reason: LeaveReason::TimedOut,
    }));
}

#[tokio::test]
async fn test_stop_deregisters_synchronously_with_proxy() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let loader = net.join("lobby").await;
    let id = loader.id();

    loader.stop().await;
    loader.stop().await;
    assert_eq!(loader.state(), SessionState::Deregistered);

    eventually(|| net.proxy.sessions().state(id) == SessionState::Deregistered).await;
    assert!(!net.proxy.families().family("lobby").unwrap().contains(id));
}

#[tokio::test]
async fn test_duplicate_lock_is_idempotent() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let loader = net.join("lobby").await;
    let mut events = net.events();

    loader.lock().await.unwrap();
    loader.lock().await.unwrap();
    let family = net.proxy.families().family("lobby").unwrap();
    eventually(|| family.lock_state(loader.id()) == Some(LockState::Locked)).await;
    // Give the second packet time to land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(family.lock_state(loader.id()), Some(LockState::Locked));
    let locked = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ProxyEvent::ServerLocked { .. }))
        .count();
    assert_eq!(locked, 1);

    // Both requests were handled successfully.
    let failed = net
        .proxy
        .channel()
        .cache()
        .messages()
        .iter()
        .filter(|m| m.status != rusty_connector::cache::MessageStatus::Sent)
        .count();
    assert_eq!(failed, 0);
}

#[tokio::test]
async fn test_lock_excludes_from_selection_without_evicting_players() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let a = net.join("lobby").await;
    let b = net.join("lobby").await;

    let player = Uuid::new_v4();
    let first = net.proxy.connect_player(player, "Steve", Some("lobby")).unwrap();
    let (locked, open) = if first.server_id == a.id() { (&a, &b) } else { (&b, &a) };

    net.proxy.lock_server(locked.id()).await.unwrap();
    eventually(|| locked.is_locked()).await;

    // Still assigned to the locked server.
    let online = net.proxy.players().get(player).unwrap();
    assert_eq!(online.assignment.unwrap().server_id, locked.id());

    for _ in 0..20 {
        let assignment = net
            .proxy
            .connect_player(Uuid::new_v4(), "Alex", Some("lobby"))
            .unwrap();
        assert_eq!(assignment.server_id, open.id());
    }

    net.proxy.unlock_server(locked.id()).await.unwrap();
    eventually(|| !locked.is_locked()).await;
    let picked: Vec<Uuid> = (0..10)
        .map(|_| {
            net.proxy
                .connect_player(Uuid::new_v4(), "Alex", Some("lobby"))
                .unwrap()
                .server_id
        })
        .collect();
    assert!(picked.contains(&locked.id()));

    assert!(matches!(
        net.proxy.lock_server(Uuid::new_v4()).await,
        Err(LinkError::Routing(RoutingError::UnknownServer(_)))
    ));
}

#[tokio::test]
async fn test_weighted_selection_converges_to_weights() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby").with_caps(10, 10)]));
    let families = net.proxy.families();

    let light = Uuid::new_v4();
    let heavy = Uuid::new_v4();
    families
        .register_server(&ServerRegistration::new(light, "lobby", "a:1").with_weight(1))
        .unwrap();
    families
        .register_server(&ServerRegistration::new(heavy, "lobby", "b:1").with_weight(3))
        .unwrap();

    let family = families.family("lobby").unwrap();
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for _ in 0..4000 {
        *counts.entry(family.select().unwrap().server_id).or_default() += 1;
    }
    let share = counts[&heavy] as f64 / 4000.0;
    assert!((share - 0.75).abs() < 0.01, "heavy share was {}", share);
}

#[tokio::test]
async fn test_admission_holds_exactly_under_hard_cap() {
    let net = Network::start(config(vec![FamilyConfig::new("arena").with_caps(1, 2)]));
    let families = net.proxy.families();

    let mut admitted = Vec::new();
    for i in 0..5 {
        let id = Uuid::new_v4();
        let before = families.family("arena").unwrap().member_count();
        match families.register_server(&ServerRegistration::new(id, "arena", format!("s{}:1", i))) {
            Ok(admission) => {
                assert!(before < 2);
                assert_eq!(admission.soft_cap_breached, before >= 1);
                admitted.push(id);
            }
            Err(AdmissionError::HardCapExceeded { hard_cap, .. }) => {
                assert_eq!(before, 2);
                assert_eq!(hard_cap, 2);
            }
            Err(other) => panic!("unexpected rejection: {}", other),
        }
    }
    assert_eq!(admitted.len(), 2);

    // Leaving frees a slot.
    families.unregister_server(admitted[0], LeaveReason::Deregistered);
    assert!(families
        .register_server(&ServerRegistration::new(Uuid::new_v4(), "arena", "late:1"))
        .is_ok());
}

#[tokio::test]
async fn test_membership_reflects_last_admit_or_evict() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby").with_caps(8, 8)]));
    let families = Arc::clone(net.proxy.families());
    let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

    // (server index, admit?) applied in order; the last op per server wins.
    let ops = [
        (0, true),
        (1, true),
        (0, false),
        (2, true),
        (1, false),
        (1, true),
        (3, true),
        (2, false),
        (0, true),
        (3, false),
    ];
    for (index, admit) in ops {
        if admit {
            families
                .register_server(&ServerRegistration::new(ids[index], "lobby", "x:1"))
                .unwrap();
        } else {
            families.unregister_server(ids[index], LeaveReason::Deregistered);
        }
    }

    let family = families.family("lobby").unwrap();
    let expected = [true, true, false, false];
    for (id, present) in ids.iter().zip(expected) {
        assert_eq!(family.contains(*id), present);
        assert_eq!(families.family_of(*id).is_some(), present);
    }
    assert_eq!(family.member_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admit_and_evict_leave_no_partial_membership() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby").with_caps(8, 8)]));
    let families = Arc::clone(net.proxy.families());
    let family = families.family("lobby").unwrap();
    let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

    for _ in 0..500 {
        let mut tasks = Vec::new();
        for id in ids.iter().copied() {
            let admitting = Arc::clone(&families);
            tasks.push(tokio::spawn(async move {
                let _ = admitting.register_server(&ServerRegistration::new(id, "lobby", "x:1"));
            }));
            let evicting = Arc::clone(&families);
            tasks.push(tokio::spawn(async move {
                evicting.unregister_server(id, LeaveReason::Deregistered);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for id in &ids {
            assert_eq!(family.contains(*id), families.family_of(*id).is_some());
            let copies = family
                .snapshot()
                .iter()
                .filter(|m| m.record.server_id == *id)
                .count();
            assert!(copies <= 1);
        }
        assert_eq!(family.member_count(), families.server_count());
    }
}

#[test]
fn test_mutation_after_signing_fails_verification() {
    let key = LinkKey::generate();
    let mut packet = Packet::builder(Uuid::new_v4())
        .identification(PacketIdentification::REGISTER_SERVER)
        .payload("family", "lobby")
        .payload("address", "10.0.0.1:25565")
        .build()
        .unwrap();
    packet.sign(&key).unwrap();
    let text = codec::encode(&packet).unwrap();

    let genuine = codec::decode(&text).unwrap();
    assert_eq!(genuine.verify(&key.verifying_key()), Ok(()));

    let tampered = codec::decode(&text.replace("lobby", "admin")).unwrap();
    assert_eq!(tampered.payload().get_str("family"), Some("admin"));
    assert_eq!(
        tampered.verify(&key.verifying_key()),
        Err(VerificationError::BadSignature)
    );
}

#[tokio::test]
async fn test_packet_is_never_sent_twice() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby")]));
    let loader = net.loader(LoaderSettings::new("lobby", "127.0.0.1:25565"));
    let channel = loader.channel();

    let mut packet = channel
        .builder()
        .identification(PacketIdentification::HEARTBEAT)
        .build()
        .unwrap();
    channel.publish(&mut packet).await.unwrap();
    assert_eq!(packet.state(), PacketState::Sent);
    assert!(matches!(
        channel.publish(&mut packet).await,
        Err(LinkError::Packet(PacketError::NotSendable(PacketState::Sent)))
    ));
}

#[tokio::test]
async fn test_displaced_players_are_caught_by_root() {
    let mut lobby = FamilyConfig::new("lobby");
    lobby.catch_disconnecting_players = true;
    let net = Network::start(config(vec![lobby, FamilyConfig::new("arena").with_parent("lobby")]));
    let mut events = net.events();

    let arena = net.join("arena").await;
    let hub = net.join("lobby").await;

    let player = Uuid::new_v4();
    let assignment = net.proxy.connect_player(player, "Steve", Some("arena")).unwrap();
    assert_eq!(assignment.server_id, arena.id());

    arena.stop().await;
    eventually(|| {
        net.proxy
            .players()
            .get(player)
            .and_then(|p| p.assignment)
            .is_some_and(|a| a.server_id == hub.id())
    })
    .await;

    assert!(drain(&mut events).contains(&ProxyEvent::LoaderLeave {
        server_id: arena.id(),
        player,
    }));
}

#[tokio::test]
async fn test_send_player_request_moves_player() {
    let net = Network::start(config(vec![FamilyConfig::new("lobby"), FamilyConfig::new("arena")]));
    let lobby = net.join("lobby").await;
    let arena = net.join("arena").await;

    let player = Uuid::new_v4();
    net.proxy.connect_player(player, "Steve", Some("lobby")).unwrap();
    lobby.send_player(player, "arena").await.unwrap();

    eventually(|| {
        net.proxy
            .players()
            .get(player)
            .and_then(|p| p.assignment)
            .is_some_and(|a| a.server_id == arena.id())
    })
    .await;
}
