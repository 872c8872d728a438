mod support;

use aura_live::controller::SessionEvent;
use aura_live::transport::{ServerMessage, SessionState, TransportEvent};
use support::{pcm_payload, Harness};

#[tokio::test]
async fn silent_frames_out_payloads_in_then_clean_disconnect() {
    let mut h = Harness::new();
    h.speaker.set_now(2.0);

    h.controller.connect().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connecting);
    h.remote.server_send(TransportEvent::Open);
    h.step().await;
    assert_eq!(h.controller.state(), SessionState::Connected);

    for _ in 0..3 {
        assert!(h.mic.capture(vec![0.0; 4096]));
        h.step().await;
    }
    let sent = h.remote.sent();
    assert_eq!(sent.len(), 3);
    for frame in &sent {
        assert_eq!(frame.data.len(), 8192);
        assert!(frame.data.iter().all(|&b| b == 0));
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
    }

    // 4800 bytes = 2400 samples = 0.1 s at 24 kHz; 9600 bytes = 0.2 s.
    for bytes in [4800, 9600] {
        h.remote.server_send(TransportEvent::Message(ServerMessage {
            audio: Some(pcm_payload(bytes)),
            ..Default::default()
        }));
        h.step().await;
    }
    let starts = h.speaker.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].0, 2.0);
    assert!((starts[1].0 - 2.1).abs() < 1e-9);
    assert!((starts[1].1 - 0.2).abs() < 1e-9);
    assert!((h.controller.playback_cursor() - 2.3).abs() < 1e-9);

    h.controller.disconnect();
    assert_eq!(h.controller.state(), SessionState::Disconnected);
    assert_eq!(h.controller.playback_cursor(), 0.0);
    assert!(!h.controller.is_active());

    // Nothing reaches the wire after teardown.
    assert!(!h.mic.capture(vec![0.0; 4096]));
    assert_eq!(h.remote.sent().len(), 3);

    h.controller.disconnect();
    assert_eq!(h.remote.closes(), 1);
    assert_eq!(h.mic.stops(), 1);
    assert_eq!(h.speaker.closes(), 1);

    let stats = h.controller.stats();
    assert_eq!(stats.frames_sent, 3);
    assert_eq!(stats.bytes_sent, 3 * 8192);
    assert_eq!(stats.payloads_scheduled, 2);

    let states: Vec<SessionState> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Disconnected
        ]
    );
}

#[tokio::test]
async fn reconnect_starts_a_fresh_timeline() {
    let mut h = Harness::new();
    h.speaker.set_now(5.0);
    h.open().await;
    h.remote.server_send(TransportEvent::Message(ServerMessage {
        audio: Some(pcm_payload(48_000)),
        ..Default::default()
    }));
    h.step().await;
    assert!((h.controller.playback_cursor() - 6.0).abs() < 1e-9);
    h.controller.disconnect();

    h.speaker.set_now(5.5);
    h.open().await;
    assert_eq!(h.controller.playback_cursor(), 0.0);
    h.remote.server_send(TransportEvent::Message(ServerMessage {
        audio: Some(pcm_payload(4800)),
        ..Default::default()
    }));
    h.step().await;
    assert_eq!(h.speaker.starts().last().unwrap().0, 5.5);
    assert_eq!(h.remote.connects(), 2);
    assert_eq!(h.speaker.opens(), 2);
}
