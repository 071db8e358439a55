mod common;

use callbridge_server::registry::SessionRegistry;
use callbridge_server::session::{BridgeSettings, CallSession, SessionHandle, WireCommand};
use callbridge_types::{BridgeEvent, CallState, OutboundFrame};
use callbridge_voice::{BackendCommand, BackendEvent, SideAction};
use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct Call {
    handle: SessionHandle,
    wire: mpsc::Receiver<WireCommand>,
    events: broadcast::Receiver<BridgeEvent>,
    actions: Arc<RecordingActionSink>,
}

fn spawn_call(
    stream_id: &str,
    connector: Arc<MockConnector>,
    registry: &SessionRegistry,
    settings: BridgeSettings,
) -> Call {
    let (deps, events, actions) = deps(connector, registry.clone(), settings);
    let (wire_tx, wire) = mpsc::channel(64);
    let (session, handle) = CallSession::new(&start_envelope(stream_id), tenant(), wire_tx, deps);
    registry.insert(handle.clone()).unwrap();
    tokio::spawn(session.run());
    Call {
        handle,
        wire,
        events,
        actions,
    }
}

async fn closed(handle: &SessionHandle) {
    tokio::time::timeout(WAIT, handle.closed())
        .await
        .expect("session did not close");
}

fn media_frame(stream_id: &str, payload: String) -> WireCommand {
    WireCommand::Frame(OutboundFrame::Media {
        stream_id: stream_id.to_string(),
        payload,
    })
}

#[tokio::test]
async fn start_media_stop_walks_every_state_once() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();
    let mut call = spawn_call("S1", connector.clone(), &registry, settings);

    for seq in 1..=3 {
        call.handle
            .on_media(media("S1", silence(), Some(seq)))
            .await
            .unwrap();
    }

    let mut backend = next_backend(&mut backends).await;
    assert_eq!(backend.config.tenant_id, "acme");
    assert_eq!(backend.config.call_id, "CA-S1");
    assert_eq!(backend.config.voice, "alloy");
    assert_eq!(backend.config.sample_rate, 8_000);
    assert!(backend.config.instructions.contains("Ava"));

    for _ in 0..3 {
        assert_eq!(
            next_command(&mut backend.peer).await,
            BackendCommand::AppendAudio(forwarded(&settings, &silence()))
        );
    }

    call.handle.on_stop().await.unwrap();
    assert_eq!(next_command(&mut backend.peer).await, BackendCommand::Close);
    closed(&call.handle).await;

    assert_eq!(
        drain_transitions(&mut call.events, "S1"),
        vec![
            (CallState::Starting, CallState::Active),
            (CallState::Active, CallState::Draining),
            (CallState::Draining, CallState::Closed),
        ]
    );
    // A provider stop needs no stop frame back, only the connection close.
    assert_eq!(next_wire(&mut call.wire).await, WireCommand::Close);
    assert!(registry.is_empty());
    assert_eq!(connector.connects(), 1);
    assert!(call.handle.on_media(media("S1", silence(), None)).await.is_err());
}

#[tokio::test]
async fn caller_speech_cancels_backend_before_forwarding() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();
    let mut call = spawn_call("S1", connector, &registry, settings);

    let mut backend = next_backend(&mut backends).await;
    wait_for_state(&mut call.events, "S1", CallState::Active).await;

    let events = &backend.peer.events;
    events.send(BackendEvent::ResponseStarted).await.unwrap();
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(1_000, 160)))
        .await
        .unwrap();
    assert_eq!(
        next_wire(&mut call.wire).await,
        media_frame("S1", assistant_wire_payload(1_000, 160))
    );

    // Quiet caller audio does not interrupt.
    call.handle.on_media(media("S1", silence(), None)).await.unwrap();
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &silence()))
    );

    call.handle.on_media(media("S1", loud(), None)).await.unwrap();
    assert_eq!(next_command(&mut backend.peer).await, BackendCommand::CancelResponse);
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &loud()))
    );
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Clear {
            stream_id: "S1".to_string()
        })
    );
    wait_for_event(&mut call.events, |e| {
        matches!(e, BridgeEvent::Interrupted { stream_id } if stream_id == "S1")
    })
    .await;

    // Output already in flight from the cancelled response never reaches the wire.
    let events = &backend.peer.events;
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(2_000, 160)))
        .await
        .unwrap();
    events.send(BackendEvent::ResponseDone).await.unwrap();
    events.send(BackendEvent::ResponseStarted).await.unwrap();
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(3_000, 160)))
        .await
        .unwrap();
    events.send(BackendEvent::ResponseDone).await.unwrap();

    assert_eq!(
        next_wire(&mut call.wire).await,
        media_frame("S1", assistant_wire_payload(3_000, 160))
    );
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Mark {
            stream_id: "S1".to_string(),
            name: "response-1".to_string()
        })
    );
}

#[tokio::test]
async fn speech_during_pending_playback_clears_without_cancel() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();
    let mut call = spawn_call("S1", connector, &registry, settings);
    let mut backend = next_backend(&mut backends).await;

    let events = &backend.peer.events;
    events.send(BackendEvent::ResponseStarted).await.unwrap();
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(1_000, 160)))
        .await
        .unwrap();
    events.send(BackendEvent::ResponseDone).await.unwrap();
    assert!(matches!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Media { .. })
    ));
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Mark {
            stream_id: "S1".to_string(),
            name: "response-1".to_string()
        })
    );

    // The response is fully generated but the provider is still playing it.
    call.handle.on_media(media("S1", loud(), None)).await.unwrap();
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &loud()))
    );
    assert_eq!(
        call.wire.try_recv().unwrap(),
        WireCommand::Frame(OutboundFrame::Clear {
            stream_id: "S1".to_string()
        })
    );

    // Once playback reaches the mark, loud caller audio is just audio.
    let events = &backend.peer.events;
    events.send(BackendEvent::ResponseStarted).await.unwrap();
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(1_000, 160)))
        .await
        .unwrap();
    events.send(BackendEvent::ResponseDone).await.unwrap();
    next_wire(&mut call.wire).await;
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Mark {
            stream_id: "S1".to_string(),
            name: "response-2".to_string()
        })
    );
    call.handle.on_mark("response-2".to_string()).await.unwrap();
    call.handle.on_media(media("S1", loud(), None)).await.unwrap();
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &loud()))
    );
    assert!(call.wire.try_recv().is_err());
}

#[tokio::test]
async fn idle_active_session_closes_without_stop() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = BridgeSettings {
        idle_timeout: Duration::from_millis(150),
        ..settings()
    };
    let mut call = spawn_call("S1", connector, &registry, settings);
    let _backend = next_backend(&mut backends).await;

    closed(&call.handle).await;

    assert_eq!(
        drain_transitions(&mut call.events, "S1"),
        vec![
            (CallState::Starting, CallState::Active),
            (CallState::Active, CallState::Draining),
            (CallState::Draining, CallState::Closed),
        ]
    );
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
    assert_eq!(next_wire(&mut call.wire).await, WireCommand::Close);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn backend_loss_closes_only_that_session() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();

    let mut doomed = spawn_call("S1", connector.clone(), &registry, settings);
    let first = next_backend(&mut backends).await;
    let mut survivor = spawn_call("S2", connector.clone(), &registry, settings);
    let second = next_backend(&mut backends).await;

    let (doomed_backend, mut survivor_backend) = if first.config.call_id == "CA-S1" {
        (first, second)
    } else {
        (second, first)
    };

    wait_for_state(&mut survivor.events, "S2", CallState::Active).await;
    drop(doomed_backend);
    closed(&doomed.handle).await;

    assert_eq!(
        drain_transitions(&mut doomed.events, "S1").last(),
        Some(&(CallState::Draining, CallState::Closed))
    );
    assert_eq!(
        next_wire(&mut doomed.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
    assert!(!registry.contains("S1"));

    assert!(registry.contains("S2"));
    assert_eq!(survivor.handle.state(), CallState::Active);
    survivor
        .handle
        .on_media(media("S2", silence(), None))
        .await
        .unwrap();
    assert_eq!(
        next_command(&mut survivor_backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &silence()))
    );
}

#[tokio::test]
async fn refused_backend_ends_call_from_starting() {
    let registry = SessionRegistry::new();
    let (connector, _backends) = MockConnector::refusing();
    let mut call = spawn_call("S1", connector.clone(), &registry, settings());

    closed(&call.handle).await;

    assert_eq!(
        drain_transitions(&mut call.events, "S1"),
        vec![
            (CallState::Starting, CallState::Draining),
            (CallState::Draining, CallState::Closed),
        ]
    );
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
    assert_eq!(connector.connects(), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn slow_backend_times_out_in_starting() {
    let registry = SessionRegistry::new();
    let (connector, _backends) = MockConnector::slow(Duration::from_secs(30));
    let settings = BridgeSettings {
        starting_timeout: Duration::from_millis(100),
        ..settings()
    };
    let mut call = spawn_call("S1", connector, &registry, settings);

    closed(&call.handle).await;
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
    assert!(registry.is_empty());
}

#[tokio::test]
async fn media_during_starting_is_buffered_in_order() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::slow(Duration::from_millis(200));
    let settings = BridgeSettings {
        starting_buffer_frames: 2,
        ..settings()
    };
    let mut call = spawn_call("S1", connector, &registry, settings);

    let early = [payload_of(0xF0), payload_of(0xE0), payload_of(0xD0)];
    for payload in &early {
        call.handle
            .on_media(media("S1", payload.clone(), None))
            .await
            .unwrap();
    }
    wait_for_event(&mut call.events, |e| {
        matches!(e, BridgeEvent::FrameDropped { reason, .. } if reason == "starting_buffer_full")
    })
    .await;

    let mut backend = next_backend(&mut backends).await;
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &early[0]))
    );
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &early[1]))
    );

    call.handle
        .on_media(media("S1", payload_of(0xC0), None))
        .await
        .unwrap();
    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &payload_of(0xC0)))
    );
}

#[tokio::test]
async fn undecodable_frame_is_dropped_and_call_continues() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();
    let mut call = spawn_call("S1", connector, &registry, settings);
    let mut backend = next_backend(&mut backends).await;

    call.handle
        .on_media(media("S1", "%%% not base64 %%%".to_string(), None))
        .await
        .unwrap();
    call.handle
        .on_media(media("S1", String::new(), None))
        .await
        .unwrap();
    call.handle.on_media(media("S1", silence(), None)).await.unwrap();

    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(forwarded(&settings, &silence()))
    );
    let dropped = wait_for_event(&mut call.events, |e| {
        matches!(e, BridgeEvent::FrameDropped { .. })
    })
    .await;
    assert_eq!(dropped.stream_id(), "S1");
    assert_eq!(call.handle.state(), CallState::Active);
}

#[tokio::test]
async fn sequence_gap_is_reported_but_frame_forwarded() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();
    let mut call = spawn_call("S1", connector, &registry, settings);
    let mut backend = next_backend(&mut backends).await;

    for seq in [1, 2, 5] {
        call.handle
            .on_media(media("S1", silence(), Some(seq)))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        assert!(matches!(
            next_command(&mut backend.peer).await,
            BackendCommand::AppendAudio(_)
        ));
    }

    let gap = wait_for_event(&mut call.events, |e| {
        matches!(e, BridgeEvent::SequenceGap { .. })
    })
    .await;
    assert_eq!(
        gap,
        BridgeEvent::SequenceGap {
            stream_id: "S1".to_string(),
            expected: 3,
            actual: 5,
        }
    );
}

#[tokio::test]
async fn backend_hangup_flushes_then_ends_call() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let mut call = spawn_call("S1", connector, &registry, settings());
    let mut backend = next_backend(&mut backends).await;

    let events = &backend.peer.events;
    events.send(BackendEvent::ResponseStarted).await.unwrap();
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(1_000, 160)))
        .await
        .unwrap();
    events.send(BackendEvent::Hangup).await.unwrap();
    events
        .send(BackendEvent::AudioDelta(assistant_pcm(1_500, 160)))
        .await
        .unwrap();
    events.send(BackendEvent::ResponseDone).await.unwrap();

    assert_eq!(
        next_wire(&mut call.wire).await,
        media_frame("S1", assistant_wire_payload(1_000, 160))
    );
    assert_eq!(
        next_wire(&mut call.wire).await,
        media_frame("S1", assistant_wire_payload(1_500, 160))
    );
    assert_eq!(next_command(&mut backend.peer).await, BackendCommand::Close);
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
    assert_eq!(next_wire(&mut call.wire).await, WireCommand::Close);
    closed(&call.handle).await;
}

#[tokio::test]
async fn side_actions_reach_sink_and_are_acknowledged() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let mut call = spawn_call("S1", connector, &registry, settings());
    let mut backend = next_backend(&mut backends).await;

    backend
        .peer
        .events
        .send(BackendEvent::Action(SideAction {
            call_id: "fc_1".to_string(),
            name: "save_note".to_string(),
            arguments: json!({ "text": "call back after 5" }),
        }))
        .await
        .unwrap();

    assert_eq!(
        next_command(&mut backend.peer).await,
        BackendCommand::ActionResult {
            call_id: "fc_1".to_string(),
            output: json!({ "status": "queued" }),
        }
    );
    wait_for_event(&mut call.events, |e| {
        matches!(e, BridgeEvent::ActionDispatched { name, .. } if name == "save_note")
    })
    .await;

    tokio::time::timeout(WAIT, async {
        while call.actions.seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("action never reached the sink");
    let seen = call.actions.seen.lock().unwrap();
    let (context, action) = &seen[0];
    assert_eq!(context.tenant_id, "acme");
    assert_eq!(context.call_id, "CA-S1");
    assert_eq!(context.stream_id, "S1");
    assert_eq!(action.arguments["text"], "call back after 5");
}

#[tokio::test]
async fn fatal_backend_error_ends_call_but_warnings_do_not() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = settings();
    let call = spawn_call("S1", connector, &registry, settings);
    let mut backend = next_backend(&mut backends).await;

    backend
        .peer
        .events
        .send(BackendEvent::Error {
            message: "rate limited".to_string(),
            fatal: false,
        })
        .await
        .unwrap();
    call.handle.on_media(media("S1", silence(), None)).await.unwrap();
    assert!(matches!(
        next_command(&mut backend.peer).await,
        BackendCommand::AppendAudio(_)
    ));
    assert_eq!(call.handle.state(), CallState::Active);

    backend
        .peer
        .events
        .send(BackendEvent::Error {
            message: "session expired".to_string(),
            fatal: true,
        })
        .await
        .unwrap();
    closed(&call.handle).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn force_close_ends_active_session() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let mut call = spawn_call("S1", connector, &registry, settings());
    let _backend = next_backend(&mut backends).await;
    wait_for_state(&mut call.events, "S1", CallState::Active).await;

    call.handle.force_close();
    closed(&call.handle).await;
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
}

#[tokio::test]
async fn backend_that_stops_reading_ends_the_call() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let mut call = spawn_call("S1", connector, &registry, settings());
    // Held open but never read, so its command queue fills and stays full.
    let _backend = next_backend(&mut backends).await;
    wait_for_state(&mut call.events, "S1", CallState::Active).await;

    let handle = call.handle.clone();
    let paced = async move {
        while handle.on_media(media("S1", silence(), None)).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, paced)
        .await
        .expect("session kept accepting media from a stalled backend");

    closed(&call.handle).await;
    wait_for_event(&mut call.events, |e| {
        matches!(e, BridgeEvent::FrameDropped { reason, .. } if reason == "backend_backpressure")
    })
    .await;
    assert_eq!(
        next_wire(&mut call.wire).await,
        WireCommand::Frame(OutboundFrame::Stop {
            stream_id: "S1".to_string()
        })
    );
    assert_eq!(next_wire(&mut call.wire).await, WireCommand::Close);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn stop_is_honoured_while_backend_queue_is_full() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let settings = BridgeSettings {
        stall_timeout: Duration::from_secs(10),
        ..settings()
    };
    let mut call = spawn_call("S1", connector, &registry, settings);
    let _backend = next_backend(&mut backends).await;
    wait_for_state(&mut call.events, "S1", CallState::Active).await;

    for seq in 1..=70 {
        call.handle
            .on_media(media("S1", silence(), Some(seq)))
            .await
            .unwrap();
    }
    call.handle.on_stop().await.unwrap();

    closed(&call.handle).await;
    assert_eq!(
        drain_transitions(&mut call.events, "S1"),
        vec![
            (CallState::Active, CallState::Draining),
            (CallState::Draining, CallState::Closed),
        ]
    );
    assert_eq!(next_wire(&mut call.wire).await, WireCommand::Close);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn provider_that_stops_draining_ends_the_call() {
    let registry = SessionRegistry::new();
    let (connector, mut backends) = MockConnector::new();
    let (deps, _events, _actions) = deps(connector, registry.clone(), settings());
    // Room for one frame, and nobody writing it out.
    let (wire_tx, mut wire) = mpsc::channel(1);
    let (session, handle) = CallSession::new(&start_envelope("S1"), tenant(), wire_tx, deps);
    registry.insert(handle.clone()).unwrap();
    tokio::spawn(session.run());

    let backend = next_backend(&mut backends).await;
    backend.peer.events.send(BackendEvent::ResponseStarted).await.unwrap();
    for _ in 0..3 {
        backend
            .peer
            .events
            .send(BackendEvent::AudioDelta(assistant_pcm(1_000, 160)))
            .await
            .unwrap();
    }

    closed(&handle).await;
    assert!(registry.is_empty());
    assert_eq!(
        next_wire(&mut wire).await,
        media_frame("S1", assistant_wire_payload(1_000, 160))
    );
    // The stalled connection is abandoned, not sent a stop or close.
    assert!(wire.recv().await.is_none());
}
