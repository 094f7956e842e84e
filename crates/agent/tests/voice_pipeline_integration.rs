//! End-to-end turn handling against scripted providers

mod common;

use std::time::Duration;

use common::*;
use voice_turn_agent::{SessionEvent, TurnState, VoiceSessionState};
use voice_turn_core::Role;
use voice_turn_pipeline::CircuitState;

const WAIT: Duration = Duration::from_secs(5);

fn finish(h: &mut Harness) {
    h.events.drain();
    h.events.assert_valid_paths();
    h.events.assert_nested_utterances();
}

#[tokio::test]
async fn test_end_of_turn_after_silence() {
    let mut h = default_session(RecordingSink::new()).await;

    h.caller.speak(2000).await;
    h.caller.pause(800).await;

    let ended = h
        .events
        .wait_for(WAIT, |e| matches!(e, SessionEvent::UtteranceEnded { .. }))
        .await;
    match ended {
        SessionEvent::UtteranceEnded { at_ms, .. } => assert_eq!(at_ms, 2700),
        other => panic!("unexpected event {:?}", other),
    }
    let started = h
        .events
        .wait_for(WAIT, |e| matches!(e, SessionEvent::UtteranceStarted { .. }))
        .await;
    assert!(matches!(started, SessionEvent::UtteranceStarted { at_ms: 0, .. }));

    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    finish(&mut h);
    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::UtteranceEnded { .. })),
        1
    );
}

#[tokio::test]
async fn test_single_turn_round_trip() {
    let mut h = default_session(RecordingSink::new()).await;

    h.caller.utterance(1000).await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    finish(&mut h);

    assert!(h.events.seen().contains(&SessionEvent::FinalTranscript {
        turn_id: 1,
        text: "hello".to_string(),
    }));
    assert!(h.events.seen().contains(&SessionEvent::ResponseChunk {
        turn_id: 1,
        text: REPLY.to_string(),
    }));
    assert!(h.events.seen().contains(&SessionEvent::AgentSpeaking {
        turn_id: 1,
        provider: Harness::primary_id(),
    }));
    assert!(h.events.errors().is_empty());

    // Every synthesized frame reached the transport, in order
    assert_eq!(h.sink.values(), h.primary.emitted());
    let frames = h.sink.frames();
    assert_eq!(frames.len(), 5);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.sequence(), i as u64);
        assert_eq!(frame.timestamp_ms(), i as u64 * FRAME_MS);
    }

    assert_eq!(h.primary.texts(), vec![REPLY.to_string()]);
    assert!(h.fallback.texts().is_empty());
    assert_eq!(h.model.requests()[0].1, "hello");

    let history = h.session.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user, "hello");
    assert_eq!(history[0].agent, REPLY);

    h.session.end("test complete").await;
    assert_eq!(h.session.state(), VoiceSessionState::Ended);
}

#[tokio::test]
async fn test_partial_transcripts_are_published() {
    let mut h = default_session(RecordingSink::new()).await;

    h.caller.utterance(1200).await;
    h.events
        .wait_for(WAIT, |e| matches!(e, SessionEvent::PartialTranscript { .. }))
        .await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    finish(&mut h);
}

#[tokio::test]
async fn test_failover_before_audio_is_seamless() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&[]),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 5, vec![SynthCall::Reject]),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    h.caller.utterance(1000).await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    finish(&mut h);

    assert!(h.events.errors().is_empty());
    assert!(h.events.seen().contains(&SessionEvent::AgentSpeaking {
        turn_id: 1,
        provider: Harness::fallback_id(),
    }));
    assert_eq!(h.primary.texts(), vec![REPLY.to_string()]);
    assert_eq!(h.fallback.texts(), vec![REPLY.to_string()]);
    assert_eq!(h.sink.values(), h.fallback.emitted());

    let primary = h.session.provider_health(&Harness::primary_id()).await.unwrap();
    assert_eq!(primary.consecutive_failures(), 1);
    assert_eq!(primary.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_failure_after_audio_speaks_apology() {
    let config = test_config();
    let apology = config.synthesis.apology_phrase.clone();
    let mut h = start_session(
        config,
        ScriptedRecognizer::new(&[]),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 5, vec![SynthCall::FailAfter(3)]),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    h.caller.utterance(1000).await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Failed);
    finish(&mut h);

    assert_eq!(h.events.errors().len(), 1);
    // The response is not replayed on the fallback, only the apology
    assert_eq!(h.primary.texts(), vec![REPLY.to_string()]);
    assert_eq!(h.fallback.texts(), vec![apology]);

    let values = h.sink.values();
    assert_eq!(values.len(), 8);
    assert_eq!(values[..3], h.primary.emitted()[..]);
    assert_eq!(values[3..], h.fallback.emitted()[..]);

    let primary = h.session.provider_health(&Harness::primary_id()).await.unwrap();
    assert_eq!(primary.consecutive_failures(), 1);
    assert_eq!(primary.total_failures(), 1);

    // Part of the response was heard, so it stays in context
    assert_eq!(h.session.history().await.len(), 1);
}

#[tokio::test]
async fn test_barge_in_cancels_speaking_turn() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&["what are your hours", "actually never mind"]),
        ScriptedModel::new(vec![ModelReply::text(
            "We open at nine. We close at six. Weekends are by appointment.",
        )]),
        ScriptedSynth::new(0.1, 60, Vec::new()),
        ScriptedSynth::new(0.5, 60, Vec::new()),
        RecordingSink::with_delay(Duration::from_millis(10)),
    )
    .await;

    h.caller.utterance(1000).await;
    h.events
        .wait_for(WAIT, |e| {
            matches!(e, SessionEvent::AgentSpeaking { turn_id: 1, .. })
        })
        .await;
    h.events
        .wait_for(WAIT, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    turn_id: 1,
                    new: TurnState::Synthesizing,
                    ..
                }
            )
        })
        .await;

    // Clear of the settle window before the caller talks over the agent
    h.caller.pause(400).await;
    h.caller.speak(300).await;

    let barged = h
        .events
        .wait_for(WAIT, |e| matches!(e, SessionEvent::BargedIn { turn_id: 1, .. }))
        .await;
    let delivered = h.sink.len();
    match barged {
        SessionEvent::BargedIn { at_ms, .. } => assert_eq!(at_ms, 2200),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.events.turn_finished(1).await, TurnState::Cancelled);

    // The interrupting utterance opens the next turn right away
    h.events
        .wait_for(WAIT, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    turn_id: 2,
                    new: TurnState::AwaitingUtteranceEnd,
                    ..
                }
            )
        })
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.sink.len() <= delivered + 1, "audio kept playing after barge-in");
    assert!(h.sink.len() < 60);

    h.caller.pause(800).await;
    assert_eq!(h.events.turn_finished(2).await, TurnState::Completed);
    finish(&mut h);
    assert!(h.events.errors().is_empty());

    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1, "actually never mind");
    let history = h.session.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].user, "what are your hours");
    // Only the sentence the caller heard before cutting in is remembered
    assert_eq!(history[0].agent, "We open at nine.");
    assert_eq!(requests[1].0.last().unwrap().content, "We open at nine.");
}

#[tokio::test]
async fn test_speech_while_transcribing_does_not_cancel_turn() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&["what are your hours"]).with_close_delay(Duration::from_millis(100)),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 5, Vec::new()),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    // The caller resumes just after end of turn, before the transcript is back
    h.caller.speak(1000).await;
    h.caller.pause(720).await;
    h.caller.speak(400).await;
    h.caller.pause(800).await;

    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    h.events
        .wait_for(WAIT, |e| {
            matches!(e, SessionEvent::UtteranceEnded { utterance_id: 2, .. })
        })
        .await;
    finish(&mut h);

    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::BargedIn { .. })),
        0
    );
    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::UtteranceStarted { .. })),
        2
    );
    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::TurnFinished { .. })),
        1
    );
    assert_eq!(h.model.requests().len(), 1);
    assert_eq!(h.sink.len(), 5);
    assert_eq!(h.session.history().await.len(), 1);
}

#[tokio::test]
async fn test_forced_end_with_continued_speech_completes_turn() {
    let mut config = test_config();
    config.turn_detection.max_utterance_ms = 1000;
    let mut h = start_session(
        config,
        ScriptedRecognizer::new(&["tell me everything"]).with_close_delay(Duration::from_millis(100)),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 5, Vec::new()),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    h.caller.speak(1500).await;
    h.caller.pause(800).await;

    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    let ended = h
        .events
        .wait_for(WAIT, |e| {
            matches!(e, SessionEvent::UtteranceEnded { utterance_id: 1, .. })
        })
        .await;
    assert!(matches!(ended, SessionEvent::UtteranceEnded { at_ms: 1000, .. }));
    h.events
        .wait_for(WAIT, |e| {
            matches!(e, SessionEvent::UtteranceEnded { utterance_id: 2, .. })
        })
        .await;
    finish(&mut h);

    assert!(h.events.seen().contains(&SessionEvent::UtteranceStarted {
        utterance_id: 2,
        at_ms: 1000,
    }));
    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::BargedIn { .. })),
        0
    );
    assert_eq!(h.model.requests().len(), 1);
    assert_eq!(h.model.requests()[0].1, "tell me everything");
    assert_eq!(h.sink.len(), 5);
}

#[tokio::test]
async fn test_echo_inside_settle_window_is_ignored() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&[]),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 30, Vec::new()),
        ScriptedSynth::new(0.5, 30, Vec::new()),
        RecordingSink::with_delay(Duration::from_millis(10)),
    )
    .await;

    h.caller.utterance(1000).await;
    h.events
        .wait_for(WAIT, |e| {
            matches!(e, SessionEvent::AgentSpeaking { turn_id: 1, .. })
        })
        .await;

    // Agent audio leaking back into the microphone right after it starts
    h.caller.speak(200).await;
    h.caller.pause(800).await;

    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    finish(&mut h);
    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::BargedIn { .. })),
        0
    );
    assert_eq!(
        h.events
            .count(|e| matches!(e, SessionEvent::UtteranceStarted { .. })),
        1
    );
    assert_eq!(h.sink.len(), 30);
}

#[tokio::test]
async fn test_open_circuit_skips_failing_provider() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&[]),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(
            0.1,
            5,
            vec![SynthCall::Reject, SynthCall::Reject, SynthCall::Reject],
        ),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    for turn_id in 1..=4 {
        h.caller.pause(400).await;
        h.caller.utterance(600).await;
        assert_eq!(h.events.turn_finished(turn_id).await, TurnState::Completed);
    }
    finish(&mut h);

    assert!(h.events.errors().is_empty());
    // Third rejection opens the circuit; the fourth turn never asks primary
    assert_eq!(h.primary.texts().len(), 3);
    assert_eq!(h.fallback.texts().len(), 4);

    let primary = h.session.provider_health(&Harness::primary_id()).await.unwrap();
    assert_eq!(primary.state(), CircuitState::Open);
    assert_eq!(h.session.history().await.len(), 4);
}

#[tokio::test]
async fn test_transcription_failure_returns_to_idle() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&[]).fail_opens(2),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 5, Vec::new()),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    h.caller.utterance(600).await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Failed);
    h.events
        .wait_for(WAIT, |e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    turn_id: 1,
                    new: TurnState::Idle,
                    ..
                }
            )
        })
        .await;
    assert_eq!(h.sink.len(), 0);

    h.caller.pause(200).await;
    h.caller.utterance(600).await;
    assert_eq!(h.events.turn_finished(2).await, TurnState::Completed);
    finish(&mut h);

    assert_eq!(h.events.errors().len(), 1);
    // Initial open plus one reconnect for the first turn
    assert_eq!(h.recognizer.opens(), 3);
    assert_eq!(h.model.requests().len(), 1);
    assert_eq!(h.session.history().await.len(), 1);
}

#[tokio::test]
async fn test_model_failure_is_silent_and_forgotten() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&["first question", "second question"]),
        ScriptedModel::new(vec![ModelReply::Reject]),
        ScriptedSynth::new(0.1, 5, Vec::new()),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    h.caller.utterance(600).await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Failed);
    assert_eq!(h.sink.len(), 0);
    assert!(h.primary.texts().is_empty());
    assert!(h.session.history().await.is_empty());

    h.caller.pause(200).await;
    h.caller.utterance(600).await;
    assert_eq!(h.events.turn_finished(2).await, TurnState::Completed);
    finish(&mut h);

    // The failed exchange never reaches the model again
    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[1].0.iter().any(|m| m.role == Role::User));
    assert_eq!(requests[1].1, "second question");
}

#[tokio::test]
async fn test_context_carries_previous_exchange() {
    let mut h = start_session(
        test_config(),
        ScriptedRecognizer::new(&["book a table", "for two people"]),
        ScriptedModel::new(vec![
            ModelReply::text("For how many people?"),
            ModelReply::text("Done, see you tonight."),
        ]),
        ScriptedSynth::new(0.1, 5, Vec::new()),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        RecordingSink::new(),
    )
    .await;

    h.caller.utterance(800).await;
    assert_eq!(h.events.turn_finished(1).await, TurnState::Completed);
    h.caller.pause(400).await;
    h.caller.utterance(800).await;
    assert_eq!(h.events.turn_finished(2).await, TurnState::Completed);
    finish(&mut h);

    let requests = h.model.requests();
    let (context, prompt) = &requests[1];
    assert_eq!(prompt, "for two people");
    assert_eq!(context[0].role, Role::System);
    assert_eq!(context[1].role, Role::User);
    assert_eq!(context[1].content, "book a table");
    assert_eq!(context[2].role, Role::Assistant);
    assert_eq!(context[2].content, "For how many people?");
    assert_eq!(context.len(), 3);
}
