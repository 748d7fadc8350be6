use crate::call::{CallController, CallState, CallSession, Command, PhoneState};
use crate::error::Error;
use tokio::sync::{mpsc, watch};

fn controller_with_state(
    mutate: impl FnOnce(&mut PhoneState),
) -> (CallController, mpsc::UnboundedReceiver<Command>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut state = PhoneState::default();
    mutate(&mut state);
    let (state_tx, state_rx) = watch::channel(state);
    // The last value stays readable after the writer goes away.
    drop(state_tx);
    (CallController::new(cmd_tx, state_rx), cmd_rx)
}

#[test]
fn empty_destination_is_rejected_without_a_command() {
    let (controller, mut cmd_rx) = controller_with_state(|_| {});
    assert!(matches!(
        controller.place_call(""),
        Err(Error::InvalidDestination)
    ));
    assert!(matches!(
        controller.place_call("   "),
        Err(Error::InvalidDestination)
    ));
    assert!(cmd_rx.try_recv().is_err());
}

#[test]
fn place_call_queues_trimmed_destination() {
    let (controller, mut cmd_rx) = controller_with_state(|_| {});
    controller.place_call(" 8181 ").unwrap();
    match cmd_rx.try_recv().unwrap() {
        Command::PlaceCall { destination } => assert_eq!(destination, "8181"),
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn place_call_refused_while_in_call() {
    let (controller, mut cmd_rx) = controller_with_state(|s| s.call = CallState::Connected);
    assert!(matches!(
        controller.place_call("9001"),
        Err(Error::State(_))
    ));
    assert!(cmd_rx.try_recv().is_err());
}

#[test]
fn answer_needs_a_ringing_incoming_call() {
    let (controller, _) = controller_with_state(|_| {});
    assert!(matches!(controller.answer(), Err(Error::State(_))));

    // Outbound ringing is not answerable either.
    let (controller, _) = controller_with_state(|s| {
        s.call = CallState::Ringing;
        s.is_incoming_call = false;
    });
    assert!(matches!(controller.answer(), Err(Error::State(_))));

    let (controller, mut cmd_rx) = controller_with_state(|s| {
        s.call = CallState::Ringing;
        s.is_incoming_call = true;
        s.incoming_call_number = "9001".to_string();
    });
    controller.answer().unwrap();
    assert!(matches!(cmd_rx.try_recv().unwrap(), Command::Answer));
}

#[test]
fn hangup_and_reject_need_an_active_call() {
    let (controller, _) = controller_with_state(|_| {});
    assert!(matches!(controller.hang_up(), Err(Error::State(_))));
    assert!(matches!(controller.reject(), Err(Error::State(_))));

    let (controller, mut cmd_rx) = controller_with_state(|s| s.call = CallState::Calling);
    controller.hang_up().unwrap();
    assert!(matches!(cmd_rx.try_recv().unwrap(), Command::HangUp));
}

#[test]
fn hold_is_idempotent_and_state_checked() {
    let (controller, mut cmd_rx) = controller_with_state(|s| s.call = CallState::Held);
    // Requesting the state we are already in is a quiet success.
    controller.hold().unwrap();
    assert!(cmd_rx.try_recv().is_err());

    let (controller, mut cmd_rx) = controller_with_state(|s| s.call = CallState::Connected);
    controller.resume().unwrap();
    assert!(cmd_rx.try_recv().is_err());

    let (controller, _) = controller_with_state(|_| {});
    assert!(matches!(controller.hold(), Err(Error::State(_))));
    assert!(matches!(controller.resume(), Err(Error::State(_))));

    let (controller, mut cmd_rx) = controller_with_state(|s| s.call = CallState::Connected);
    controller.hold().unwrap();
    assert!(matches!(cmd_rx.try_recv().unwrap(), Command::Hold));
}

#[test]
fn mute_and_speaker_always_queue() {
    let (controller, mut cmd_rx) = controller_with_state(|_| {});
    controller.toggle_mute().unwrap();
    controller.toggle_speaker().unwrap();
    assert!(matches!(cmd_rx.try_recv().unwrap(), Command::ToggleMute));
    assert!(matches!(cmd_rx.try_recv().unwrap(), Command::ToggleSpeaker));
}

#[test]
fn session_connect_stamps_start_time_once() {
    let mut session = CallSession::outbound("call-1".to_string(), "8181".to_string());
    assert_eq!(session.state, CallState::Calling);
    assert!(session.started_at.is_none());
    session.connect();
    let first = session.started_at.unwrap();
    session.connect();
    assert_eq!(session.started_at.unwrap(), first);
    session.end(CallState::Ended);
    assert!(session.state.is_terminal());
}

#[test]
fn default_state_matches_idle_softphone() {
    let state = PhoneState::default();
    assert_eq!(state.call, CallState::Idle);
    assert_eq!(state.call_status, "Idle");
    assert_eq!(state.registration_status, "Not Registered");
    assert!(!state.is_incoming_call);
    assert!(state.call_duration().is_none());
}
