mod common;

use core::time::Duration;

use button_core::orchestrator::{PowerTransition, WakeReason};
use button_core::state::Storage;
use button_core::telemetry::TelemetryEventKind;

use common::{SimPlatform, boot, provisioned_state, run_until_transition, storage_with};

fn timer_wake_with(messages: &[(&str, &str)]) -> (SimPlatform, PowerTransition, usize) {
    let mut platform = SimPlatform::new(storage_with(&provisioned_state()), WakeReason::Timer);
    for (topic, payload) in messages {
        platform.net.broker_mut().deliver(topic, payload);
    }
    let (mut orchestrator, _) = boot(&mut platform);
    let (transition, _) =
        run_until_transition(&mut orchestrator, &mut platform, 0, 10_000).expect("wake ends");
    let applied = orchestrator
        .telemetry()
        .count(TelemetryEventKind::CommandApplied);
    (platform, transition, applied)
}

#[test]
fn sensor_interval_command_is_saved_echoed_and_cleared() {
    let (platform, transition, applied) =
        timer_wake_with(&[("homebuttons/hall/cmd/sensor_interval", "5")]);
    assert_eq!(applied, 1);

    let broker = platform.net.broker();
    assert_eq!(
        broker.payloads_on("homebuttons/hall/sensor_interval"),
        ["10", "5"]
    );
    assert_eq!(
        broker.payloads_on("homebuttons/hall/cmd/sensor_interval"),
        [""]
    );
    // Sensors go out once on connect and once after the interval change.
    assert_eq!(broker.payloads_on("homebuttons/hall/temperature").len(), 2);
    assert!(
        broker
            .published
            .iter()
            .filter(|item| item.topic.as_str() == "homebuttons/hall/cmd/sensor_interval")
            .all(|item| item.retained)
    );

    let PowerTransition::Sleep { wake_after, .. } = transition else {
        panic!("expected sleep, got {transition:?}");
    };
    assert_eq!(wake_after, Some(Duration::from_secs(5 * 60)));
}

#[test]
fn out_of_range_interval_only_clears_the_command() {
    let (platform, _, applied) =
        timer_wake_with(&[("homebuttons/hall/cmd/sensor_interval", "45")]);
    assert_eq!(applied, 0);
    let broker = platform.net.broker();
    assert_eq!(
        broker.payloads_on("homebuttons/hall/cmd/sensor_interval"),
        [""]
    );
    assert_eq!(
        broker.payloads_on("homebuttons/hall/sensor_interval"),
        ["10"]
    );
}

#[test]
fn label_command_updates_label_and_redraws() {
    let (mut platform, _, applied) =
        timer_wake_with(&[("homebuttons/hall/cmd/btn_2_label", "Kitchen lights on")]);
    assert_eq!(applied, 1);

    let broker = platform.net.broker();
    assert_eq!(
        broker.payloads_on("homebuttons/hall/btn_2_label"),
        ["", "Kitchen lights "]
    );
    assert!(platform.display.pages.contains(&common::Page::Main));

    let saved = platform.storage.load_all().expect("record saved");
    assert_eq!(
        saved.prefs.button_label(common::button(2)),
        "Kitchen lights "
    );
}

#[test]
fn awake_mode_on_restarts_silently_into_awake_mode() {
    let (mut platform, transition, applied) =
        timer_wake_with(&[("homebuttons/hall/cmd/awake_mode", "ON")]);
    assert_eq!(applied, 1);
    assert_eq!(transition, PowerTransition::Restart);

    let broker = platform.net.broker();
    assert_eq!(broker.payloads_on("homebuttons/hall/awake_mode"), ["OFF", "ON"]);
    assert_eq!(broker.payloads_on("homebuttons/hall/cmd/awake_mode"), [""]);

    let saved = platform.storage.load_all().expect("record saved");
    assert!(saved.persisted.user_awake_mode);
    assert!(saved.persisted.silent_restart);
}

#[test]
fn cleared_and_foreign_topics_are_ignored() {
    let (platform, _, applied) = timer_wake_with(&[
        ("homebuttons/hall/cmd/awake_mode", ""),
        ("homebuttons/kitchen/cmd/awake_mode", "ON"),
    ]);
    assert_eq!(applied, 0);
    assert!(
        platform
            .net
            .broker()
            .payloads_on("homebuttons/hall/cmd/awake_mode")
            .is_empty()
    );
}
